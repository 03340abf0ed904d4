use reqwest::Client;
use serde_json::json;
use tutor_pool::error::Error;
use tutor_pool::services::ai_service::{AIService, LlmProvider};
use tutor_pool::services::embed_service::{
    EmbedMode, EmbedService, MetadataFilter, VectorIndex, VectorRecord,
};
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_reply(content: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

#[tokio::test]
async fn chat_client_requests_json_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "temperature": 0,
            "response_format": {"type": "json_object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply(r#"{"questions": []}"#)))
        .expect(1)
        .mount(&server)
        .await;

    let svc = AIService::new("sk-test".into(), "gpt-test".into(), format!("{}/v1/", server.uri()), Client::new());
    let text = svc.complete_json("system", "user", 100).await.expect("completion");
    assert_eq!(text, r#"{"questions": []}"#);
}

#[tokio::test]
async fn chat_client_retries_without_json_mode_when_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("response_format"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(r#"{"error": "Unrecognized request argument: response_format"}"#),
        )
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("{}")))
        .expect(1)
        .mount(&server)
        .await;

    let svc = AIService::new("k".into(), "m".into(), server.uri(), Client::new());
    let text = svc.complete_json("s", "u", 50).await.expect("retry succeeds");
    assert_eq!(text, "{}");
}

#[tokio::test]
async fn chat_client_surfaces_provider_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let svc = AIService::new("k".into(), "m".into(), server.uri(), Client::new());
    let err = svc.complete_json("s", "u", 50).await.expect_err("429");
    assert!(matches!(err, Error::Generation(ref m) if m.contains("429")));
}

fn embed_service(server: &MockServer) -> EmbedService {
    EmbedService::new(
        "pc-key".into(),
        server.uri(),
        server.uri(),
        "embed-test".into(),
        Client::new(),
    )
}

#[tokio::test]
async fn embed_sends_input_type_and_parses_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .and(header("Api-Key", "pc-key"))
        .and(body_partial_json(json!({
            "model": "embed-test",
            "parameters": {"input_type": "passage", "truncate": "END"},
            "inputs": [{"text": "a"}, {"text": "b"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"values": [0.1, 0.2]}, {"values": [0.3, 0.4]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let vecs = embed_service(&server)
        .embed(&["a".to_string(), "b".to_string()], EmbedMode::Passage)
        .await
        .expect("embeddings");
    assert_eq!(vecs, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
}

#[tokio::test]
async fn query_filters_by_grade_and_subject() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({
            "topK": 3,
            "includeMetadata": true,
            "filter": {
                "kind": {"$eq": "question_metadata"},
                "grade_id": {"$eq": 3},
                "subject_id": {"$eq": 1}
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matches": [{"id": "qmeta:9", "score": 0.97, "metadata": {"question_id": 9}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let matches = embed_service(&server)
        .query_by_vector(&[0.5, 0.5], 3, &MetadataFilter::new(3, 1))
        .await
        .expect("query");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].question_id(), Some(9));
    assert!((matches[0].score - 0.97).abs() < 1e-6);
}

#[tokio::test]
async fn upsert_strips_null_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/vectors/upsert"))
        .and(body_partial_json(json!({
            "vectors": [{"id": "qmeta:5", "metadata": {"kind": "question_metadata", "question_id": 5}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"upsertedCount": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let record = VectorRecord {
        id: "qmeta:5".into(),
        values: vec![0.1, 0.2],
        metadata: Some(json!({"kind": "question_metadata", "question_id": 5, "expression": null})),
    };
    embed_service(&server)
        .upsert_vectors(vec![record])
        .await
        .expect("upsert");

    let received = server.received_requests().await.expect("recorded requests");
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body["vectors"][0]["metadata"].get("expression").is_none());
}

#[tokio::test]
async fn index_errors_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let result = embed_service(&server)
        .query_by_vector(&[1.0], 3, &MetadataFilter::new(1, 1))
        .await;
    assert!(result.is_err());
}
