use crate::models::question::{CandidateQuestion, Question};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Serialize)]
struct HashPayload<'a> {
    content_en: &'a str,
    options: Vec<&'a str>,
}

/// sha256 over `{"content_en": .., "options": [..]}` with every piece trimmed.
/// Field order is fixed by the struct, so the digest is stable.
pub fn content_options_hash<S: AsRef<str>>(content_en: &str, options_en: &[S]) -> String {
    let payload = HashPayload {
        content_en: content_en.trim(),
        options: options_en.iter().map(|o| o.as_ref().trim()).collect(),
    };
    // Serializing a struct of strings cannot fail.
    let json = serde_json::to_string(&payload).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

pub trait Fingerprinted {
    /// Stored hash if present, otherwise computed from the English content and options.
    fn fingerprint(&self) -> String;
}

impl Fingerprinted for Question {
    fn fingerprint(&self) -> String {
        match &self.content_options_hash {
            Some(h) if !h.is_empty() => h.clone(),
            _ => content_options_hash(&self.content_en, &self.options.en),
        }
    }
}

impl Fingerprinted for CandidateQuestion {
    fn fingerprint(&self) -> String {
        if self.content_options_hash.is_empty() {
            content_options_hash(&self.content_en, &self.options.en)
        } else {
            self.content_options_hash.clone()
        }
    }
}

/// Keep the first item per fingerprint, preserving order.
pub fn unique_by_hash<T: Fingerprinted>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.fingerprint()))
        .collect()
}
