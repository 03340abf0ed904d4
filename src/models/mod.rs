pub mod history;
pub mod knowledge_point;
pub mod question;
