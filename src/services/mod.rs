pub mod ai_service;
pub mod assembler_service;
pub mod embed_service;
pub mod generation_service;
pub mod metadata_service;
pub mod planner_service;
pub mod prompts;
pub mod selector_service;
pub mod similarity_service;
