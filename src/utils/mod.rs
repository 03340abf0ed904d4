pub mod fingerprint;
pub mod json;
pub mod validation;
