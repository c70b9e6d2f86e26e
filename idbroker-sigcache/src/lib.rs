pub mod cache;
pub mod family;
pub mod sanitizer;

pub use cache::{CacheKey, DiskTier, SignatureCache, fingerprint_text};
pub use family::ModelFamily;
pub use sanitizer::{SanitizeOutcome, SanitizerConfig, sanitize_cross_model_payload};
