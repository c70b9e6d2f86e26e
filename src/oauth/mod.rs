pub mod endpoints;
pub mod project_resolver;
pub mod token_lifecycle;

pub use project_resolver::ProjectResolver;
pub use token_lifecycle::{AuthCache, refresh};
