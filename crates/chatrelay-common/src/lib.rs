mod config;
mod tokens;

pub use config::{GlobalConfig, GlobalConfigError};
pub use tokens::estimate_tokens;

/// Index of a credential's position in the pool's insertion order.
/// Never logged alongside the credential value itself.
pub type CredentialId = usize;
