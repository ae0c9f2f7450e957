mod pool;
mod state;

pub use pool::{Credential, CredentialPool, PoolError};
pub use state::{CredentialId, CredentialState, UnavailableReason};
