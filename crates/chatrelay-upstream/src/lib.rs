pub mod antibot;
pub mod classify;
pub mod client;
pub mod credential;
pub mod errors;
pub mod session;

pub use classify::{classify, TaskStatus, UpstreamEvent};
pub use client::{SseStream, UpstreamClientConfig, UpstreamHttpClient};
pub use credential::{Credential, CredentialId, CredentialPool, CredentialState, PoolError, UnavailableReason};
pub use errors::{TransportErrorKind, UpstreamError};
pub use session::SessionRegistry;
