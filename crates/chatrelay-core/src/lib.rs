pub mod auth;
pub mod chat_engine;
pub mod error;
pub mod handler;
pub mod image_engine;
pub mod janitor;
pub mod models;
pub mod preprocessor;
pub mod router;
pub mod sink;
pub mod state;
pub mod toolcall;
pub mod translator;
pub mod wire;

pub use error::CoreError;
pub use router::build_router;
pub use state::Runtime;
