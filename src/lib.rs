// Library half of AutoSync: models, realtime sync core and shared helpers
pub mod config;
pub mod display;
pub mod error;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use config::ClientConfig;
pub use error::{ClientError, RequestFailure};
pub use models::*;
pub use sync::{ConnectionManager, Dispatcher, HttpApi, MessageLog, Reconciler, StreamEvent};
