pub mod auth;
pub mod catalog;
pub mod error;
pub mod handlers;
pub mod server;

pub use auth::{AllowAll, AuthGate, WalletAuthGate};
pub use catalog::ModelCatalog;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
