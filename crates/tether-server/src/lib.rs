pub mod error;
pub mod event_bridge;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
