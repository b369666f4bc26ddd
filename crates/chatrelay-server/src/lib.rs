pub mod connection;
pub mod server;

pub use connection::ConnectionConfig;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
