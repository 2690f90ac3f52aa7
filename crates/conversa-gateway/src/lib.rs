//! HTTP surface over the session coordinator: session reads, the explicit
//! restore endpoint, transcript management, and the cleanup trigger.

pub mod server;

pub use server::{ApiError, AppState, GatewayServer};
