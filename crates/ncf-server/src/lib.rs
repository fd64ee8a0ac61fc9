//! REST and WebSocket façade over the backup engine.
//!
//! Thin by design: handlers validate, call the engine or the repository
//! layer, and shape responses. All orchestration lives in `ncf-core`.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod ws;

pub use routes::router;
pub use state::AppState;
