//! Dashboard API
//!
//! REST endpoints over the runner's dashboard and wallet state, plus a
//! WebSocket stream of live alerts.

pub mod routes;
pub mod server;
pub mod ws;

pub use server::{create_app, AppState};
