//! WebSocket alert stream

mod handler;

pub use handler::{ws_handler, WsServerMessage};
