//! Transport boundary: WebSocket accept endpoint and per-connection pumps.

pub mod server;
