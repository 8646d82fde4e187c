pub mod book;
pub mod catalog;
pub mod config;
pub mod ledger;
pub mod reporter;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod types;
pub mod wire;

/// Gateway REST base URL (market catalog + snapshot backends, no auth required)
pub const GATEWAY_BASE: &str = "https://gateway.polyterminal.app";

/// Trade stream WebSocket URL (live order events)
pub const STREAM_WS_URL: &str = "wss://stream.polyterminal.app/v1";
