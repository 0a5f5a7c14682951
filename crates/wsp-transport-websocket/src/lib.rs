//! WebSocket transport implementation using tokio-tungstenite
//!
//! Browsers and other sandboxed peers cannot open raw TCP sockets but can
//! speak WebSocket. This crate accepts WebSocket upgrades (optionally over
//! TLS via rustls) and turns each one into a [`wsp_transport::TunnelConnection`].
//!
//! # Role negotiation
//!
//! The peer declares the connection's role in the `Sec-WebSocket-Protocol`
//! header: `control` or `data`. The first recognised value is echoed back in
//! the handshake response. Upgrades offering no known role are refused with
//! `400 Bad Request` and never reach the gateway.
//!
//! Text and binary messages are both delivered to the gateway unchanged.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::WebSocketConfig;
pub use connection::WebSocketConnection;
pub use listener::WebSocketListener;
