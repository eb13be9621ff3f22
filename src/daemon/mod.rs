//! Daemon multiplexer: one process owns the backend fleet, any number of
//! local clients share it over a Unix socket.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{DaemonClient, DaemonConnection, DaemonReceiver, DaemonSender, McpFrame};
pub use server::GatewayDaemon;
