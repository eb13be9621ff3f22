//! MCP gateway: many tool servers behind one stdio endpoint
//!
//! The transport layer speaks to individual MCP servers over stdio,
//! SSE, or streamable HTTP. The router aggregates their tools into one
//! catalog, the gateway serves that catalog over JSON-RPC, and the
//! daemon multiplexes any number of local clients onto a single shared
//! fleet through a Unix socket.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod gateway;
pub mod handlers;
pub mod logstore;
pub mod protocol;
pub mod router;
pub mod transport;
