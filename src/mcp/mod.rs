//! Model Context Protocol (MCP) session layer for dbgate.
//!
//! Thin tool handlers over the [`Router`](crate::router::Router): each tool
//! call becomes one invocation whose frames are collected into a single
//! tool result.
//!
//! ## Modules
//!
//! - `server`: MCP server implementation with tool router
//! - `protocol`: response formatting (JSON or TOON)
//! - `tools`: tool implementations

pub mod protocol;
pub(crate) mod server;
mod tools;

pub use server::McpServer;
