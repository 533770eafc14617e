//! MCP tool implementations organized by concern.

pub mod backends;
pub mod query;
