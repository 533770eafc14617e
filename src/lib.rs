//! dbgate - Multi-backend query gateway
//!
//! Routes tool invocations to a graph store and several SQL dialects behind
//! per-backend admission limits and bounded connection pools, streaming
//! results back as ordered frames.

pub mod backend;
pub mod backends;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod mcp;
pub mod observe;
pub mod pool;
pub mod registry;
pub mod router;
pub mod row;
pub mod schema;
pub mod statement;
pub mod transcoder;
