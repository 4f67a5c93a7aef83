//! MCP/SSE transport: a tool catalog for LLM clients over HTTP.
//!
//! Three endpoints: `GET /sse` streams bus events as MCP notifications,
//! `POST /message` answers JSON-RPC (`initialize`, `tools/list`,
//! `tools/call`), `GET /health` answers `ok`. Tool failures come back as MCP
//! tool-error results, never HTTP errors.

mod server;
mod tools;

pub use server::serve;
