//! mcp-probe library
//!
//! Building blocks for exercising an MCP server over stdio:
//!
//! - `ipc` - process transport, stderr drain and the correlated call layer
//! - `protocol` - JSON-RPC 2.0 envelopes and reply correlation
//! - `models` - compact tool result decoding and traversal artifacts
//!
//! # Example
//!
//! ```ignore
//! use mcp_probe::ipc::{ClientConfig, McpClient};
//!
//! let mut client = McpClient::spawn(&server, ClientConfig::default())?;
//! client.initialize().await?;
//! for tool in client.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await;
//! ```

pub mod ipc;
pub mod models;
pub mod protocol;
