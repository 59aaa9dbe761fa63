//! IPC client for talking to an MCP server over its standard streams.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐        stdin / stdout        ┌─────────────────────┐
//! │   mcp-probe     │  ◄──────────────────────────►│   MCP server        │
//! │   (McpClient)   │   JSON-RPC 2.0, one per line │   (child process)   │
//! └─────────────────┘                              └─────────────────────┘
//!          ▲                     stderr                      │
//!          └───────────── StderrDrain (background) ◄─────────┘
//! ```
//!
//! # Protocol
//!
//! Each message is a single JSON object terminated by `\n`:
//!
//! ```text
//! {"jsonrpc":"2.0","method":"tools/list","id":2}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mcp_probe::ipc::{ClientConfig, McpClient};
//! use serde_json::json;
//!
//! let mut client = McpClient::spawn(&server, ClientConfig::default())?;
//! client.initialize().await?;
//! let result = client.call_tool("macos-use_refresh_traversal", json!({"pid": 42})).await?;
//! client.close().await;
//! ```

mod client;
mod framing;
mod stderr;
mod transport;

pub use client::{CallState, ClientConfig, IpcError, McpClient, ToolService};
pub use framing::{read_line, write_line};
pub use stderr::{StderrBuffer, StderrDrain, STDERR_REPORT_LINES, STDERR_RETAINED_LINES};
pub use transport::ProcessTransport;
