//! MCP client for JSON-RPC 2.0 over a child process's stdio.
//!
//! This module provides `McpClient`, which owns a spawned server, performs
//! the `initialize` handshake, and turns each call into exactly one
//! request/response round trip with a bound on wall-clock wait time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ipc::stderr::{StderrBuffer, STDERR_REPORT_LINES, STDERR_RETAINED_LINES};
use crate::ipc::transport::ProcessTransport;
use crate::models::{InitializeResult, ToolDescriptor, ToolResult};
use crate::protocol::{methods, Correlation, Envelope, Response, MCP_PROTOCOL_VERSION};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default time the server gets to exit after stdin is closed.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Transport-level failures.
///
/// Tool-level errors (`status: error`) are not represented here; they are
/// ordinary data on [`ToolResult`].
#[derive(Debug, Error)]
pub enum IpcError {
    /// The server executable is missing or could not be started.
    #[error("Failed to launch {}: {reason}", path.display())]
    Launch { path: PathBuf, reason: String },

    /// No reply arrived within the deadline.
    #[error("No response from server after {0:?}")]
    Timeout(Duration),

    /// The server closed its stdout; the session is over.
    #[error("Server closed the connection: {0}")]
    PeerClosed(String),

    /// A reply line was not valid JSON-RPC.
    #[error("Malformed response ({reason}): {line}")]
    MalformedResponse { line: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Writing to the server's stdin failed.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Local protocol misuse (serialization, use after close).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl IpcError {
    /// Failures after which the session cannot continue.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, IpcError::Launch { .. } | IpcError::PeerClosed(_) | IpcError::Io(_))
    }
}

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-call wait for a reply.
    pub timeout: Duration,
    /// How long the server gets to exit on `close` before it is killed.
    pub shutdown_grace: Duration,
    /// stderr lines kept in memory.
    pub stderr_retained: usize,
    /// stderr lines included in failure reports.
    pub stderr_report: usize,
    /// `clientInfo.name` sent in `initialize`.
    pub client_name: String,
    /// `clientInfo.version` sent in `initialize`.
    pub client_version: String,
    /// Extra environment variables for the server process.
    pub env: Vec<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            stderr_retained: STDERR_RETAINED_LINES,
            stderr_report: STDERR_REPORT_LINES,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            env: Vec::new(),
        }
    }
}

/// Where the most recent call ended up.
///
/// Each call starts from `Idle`, moves to `Sent` once the request is written,
/// and ends in exactly one of the remaining states. A request that could not
/// be written ends in `WriteFailed` without passing through `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Sent,
    WriteFailed,
    Completed,
    TimedOut,
    PeerClosed,
    Malformed,
}

/// Operations the scenario driver needs from a session.
///
/// Abstracted so scenarios can run against a mock without spawning a server.
#[allow(async_fn_in_trait)]
pub trait ToolService {
    /// List the tools the server offers.
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, IpcError>;

    /// Invoke one tool and decode its compact summary.
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError>;
}

/// MCP client session over a spawned server.
///
/// # Lifecycle
///
/// - `spawn()` - Start the server process
/// - `initialize()` - Handshake; required before any other call
/// - `call()` / `list_tools()` / `call_tool()` - One round trip each
/// - `close()` - Tear down; also happens (forcefully) on drop
///
/// # Example
///
/// ```ignore
/// let mut client = McpClient::spawn(&path, ClientConfig::default())?;
/// client.initialize().await?;
/// let tools = client.list_tools().await?;
/// client.close().await;
/// ```
pub struct McpClient {
    transport: ProcessTransport,
    config: ClientConfig,
    /// Last id handed out; ids start at 1 and never repeat.
    last_id: u64,
    last_call: CallState,
}

impl McpClient {
    /// Spawn the server at `program`.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Launch` if the path is not an executable file.
    pub fn spawn(program: &Path, config: ClientConfig) -> Result<Self, IpcError> {
        let transport = ProcessTransport::spawn(program, &config.env, config.stderr_retained)?;
        Ok(Self {
            transport,
            config,
            last_id: 0,
            last_call: CallState::Idle,
        })
    }

    /// Set the default per-call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Terminal state of the most recent call.
    pub fn last_call(&self) -> CallState {
        self.last_call
    }

    /// Handle to the captured server stderr.
    pub fn stderr(&self) -> StderrBuffer {
        self.transport.stderr()
    }

    /// The configured number of most recent stderr lines.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.transport.stderr().snapshot(self.config.stderr_report)
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Write a request and return its id without waiting for the reply.
    pub async fn send_request(&mut self, method: &str, params: Option<Value>) -> Result<u64, IpcError> {
        let id = self.next_id();
        let line = Envelope::request(id, method, params).to_line()?;
        self.transport.write_line(&line).await?;
        Ok(id)
    }

    /// Write a notification. Nothing is read back.
    pub async fn send_notification(&mut self, method: &str, params: Option<Value>) -> Result<(), IpcError> {
        let line = Envelope::notification(method, params).to_line()?;
        self.transport.write_line(&line).await
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// Late replies to earlier, timed-out calls are recognised by their lower
    /// id and discarded, so they can never be mistaken for this call's reply.
    ///
    /// # Errors
    ///
    /// - `IpcError::Timeout` if no reply arrives in time
    /// - `IpcError::PeerClosed` if the server closed stdout first
    /// - `IpcError::MalformedResponse` if the reply line is not JSON-RPC
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Response, IpcError> {
        self.last_call = CallState::Idle;
        let id = match self.send_request(method, params).await {
            Ok(id) => id,
            Err(e) => {
                self.last_call = CallState::WriteFailed;
                return Err(e);
            }
        };
        self.last_call = CallState::Sent;
        debug!("Sent {} (id {})", method, id);

        let deadline = Instant::now() + timeout;
        let result = self.await_reply(id, deadline).await;

        self.last_call = match &result {
            Ok(_) => CallState::Completed,
            Err(IpcError::Timeout(_)) => CallState::TimedOut,
            Err(IpcError::PeerClosed(_)) => CallState::PeerClosed,
            Err(IpcError::MalformedResponse { .. }) => CallState::Malformed,
            Err(_) => CallState::Sent,
        };

        result.map_err(|e| match e {
            IpcError::Timeout(_) => {
                warn!("{} (id {}) timed out after {:?}", method, id, timeout);
                IpcError::Timeout(timeout)
            }
            other => other,
        })
    }

    /// `call` with the configured timeout.
    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Response, IpcError> {
        let timeout = self.config.timeout;
        self.call(method, params, timeout).await
    }

    async fn await_reply(&mut self, id: u64, deadline: Instant) -> Result<Response, IpcError> {
        loop {
            let line = self.transport.read_line(deadline).await?;

            let response: Response =
                serde_json::from_str(&line).map_err(|e| IpcError::MalformedResponse {
                    line: line.clone(),
                    reason: e.to_string(),
                })?;

            match response.correlate(id) {
                Correlation::Reply => return Ok(response),
                Correlation::Stale(stale) => {
                    warn!("Discarding late reply to request {} while awaiting {}", stale, id);
                }
                Correlation::Unexpected(unknown) => {
                    warn!("Discarding reply to unissued request {} while awaiting {}", unknown, id);
                }
                Correlation::ServerInitiated => {
                    debug!(
                        "Skipping server-initiated {}",
                        response.method.as_deref().unwrap_or_default()
                    );
                }
            }
        }
    }

    /// Perform the MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&mut self) -> Result<InitializeResult, IpcError> {
        info!("-> initialize");
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });

        let result = self.request(methods::INITIALIZE, Some(params)).await?.into_result()?;
        let init = InitializeResult::from_value(result);
        info!("<- initialize OK ({})", init.server_label());

        self.send_notification(methods::INITIALIZED, None).await?;
        Ok(init)
    }

    /// `tools/list`; an absent `tools` field yields an empty list.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, IpcError> {
        info!("-> tools/list");
        let result = self.request(methods::TOOLS_LIST, Some(json!({}))).await?.into_result()?;
        let tools = ToolDescriptor::list_from_result(&result);
        info!("<- tools/list: {} tools", tools.len());
        Ok(tools)
    }

    /// `tools/call`, decoding the first content block's text.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError> {
        info!("-> tools/call {} {}", name, arguments);
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?.into_result()?;
        let tool_result = ToolResult::from_call_result(&result);
        info!("<- tools/call {} done (status: {})", name, tool_result.status());
        Ok(tool_result)
    }

    /// Close the session. Idempotent; safe after any failure.
    pub async fn close(&mut self) {
        self.transport.close(self.config.shutdown_grace).await;
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

impl ToolService for McpClient {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, IpcError> {
        McpClient::list_tools(self).await
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError> {
        McpClient::call_tool(self, name, arguments).await
    }
}

impl<T: ToolService> ToolService for &mut T {
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, IpcError> {
        (**self).list_tools().await
    }

    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError> {
        (**self).call_tool(name, arguments).await
    }
}
