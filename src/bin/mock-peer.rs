//! mock-peer - a scriptable stand-in for an MCP macOS automation server.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on stdin/stdout and implements the
//! six traversal tools against synthetic accessibility trees. Full traversals
//! are written to JSON artifact files; replies carry only a compact summary.
//!
//! # Environment
//!
//! - `MOCK_PEER_MODE` - `normal` (default), `silent`, `exit-on-call`,
//!   `garbage`, `slow`, `noisy`, `chatty`
//! - `MOCK_PEER_DELAY_MS` - reply delay for the first `tools/call` in `slow`
//!   mode (default 500)
//! - `MOCK_PEER_ARTIFACT_DIR` - where artifacts go (default: a `mock-peer`
//!   directory under the system temp dir)
//! - `MOCK_PEER_LOG` - tracing filter for the peer's own logs (default `info`)

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "mock-peer";
const ELEMENT_CAP: usize = 5_000;
const LISTING_LIMIT: usize = 20;
const NOISE_LINES: usize = 10_000;
const APP_PID: i64 = 4242;
const FINDER_PID: i64 = 501;
const FINDER: &str = "com.apple.finder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    /// Read everything, answer nothing.
    Silent,
    /// Exit without replying on the first `tools/call`.
    ExitOnCall,
    /// Answer `tools/list` with a line that is not JSON.
    Garbage,
    /// Delay the first `tools/call` reply.
    Slow,
    /// Flood stderr before answering `initialize`.
    Noisy,
    /// Send a server notification ahead of every reply.
    Chatty,
}

impl Mode {
    fn from_env() -> Self {
        match std::env::var("MOCK_PEER_MODE").as_deref() {
            Ok("silent") => Mode::Silent,
            Ok("exit-on-call") => Mode::ExitOnCall,
            Ok("garbage") => Mode::Garbage,
            Ok("slow") => Mode::Slow,
            Ok("noisy") => Mode::Noisy,
            Ok("chatty") => Mode::Chatty,
            _ => Mode::Normal,
        }
    }
}

struct Peer {
    mode: Mode,
    delay: Duration,
    artifact_dir: PathBuf,
    artifacts: usize,
    calls: usize,
    out: io::Stdout,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("MOCK_PEER_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let delay_ms = std::env::var("MOCK_PEER_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);
    let artifact_dir = std::env::var_os("MOCK_PEER_ARTIFACT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("mock-peer"));
    std::fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("Failed to create {}", artifact_dir.display()))?;

    let mut peer = Peer {
        mode: Mode::from_env(),
        delay: Duration::from_millis(delay_ms),
        artifact_dir,
        artifacts: 0,
        calls: 0,
        out: io::stdout(),
    };
    info!("{} started in {:?} mode", SERVER_NAME, peer.mode);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        peer.handle_line(&line)?;
    }

    info!("stdin closed, exiting");
    Ok(())
}

impl Peer {
    fn handle_line(&mut self, line: &str) -> Result<()> {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable request: {}", e);
                return self.send(&json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": -32700, "message": "Parse error"}
                }));
            }
        };

        let method = message["method"].as_str().unwrap_or_default().to_string();
        let id = message.get("id").cloned();
        debug!("<- {} (id {:?})", method, id);

        if self.mode == Mode::Silent {
            return Ok(());
        }

        // Notifications are never answered.
        let Some(id) = id else {
            return Ok(());
        };

        let reply = match method.as_str() {
            "initialize" => {
                if self.mode == Mode::Noisy {
                    self.flood_stderr()?;
                }
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
                }))
            }
            "tools/list" => {
                if self.mode == Mode::Garbage {
                    return self.write_raw("this is not json-rpc");
                }
                Ok(json!({ "tools": tool_list() }))
            }
            "tools/call" => {
                self.calls += 1;
                match self.mode {
                    Mode::ExitOnCall => {
                        info!("exiting on tools/call");
                        std::process::exit(3);
                    }
                    Mode::Slow if self.calls == 1 => {
                        info!("delaying reply by {:?}", self.delay);
                        std::thread::sleep(self.delay);
                    }
                    _ => {}
                }
                self.call_tool(&message["params"])
            }
            other => Err((-32601, format!("Method not found: {}", other))),
        };

        if self.mode == Mode::Chatty {
            self.send(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "info", "data": format!("handling {}", method)}
            }))?;
        }

        match reply {
            Ok(result) => self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result})),
            Err((code, message)) => self.send(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            })),
        }
    }

    fn send(&mut self, message: &Value) -> Result<()> {
        self.write_raw(&message.to_string())
    }

    fn write_raw(&mut self, line: &str) -> Result<()> {
        let mut out = self.out.lock();
        writeln!(out, "{}", line).context("Failed to write stdout")?;
        out.flush().context("Failed to flush stdout")
    }

    fn flood_stderr(&self) -> Result<()> {
        let mut err = io::stderr().lock();
        for i in 0..NOISE_LINES {
            writeln!(err, "noise line {}", i).context("Failed to write stderr")?;
        }
        Ok(())
    }

    fn call_tool(&mut self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];

        let text = match name {
            "macos-use_open_application_and_traverse" => {
                let identifier = args["identifier"].as_str().unwrap_or_default();
                if identifier.is_empty() || identifier.starts_with("NoSuch") {
                    return Ok(error_result(&format!("Application not found: {}", identifier)));
                }
                self.open(identifier)
            }
            "macos-use_refresh_traversal" => match args["pid"].as_i64() {
                Some(pid) => self.traversal(pid, app_for(pid), "Refreshed traversal"),
                None => return Ok(error_result("missing pid")),
            },
            "macos-use_click_and_traverse" => {
                let (Some(pid), Some(x), Some(y)) =
                    (args["pid"].as_i64(), args["x"].as_f64(), args["y"].as_f64())
                else {
                    return Ok(error_result("click needs pid, x and y"));
                };
                self.diff(pid, &format!("Clicked at ({},{})", x, y))
            }
            "macos-use_type_and_traverse" => match (args["pid"].as_i64(), args["text"].as_str()) {
                (Some(pid), Some(text)) => self.diff(pid, &format!("Typed {} characters", text.len())),
                _ => return Ok(error_result("type needs pid and text")),
            },
            "macos-use_press_key_and_traverse" => {
                match (args["pid"].as_i64(), args["keyName"].as_str()) {
                    (Some(pid), Some(key)) => self.diff(pid, &format!("Pressed {}", key)),
                    _ => return Ok(error_result("press needs pid and keyName")),
                }
            }
            "macos-use_scroll_and_traverse" => {
                let (Some(pid), Some(_), Some(_)) =
                    (args["pid"].as_i64(), args["x"].as_f64(), args["y"].as_f64())
                else {
                    return Ok(error_result("scroll needs pid, x and y"));
                };
                let delta = args["deltaY"].as_i64().unwrap_or(0);
                self.diff(pid, &format!("Scrolled by {}", delta))
            }
            other => return Err((-32602, format!("Unknown tool: {}", other))),
        };

        match text {
            Ok(text) => Ok(json!({"content": [{"type": "text", "text": text}]})),
            Err(e) => Ok(error_result(&format!("{:#}", e))),
        }
    }

    fn open(&mut self, identifier: &str) -> Result<String> {
        let pid = if identifier == FINDER { FINDER_PID } else { APP_PID };
        self.traversal(pid, identifier, &format!("Opened {}", identifier))
    }

    /// Full traversal: artifact plus a summary listing visible elements.
    fn traversal(&mut self, pid: i64, app: &str, action: &str) -> Result<String> {
        let (elements, truncated) = if pid == FINDER_PID {
            (finder_elements(), true)
        } else {
            (window_elements(), false)
        };
        self.summarize(pid, app, action, &elements, truncated)
    }

    /// Action result: only the elements the action "added" are listed.
    fn diff(&mut self, pid: i64, action: &str) -> Result<String> {
        let added = vec![element("AXStaticText", "Action done", 20.0, 300.0, 120.0, 16.0, true)];
        self.summarize(pid, app_for(pid), action, &added, false)
    }

    fn summarize(
        &mut self,
        pid: i64,
        app: &str,
        action: &str,
        elements: &[Value],
        truncated: bool,
    ) -> Result<String> {
        let visible: Vec<&Value> = elements
            .iter()
            .filter(|e| e["in_viewport"].as_bool().unwrap_or(false))
            .collect();

        let document = json!({
            "app": app,
            "pid": pid,
            "traversal": {
                "elements": elements,
                "stats": {
                    "count": elements.len(),
                    "visible_elements_count": visible.len(),
                    "truncated": truncated,
                }
            }
        });
        let body = serde_json::to_string_pretty(&document).context("Failed to encode artifact")?;

        self.artifacts += 1;
        let path = self.artifact_dir.join(format!(
            "traversal_{}_{}.json",
            std::process::id(),
            self.artifacts
        ));
        std::fs::write(&path, &body)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let mut text = format!(
            "status: success\npid: {}\napp: {}\nfile: {}\nfile_size: {} bytes ({} elements)\n\
             summary: {}: {} elements, {} visible\n\
             note: DO NOT read the full file. Search it for the element you need.",
            pid,
            app,
            path.display(),
            body.len(),
            elements.len(),
            action,
            elements.len(),
            visible.len()
        );

        let listed: Vec<String> = visible
            .iter()
            .filter(|e| e["text"].as_str().is_some_and(|t| !t.is_empty()))
            .take(LISTING_LIMIT)
            .map(|e| listing_line(e))
            .collect();
        if !listed.is_empty() {
            text.push_str("\nvisible_elements:");
            for line in listed {
                text.push('\n');
                text.push_str(&line);
            }
        }

        Ok(text)
    }
}

fn app_for(pid: i64) -> &'static str {
    if pid == FINDER_PID {
        FINDER
    } else {
        "TextEdit"
    }
}

fn error_result(message: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": format!("status: error\nerror: {}", message)}],
        "isError": true
    })
}

fn tool_list() -> Vec<Value> {
    [
        ("macos-use_open_application_and_traverse", "Open or activate an app and traverse it"),
        ("macos-use_click_and_traverse", "Click a point and traverse"),
        ("macos-use_type_and_traverse", "Type text and traverse"),
        ("macos-use_press_key_and_traverse", "Press a key and traverse"),
        ("macos-use_scroll_and_traverse", "Scroll at a point and traverse"),
        ("macos-use_refresh_traversal", "Traverse without acting"),
    ]
    .iter()
    .map(|(name, description)| {
        json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object"}
        })
    })
    .collect()
}

fn element(role: &str, text: &str, x: f64, y: f64, width: f64, height: f64, in_viewport: bool) -> Value {
    json!({
        "role": role,
        "text": text,
        "x": x,
        "y": y,
        "width": width,
        "height": height,
        "in_viewport": in_viewport,
    })
}

fn window_elements() -> Vec<Value> {
    vec![
        element("AXWindow", "Untitled", 0.0, 0.0, 800.0, 600.0, true),
        element("AXButton", "Close", 12.0, 8.0, 14.0, 16.0, true),
        element("AXButton", "Minimize", 32.0, 8.0, 14.0, 16.0, true),
        element("AXStaticText", "Untitled", 360.0, 8.0, 80.0, 16.0, true),
        element("AXTextArea", "", 0.0, 40.0, 800.0, 560.0, true),
        element("AXMenuItem", "Export as PDF", 0.0, 900.0, 160.0, 20.0, false),
    ]
}

/// Exactly at the cap, as a real server truncates to it.
fn finder_elements() -> Vec<Value> {
    (0..ELEMENT_CAP)
        .map(|i| {
            let row = i as f64;
            element("AXCell", &format!("File {}.txt", i), 200.0, 60.0 + row * 20.0, 300.0, 20.0, i < 30)
        })
        .collect()
}

fn listing_line(element: &Value) -> String {
    format!(
        "  [{}] \"{}\" ({},{} {}x{})",
        element["role"].as_str().unwrap_or("AXUnknown"),
        element["text"].as_str().unwrap_or_default(),
        element["x"].as_f64().unwrap_or(0.0) as i64,
        element["y"].as_f64().unwrap_or(0.0) as i64,
        element["width"].as_f64().unwrap_or(0.0) as i64,
        element["height"].as_f64().unwrap_or(0.0) as i64,
    )
}
