//! mcp-probe - exercise an MCP server over stdio.
//!
//! Spawns the server binary, performs the MCP handshake, runs the selected
//! scenarios and prints a report. Exits non-zero when any scenario fails or
//! the transport breaks down.

mod app;
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_probe::ipc::{ClientConfig, IpcError, McpClient};

use app::{App, Options, Outcome, Scenario};

/// Server binary location relative to the project root.
const DEFAULT_SERVER: &str = ".build/debug/mcp-server-macos-use";

#[derive(Parser, Debug)]
#[command(name = "mcp-probe", version, about = "MCP server test client")]
struct Cli {
    /// Server executable [default: <cwd>/.build/debug/mcp-server-macos-use]
    #[arg(long, env = "MCP_PROBE_SERVER")]
    server: Option<PathBuf>,

    /// Scenario to run
    #[arg(long = "test", value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// App to open for tests
    #[arg(long, default_value = "TextEdit")]
    app: String,

    /// Text to search for in the click test
    #[arg(long)]
    search: Option<String>,

    /// Seconds to wait for each server response
    #[arg(long, default_value = "30", value_parser = parse_timeout)]
    timeout: Duration,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds: {}", e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("timeout must be a positive number of seconds".to_string());
    }
    Ok(Duration::from_secs_f64(secs))
}

impl Cli {
    fn server_path(&self) -> Result<PathBuf> {
        match &self.server {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()
                .context("Failed to resolve current directory")?
                .join(DEFAULT_SERVER)),
        }
    }

    fn options(&self) -> Options {
        Options {
            scenario: self.scenario,
            app: self.app.clone(),
            search: self.search.clone(),
        }
    }
}

/// How a session ended.
enum RunOutcome {
    Completed(Vec<Outcome>),
    Aborted(IpcError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mcp_probe=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            ui::fatal("ERROR", &format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// Run the selected scenarios. `Ok(false)` means the report shows a failure.
async fn run(cli: Cli) -> Result<bool> {
    let server = cli.server_path()?;
    info!("mcp-probe v{} against {}", env!("CARGO_PKG_VERSION"), server.display());

    let config = ClientConfig {
        timeout: cli.timeout,
        ..ClientConfig::default()
    };
    let mut client = McpClient::spawn(&server, config)?;
    if let Some(pid) = client.pid() {
        info!("Server PID: {}", pid);
    }

    let outcome = session(&mut client, cli.options()).await;

    // Close before reporting so the stderr tail includes the server's last words.
    client.close().await;

    let passed = match outcome {
        RunOutcome::Completed(results) => ui::summary(&results),
        RunOutcome::Aborted(e) => {
            let kind = match &e {
                IpcError::Timeout(_) => "TIMEOUT",
                _ => "ERROR",
            };
            ui::fatal(kind, &e.to_string());
            false
        }
    };

    if !passed {
        ui::dump_stderr(&client.stderr_tail());
    }
    Ok(passed)
}

async fn session(client: &mut McpClient, options: Options) -> RunOutcome {
    match client.initialize().await {
        Ok(init) => ui::ok(&format!("Server initialized: {}", init.server_label())),
        Err(e) => return RunOutcome::Aborted(e),
    }

    let mut app = App::new(client, options);
    match app.run().await {
        Ok(()) => RunOutcome::Completed(app.results().to_vec()),
        Err(e) => RunOutcome::Aborted(e),
    }
}
