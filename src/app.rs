//! Scenario driver.
//!
//! This module contains the `App` struct that runs the selected scenarios
//! against a [`ToolService`] and records one pass/fail outcome per scenario.
//! Transport failures abort the run. A tool failure, including a JSON-RPC
//! error object in place of a result, only fails its scenario.

use clap::ValueEnum;
use serde_json::{json, Value};
use tracing::{debug, warn};

use mcp_probe::ipc::{IpcError, ToolService};
use mcp_probe::models::{Artifact, Element, ToolResult, ARTIFACT_GUIDANCE, ELEMENT_CAP};

use crate::ui;

// =============================================================================
// Tool Names
// =============================================================================

pub const OPEN_TOOL: &str = "macos-use_open_application_and_traverse";
pub const CLICK_TOOL: &str = "macos-use_click_and_traverse";
pub const TYPE_TOOL: &str = "macos-use_type_and_traverse";
pub const PRESS_KEY_TOOL: &str = "macos-use_press_key_and_traverse";
pub const SCROLL_TOOL: &str = "macos-use_scroll_and_traverse";
pub const REFRESH_TOOL: &str = "macos-use_refresh_traversal";

/// Tools the server must advertise.
pub const EXPECTED_TOOLS: [&str; 6] = [
    OPEN_TOOL,
    CLICK_TOOL,
    TYPE_TOOL,
    PRESS_KEY_TOOL,
    SCROLL_TOOL,
    REFRESH_TOOL,
];

/// App with a very large accessibility tree, used to hit the element cap.
const CAP_TARGET_APP: &str = "com.apple.finder";

// =============================================================================
// Options
// =============================================================================

/// Which scenarios to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    All,
    Tools,
    Open,
    Click,
    Refresh,
    Type,
    Press,
    Scroll,
    Cap,
    Visible,
}

impl Scenario {
    fn selects(self, scenario: Scenario) -> bool {
        self == Scenario::All || self == scenario
    }
}

/// Run options taken from the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub scenario: Scenario,
    pub app: String,
    pub search: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scenario: Scenario::All,
            app: "TextEdit".to_string(),
            search: None,
        }
    }
}

/// Result of one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub name: &'static str,
    pub passed: bool,
}

/// What is known about the target app's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Unknown,
    Running(i64),
    /// Opening the app failed; don't try again.
    Unavailable,
}

// =============================================================================
// App
// =============================================================================

/// Scenario runner.
pub struct App<S: ToolService> {
    service: S,
    options: Options,
    target: Target,
    results: Vec<Outcome>,
}

impl<S: ToolService> App<S> {
    pub fn new(service: S, options: Options) -> Self {
        Self {
            service,
            options,
            target: Target::Unknown,
            results: Vec::new(),
        }
    }

    pub fn results(&self) -> &[Outcome] {
        &self.results
    }

    fn record(&mut self, name: &'static str, passed: bool) {
        debug!("scenario {} {}", name, if passed { "passed" } else { "failed" });
        self.results.push(Outcome { name, passed });
    }

    /// Run every selected scenario in order.
    ///
    /// # Errors
    ///
    /// Returns the first transport error. Outcomes recorded before it are
    /// still available through [`App::results`].
    pub async fn run(&mut self) -> Result<(), IpcError> {
        let selected = self.options.scenario;

        if selected.selects(Scenario::Tools) {
            let passed = self.check_tools().await?;
            self.record("tools/list", passed);
        }

        if selected.selects(Scenario::Cap) {
            let passed = self.check_element_cap().await?;
            self.record("element_cap", passed);
        }

        if selected.selects(Scenario::Open) {
            let (passed, pid) = self.open_app().await?;
            self.target = pid.map_or(Target::Unavailable, Target::Running);
            self.record("open_app", passed);
        }

        if selected.selects(Scenario::Refresh) {
            if let Some(pid) = self.require_pid("refresh").await? {
                let passed = self.check_refresh(pid).await?;
                self.record("refresh", passed);
            }
        }

        if selected.selects(Scenario::Visible) {
            if let Some(pid) = self.require_pid("visible_elements").await? {
                let passed = self.check_visible_elements(pid).await?;
                self.record("visible_elements", passed);
            }
        }

        if selected.selects(Scenario::Click) {
            if let Some(pid) = self.require_pid("click").await? {
                let passed = self.check_click(pid).await?;
                self.record("click", passed);
            }
        }

        if selected.selects(Scenario::Scroll) {
            if let Some(pid) = self.require_pid("scroll").await? {
                let passed = self.check_scroll(pid).await?;
                self.record("scroll", passed);
            }
        }

        if selected.selects(Scenario::Press) {
            if let Some(pid) = self.require_pid("press_key").await? {
                let passed = self.check_press_key(pid).await?;
                self.record("press_key", passed);
            }
        }

        if selected.selects(Scenario::Type) {
            if let Some(pid) = self.require_pid("type").await? {
                let passed = self.check_type(pid).await?;
                self.record("type", passed);
            }
        }

        Ok(())
    }

    /// Pid of the target app, opening it first if needed.
    ///
    /// A failed prerequisite open is recorded as an `open_app` failure so a
    /// run whose scenarios were all skipped still fails.
    async fn require_pid(&mut self, scenario: &str) -> Result<Option<i64>, IpcError> {
        if self.target == Target::Unknown {
            let (passed, pid) = self.open_app().await?;
            self.target = pid.map_or(Target::Unavailable, Target::Running);
            if !passed {
                self.record("open_app", false);
            }
        }

        match self.target {
            Target::Running(pid) => Ok(Some(pid)),
            _ => {
                ui::fail(&format!("Skipping {} test: no PID", scenario));
                Ok(None)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Scenarios
    // -------------------------------------------------------------------------

    async fn check_tools(&mut self) -> Result<bool, IpcError> {
        ui::section("Test: tools/list");
        let tools = match self.service.list_tools().await {
            Ok(tools) => tools,
            Err(IpcError::ServerError { code, message, .. }) => {
                warn!("tools/list rejected: {} {}", code, message);
                ui::fail(&format!("tools/list failed: Server error {}: {}", code, message));
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let found: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

        let missing: Vec<&str> = EXPECTED_TOOLS
            .iter()
            .copied()
            .filter(|name| !found.contains(name))
            .collect();
        let extra: Vec<&str> = found
            .iter()
            .copied()
            .filter(|name| !EXPECTED_TOOLS.contains(name))
            .collect();

        if missing.is_empty() {
            ui::ok(&format!("All {} expected tools present", EXPECTED_TOOLS.len()));
        } else {
            ui::fail(&format!("Missing tools: {}", missing.join(", ")));
        }
        if !extra.is_empty() {
            ui::info(&format!("Extra tools: {}", extra.join(", ")));
        }

        Ok(missing.is_empty())
    }

    async fn check_element_cap(&mut self) -> Result<bool, IpcError> {
        ui::section(&format!("Test: element cap ({} limit)", ELEMENT_CAP));
        let result = self
            .call_tool(OPEN_TOOL, json!({ "identifier": CAP_TARGET_APP }))
            .await?;

        if !result.is_success() {
            ui::fail(&format!("Could not open Finder: {}", describe_error(&result)));
            return Ok(false);
        }

        let Some(artifact) = load_artifact(&result) else {
            return Ok(false);
        };
        let count = artifact.element_count();
        let stats = artifact.stats();
        ui::info(&format!(
            "Finder: {} elements, truncated={}",
            count,
            stats.is_truncated()
        ));

        if artifact.exceeds_cap() {
            ui::fail(&format!("Element count ({}) exceeds cap of {}!", count, ELEMENT_CAP));
            return Ok(false);
        }
        ui::ok(&format!("Element count ({}) is within cap of {}", count, ELEMENT_CAP));

        match stats.truncated {
            Some(truncated) => {
                ui::ok(&format!("'truncated' field present in stats (value: {})", truncated));
            }
            None => {
                ui::fail("'truncated' field missing from stats");
                return Ok(false);
            }
        }

        ui::info("To stress-test: open a folder with 1000s of files and call refresh_traversal");
        Ok(true)
    }

    /// Open the configured app. Returns whether the scenario passed and the
    /// pid, if one was reported.
    async fn open_app(&mut self) -> Result<(bool, Option<i64>), IpcError> {
        let app = self.options.app.clone();
        ui::section(&format!("Test: open {}", app));
        let result = self
            .call_tool(OPEN_TOOL, json!({ "identifier": app }))
            .await?;

        if result.is_error() {
            ui::fail(&format!("Error: {}", describe_error(&result)));
            return Ok((false, None));
        }

        let pid = result.pid();
        ui::ok(&format!(
            "Opened {:?} (PID: {})",
            result.app().unwrap_or(""),
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        ));
        ui::info(&format!("Summary: {}", result.summary()));

        let artifact = load_artifact(&result);
        let loaded = match &artifact {
            Some(artifact) if !artifact.is_empty() => {
                ui::ok(&format!(
                    "Full JSON: {} elements, truncated={}",
                    artifact.element_count(),
                    artifact.stats().is_truncated()
                ));
                true
            }
            Some(_) => {
                ui::fail("Could not load full JSON response file");
                false
            }
            None => false,
        };

        if pid.is_none() {
            ui::fail("Result carries no usable PID");
        }

        Ok((loaded && pid.is_some(), pid))
    }

    async fn check_refresh(&mut self, pid: i64) -> Result<bool, IpcError> {
        ui::section("Test: refresh_traversal");
        let result = self.refresh(pid).await?;

        if !result.is_success() {
            ui::fail(&format!("Refresh failed: {}", describe_error(&result)));
            return Ok(false);
        }

        let Some(artifact) = load_artifact(&result) else {
            return Ok(false);
        };
        let visible = artifact
            .stats()
            .visible_elements_count
            .map_or_else(|| "?".to_string(), |n| n.to_string());
        ui::ok(&format!(
            "Refresh: {} elements, {} visible",
            artifact.element_count(),
            visible
        ));
        Ok(true)
    }

    async fn check_visible_elements(&mut self, pid: i64) -> Result<bool, IpcError> {
        ui::section("Test: visible_elements in compact summary");

        // Full traversal: listing comes from the traversal itself.
        let result = self.refresh(pid).await?;
        let mut passed = check_compact_summary("Refresh", &result, true);

        // Diff: listing comes from elements the click added.
        let candidate = load_artifact(&result)
            .and_then(|artifact| artifact.elements().into_iter().find(Element::is_click_candidate));

        match candidate {
            Some(element) => {
                let click = self.click(pid, &element).await?;
                passed &= check_compact_summary("Click", &click, false);
            }
            None => ui::info("Skipped click sub-test: no suitable element to click"),
        }

        Ok(passed)
    }

    async fn check_click(&mut self, pid: i64) -> Result<bool, IpcError> {
        let search = self.options.search.clone();
        match &search {
            Some(needle) => ui::section(&format!("Test: click matching {:?}", needle)),
            None => ui::section("Test: click first interactable"),
        }

        let refreshed = self.refresh(pid).await?;
        let elements = load_artifact(&refreshed)
            .map(|artifact| artifact.elements())
            .unwrap_or_default();
        if elements.is_empty() {
            ui::fail("No elements from refresh");
            return Ok(false);
        }

        let candidate = match &search {
            Some(needle) => {
                let found = elements
                    .iter()
                    .find(|e| e.matches_search(needle) && e.has_position());
                if found.is_none() {
                    ui::fail(&format!("No in-viewport element matching {:?}", needle));
                    return Ok(false);
                }
                found
            }
            None => elements.iter().find(|e| e.is_click_candidate()),
        };

        let Some(element) = candidate else {
            ui::fail("No suitable clickable element found");
            return Ok(false);
        };

        let label: String = element.text().chars().take(60).collect();
        ui::info(&format!(
            "Clicking: {} | {:?} | ({},{}) {}x{}",
            element.role(),
            label,
            fmt_coord(element.x.as_ref()),
            fmt_coord(element.y.as_ref()),
            fmt_coord(element.width.as_ref()),
            fmt_coord(element.height.as_ref())
        ));

        let result = self.click(pid, element).await?;
        Ok(report_action("Click", &result))
    }

    async fn check_scroll(&mut self, pid: i64) -> Result<bool, IpcError> {
        ui::section("Test: scroll_and_traverse");
        let refreshed = self.refresh(pid).await?;
        let target = load_artifact(&refreshed).and_then(|artifact| {
            artifact
                .elements()
                .into_iter()
                .find(|e| e.is_in_viewport() && e.has_position())
        });

        let Some(target) = target else {
            ui::fail("No element to scroll at");
            return Ok(false);
        };

        let result = self
            .call_tool(
                SCROLL_TOOL,
                json!({ "pid": pid, "x": target.x, "y": target.y, "deltaY": 3 }),
            )
            .await?;
        Ok(report_action("Scroll", &result))
    }

    async fn check_press_key(&mut self, pid: i64) -> Result<bool, IpcError> {
        ui::section("Test: press_key_and_traverse");
        // Escape leaves the app state untouched.
        let result = self
            .call_tool(PRESS_KEY_TOOL, json!({ "pid": pid, "keyName": "Escape" }))
            .await?;
        Ok(report_action("Press key", &result))
    }

    async fn check_type(&mut self, pid: i64) -> Result<bool, IpcError> {
        ui::section("Test: type_and_traverse");
        let result = self
            .call_tool(TYPE_TOOL, json!({ "pid": pid, "text": "hello test" }))
            .await?;
        Ok(report_action("Type", &result))
    }

    // -------------------------------------------------------------------------
    // Tool helpers
    // -------------------------------------------------------------------------

    async fn refresh(&mut self, pid: i64) -> Result<ToolResult, IpcError> {
        self.call_tool(REFRESH_TOOL, json!({ "pid": pid })).await
    }

    async fn click(&mut self, pid: i64, element: &Element) -> Result<ToolResult, IpcError> {
        let arguments = json!({
            "pid": pid,
            "x": element.x,
            "y": element.y,
            "width": element.width.clone().unwrap_or_else(|| json!(0)),
            "height": element.height.clone().unwrap_or_else(|| json!(0)),
        });
        self.call_tool(CLICK_TOOL, arguments).await
    }

    /// Call a tool, folding a JSON-RPC error object into an error summary so
    /// only the calling scenario fails.
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError> {
        match self.service.call_tool(name, arguments).await {
            Err(IpcError::ServerError { code, message, .. }) => {
                warn!("{} rejected: {} {}", name, code, message);
                Ok(ToolResult::from_rpc_error(code, &message))
            }
            other => other,
        }
    }
}

/// Load a result's artifact, reporting a failure instead of propagating it.
fn load_artifact(result: &ToolResult) -> Option<Artifact> {
    match result.load_artifact() {
        Ok(artifact) => Some(artifact),
        Err(e) => {
            ui::fail(&format!("Could not load full JSON response file: {:#}", e));
            None
        }
    }
}

fn describe_error(result: &ToolResult) -> String {
    result
        .error()
        .map(str::to_string)
        .unwrap_or_else(|| format!("status {}", result.status()))
}

fn report_action(action: &str, result: &ToolResult) -> bool {
    if result.is_success() {
        ui::ok(&format!("{} succeeded: {}", action, result.summary()));
        true
    } else {
        ui::fail(&format!("{} failed: {}", action, describe_error(result)));
        false
    }
}

fn fmt_coord(value: Option<&Value>) -> String {
    value.map_or_else(|| "?".to_string(), Value::to_string)
}

/// Check a compact summary for the artifact size line, the guidance line and,
/// when present, a well-formed `visible_elements` listing.
fn check_compact_summary(label: &str, result: &ToolResult, check_format: bool) -> bool {
    let raw = result.raw();
    let mut passed = true;

    let has_size = result
        .file_size()
        .is_some_and(|size| size.contains("bytes") && size.contains("elements)"));
    if has_size {
        ui::ok(&format!("{} summary has file_size line", label));
    } else {
        ui::fail(&format!("{} summary missing file_size line", label));
        passed = false;
    }

    if raw.contains(ARTIFACT_GUIDANCE) {
        ui::ok(&format!("{} summary has guidance line", label));
    } else {
        ui::fail(&format!("{} summary missing guidance line", label));
        passed = false;
    }

    if !raw.split('\n').any(|line| line.starts_with("visible_elements:")) {
        ui::info(&format!(
            "{} summary has no visible_elements section (no visible interactive elements)",
            label
        ));
        return passed;
    }

    let lines = result.visible_element_lines();
    ui::ok(&format!(
        "{} summary has visible_elements ({} elements)",
        label,
        lines.len()
    ));

    if check_format {
        if let Some(sample) = lines.first() {
            let sample: String = sample.chars().take(80).collect();
            if is_element_line(&sample) {
                ui::ok(&format!("Element format looks correct: {}", sample.trim()));
            } else {
                ui::fail(&format!("Unexpected element format: {}", sample.trim()));
                passed = false;
            }
        }
    }

    passed
}

/// `  [AXRole] "text" ...`
fn is_element_line(line: &str) -> bool {
    line.trim_start().starts_with("[AX") && line.contains("] \"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_probe::models::ToolDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::path::PathBuf;

    /// In-process stand-in for a server: answers from canned summaries and
    /// writes artifacts into a temp dir.
    struct MockToolService {
        dir: tempfile::TempDir,
        tools: Vec<&'static str>,
        open_fails: bool,
        /// Tools answered with a JSON-RPC error object instead of a result.
        rpc_error_tools: Vec<&'static str>,
        list_rejected: bool,
        finder_elements: usize,
        finder_stats: Value,
        calls: Vec<(String, Value)>,
        artifacts: usize,
    }

    impl MockToolService {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                tools: EXPECTED_TOOLS.to_vec(),
                open_fails: false,
                rpc_error_tools: Vec::new(),
                list_rejected: false,
                finder_elements: ELEMENT_CAP,
                finder_stats: json!({"truncated": true, "visible_elements_count": 40}),
                calls: Vec::new(),
                artifacts: 0,
            }
        }

        fn write_artifact(&mut self, elements: Vec<Value>, stats: Value) -> PathBuf {
            self.artifacts += 1;
            let path = self.dir.path().join(format!("artifact_{}.json", self.artifacts));
            let doc = json!({"traversal": {"elements": elements, "stats": stats}});
            std::fs::write(&path, doc.to_string()).unwrap();
            path
        }

        fn window_elements() -> Vec<Value> {
            vec![
                json!({"role": "AXWindow", "in_viewport": true, "x": 0, "y": 0}),
                json!({"role": "AXButton", "text": "Close", "x": 12, "y": 8,
                       "width": 14, "height": 16, "in_viewport": true}),
                json!({"role": "AXStaticText", "text": "Hello Krishna", "x": 300, "y": 8,
                       "width": 80, "height": 16, "in_viewport": true}),
            ]
        }

        fn traversal_summary(&mut self, extra: &str) -> ToolResult {
            let path = self.write_artifact(
                Self::window_elements(),
                json!({"truncated": false, "visible_elements_count": 3}),
            );
            ToolResult::parse(&format!(
                "status: success\npid: 4242\napp: TextEdit\nfile: {}\n\
                 file_size: 512 bytes (3 elements)\nsummary: {}\n\
                 note: DO NOT read the full file, use grep\n\
                 visible_elements:\n  [AXButton] \"Close\" (12,8 14x16)",
                path.display(),
                extra
            ))
        }
    }

    impl ToolService for MockToolService {
        async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, IpcError> {
            if self.list_rejected {
                return Err(IpcError::ServerError {
                    code: -32601,
                    message: "Method not found".to_string(),
                    data: None,
                });
            }
            Ok(self
                .tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: None,
                    input_schema: Value::Null,
                })
                .collect())
        }

        async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, IpcError> {
            self.calls.push((name.to_string(), arguments.clone()));
            if self.rpc_error_tools.iter().any(|t| *t == name) {
                return Err(IpcError::ServerError {
                    code: -32000,
                    message: format!("{} unavailable", name),
                    data: Some(json!({"detail": "accessibility disabled"})),
                });
            }

            let result = match name {
                OPEN_TOOL if arguments["identifier"] == CAP_TARGET_APP => {
                    let elements = (0..self.finder_elements)
                        .map(|i| json!({"role": "AXCell", "text": format!("file {}", i)}))
                        .collect();
                    let stats = self.finder_stats.clone();
                    let path = self.write_artifact(elements, stats);
                    ToolResult::parse(&format!("status: success\npid: 100\nfile: {}", path.display()))
                }
                OPEN_TOOL if self.open_fails => {
                    ToolResult::parse("status: error\nerror: Application not found")
                }
                OPEN_TOOL => self.traversal_summary("Opened TextEdit"),
                REFRESH_TOOL => self.traversal_summary("Refreshed"),
                CLICK_TOOL => self.traversal_summary("Clicked"),
                _ => ToolResult::parse("status: success\nsummary: done"),
            };
            Ok(result)
        }
    }

    fn options(scenario: Scenario) -> Options {
        Options {
            scenario,
            ..Options::default()
        }
    }

    fn names(results: &[Outcome]) -> Vec<&'static str> {
        results.iter().map(|o| o.name).collect()
    }

    #[tokio::test]
    async fn test_run_all_passes_in_order() {
        let mut service = MockToolService::new();
        let mut app = App::new(&mut service, options(Scenario::All));
        app.run().await.unwrap();

        assert_eq!(
            names(app.results()),
            vec![
                "tools/list",
                "element_cap",
                "open_app",
                "refresh",
                "visible_elements",
                "click",
                "scroll",
                "press_key",
                "type"
            ]
        );
        assert!(app.results().iter().all(|o| o.passed), "{:?}", app.results());
    }

    #[tokio::test]
    async fn test_missing_tool_fails() {
        let mut service = MockToolService::new();
        service.tools = vec![OPEN_TOOL, CLICK_TOOL, "extra_tool"];
        let mut app = App::new(&mut service, options(Scenario::Tools));
        app.run().await.unwrap();

        assert_eq!(app.results(), &[Outcome { name: "tools/list", passed: false }]);
    }

    #[tokio::test]
    async fn test_server_error_fails_only_its_scenario() {
        let mut service = MockToolService::new();
        service.rpc_error_tools = vec![SCROLL_TOOL];
        let mut app = App::new(&mut service, options(Scenario::All));
        app.run().await.unwrap();

        let failed: Vec<&str> = app
            .results()
            .iter()
            .filter(|o| !o.passed)
            .map(|o| o.name)
            .collect();
        assert_eq!(app.results().len(), 9);
        assert_eq!(failed, vec!["scroll"]);
        drop(app);

        let called: Vec<&str> = service.calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(&called[called.len() - 2..], &[PRESS_KEY_TOOL, TYPE_TOOL]);
    }

    #[tokio::test]
    async fn test_server_error_on_open_marks_target_unavailable() {
        let mut service = MockToolService::new();
        service.rpc_error_tools = vec![OPEN_TOOL];
        let mut app = App::new(&mut service, options(Scenario::Type));
        app.run().await.unwrap();

        assert_eq!(app.results(), &[Outcome { name: "open_app", passed: false }]);
    }

    #[tokio::test]
    async fn test_rejected_tools_list_fails_and_run_continues() {
        let mut service = MockToolService::new();
        service.list_rejected = true;
        let mut app = App::new(&mut service, options(Scenario::All));
        app.run().await.unwrap();

        assert_eq!(app.results()[0], Outcome { name: "tools/list", passed: false });
        assert_eq!(app.results().len(), 9);
        assert!(app.results()[1..].iter().all(|o| o.passed), "{:?}", app.results());
    }

    #[tokio::test]
    async fn test_cap_boundary_passes() {
        let mut service = MockToolService::new();
        let mut app = App::new(&mut service, options(Scenario::Cap));
        app.run().await.unwrap();
        assert!(app.results()[0].passed);
    }

    #[tokio::test]
    async fn test_cap_exceeded_fails() {
        let mut service = MockToolService::new();
        service.finder_elements = ELEMENT_CAP + 1;
        let mut app = App::new(&mut service, options(Scenario::Cap));
        app.run().await.unwrap();
        assert!(!app.results()[0].passed);
    }

    #[tokio::test]
    async fn test_cap_requires_truncated_key() {
        let mut service = MockToolService::new();
        service.finder_elements = 10;
        service.finder_stats = json!({"visible_elements_count": 4});
        let mut app = App::new(&mut service, options(Scenario::Cap));
        app.run().await.unwrap();
        assert!(!app.results()[0].passed);
    }

    #[tokio::test]
    async fn test_failed_prerequisite_open_is_recorded_once() {
        let mut service = MockToolService::new();
        service.open_fails = true;
        let mut app = App::new(&mut service, options(Scenario::All));
        app.run().await.unwrap();

        assert_eq!(
            app.results(),
            &[
                Outcome { name: "tools/list", passed: true },
                Outcome { name: "element_cap", passed: true },
                Outcome { name: "open_app", passed: false },
            ]
        );
        drop(app);

        let opens = service.calls.iter().filter(|(name, _)| name == OPEN_TOOL).count();
        assert_eq!(opens, 2); // cap check plus the one app open
    }

    #[tokio::test]
    async fn test_single_scenario_opens_app_first() {
        let mut service = MockToolService::new();
        let mut app = App::new(&mut service, options(Scenario::Press));
        app.run().await.unwrap();
        assert_eq!(names(app.results()), vec!["press_key"]);
        drop(app);

        let called: Vec<&str> = service.calls.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(called, vec![OPEN_TOOL, PRESS_KEY_TOOL]);
        assert_eq!(service.calls[1].1, json!({"pid": 4242, "keyName": "Escape"}));
    }

    #[tokio::test]
    async fn test_click_search_is_case_insensitive() {
        let mut service = MockToolService::new();
        let opts = Options {
            scenario: Scenario::Click,
            search: Some("krishna".to_string()),
            ..Options::default()
        };
        let mut app = App::new(&mut service, opts);
        app.run().await.unwrap();
        assert!(app.results()[0].passed);
        drop(app);

        let (_, args) = service.calls.last().unwrap();
        assert_eq!(args["x"], json!(300));
        assert_eq!(args["y"], json!(8));
        assert_eq!(args["width"], json!(80));
    }

    #[tokio::test]
    async fn test_click_search_without_match_fails() {
        let mut service = MockToolService::new();
        let opts = Options {
            scenario: Scenario::Click,
            search: Some("nobody".to_string()),
            ..Options::default()
        };
        let mut app = App::new(&mut service, opts);
        app.run().await.unwrap();
        assert!(!app.results()[0].passed);
    }

    #[tokio::test]
    async fn test_scroll_sends_delta() {
        let mut service = MockToolService::new();
        let mut app = App::new(&mut service, options(Scenario::Scroll));
        app.run().await.unwrap();
        assert!(app.results()[0].passed);
        drop(app);

        let (name, args) = service.calls.last().unwrap();
        assert_eq!(name, SCROLL_TOOL);
        assert_eq!(args["deltaY"], json!(3));
        assert_eq!(args["x"], json!(0));
        assert_eq!(args["y"], json!(0));
    }

    #[test]
    fn test_compact_summary_checks() {
        let good = ToolResult::parse(
            "status: success\nfile_size: 10 bytes (1 elements)\nnote: DO NOT read the full file\n\
             visible_elements:\n  [AXButton] \"OK\" (1,2 3x4)",
        );
        assert!(check_compact_summary("Refresh", &good, true));

        let bad_format = ToolResult::parse(
            "file_size: 10 bytes (1 elements)\nDO NOT read the full file\nvisible_elements:\n  [AXButton] OK",
        );
        assert!(!check_compact_summary("Refresh", &bad_format, true));

        let no_size = ToolResult::parse("status: success\nDO NOT read the full file");
        assert!(!check_compact_summary("Click", &no_size, false));
    }

    #[test]
    fn test_fmt_coord() {
        assert_eq!(fmt_coord(Some(&json!(12))), "12");
        assert_eq!(fmt_coord(Some(&json!(12.5))), "12.5");
        assert_eq!(fmt_coord(None), "?");
    }
}
