//! Console report.
//!
//! Everything here writes to stdout; logs go to stderr so the two never
//! interleave in a captured report.

use crate::app::Outcome;

const RULE_WIDTH: usize = 60;

pub fn section(title: &str) {
    let rule = "=".repeat(RULE_WIDTH);
    println!("\n{}", rule);
    println!("  {}", title);
    println!("{}", rule);
}

pub fn ok(msg: &str) {
    println!("  ✅ {}", msg);
}

pub fn fail(msg: &str) {
    println!("  ❌ {}", msg);
}

pub fn info(msg: &str) {
    println!("  ℹ️  {}", msg);
}

fn mark(passed: bool) -> &'static str {
    if passed {
        "✅"
    } else {
        "❌"
    }
}

/// Print the per-scenario tally. Returns true when every scenario passed.
pub fn summary(results: &[Outcome]) -> bool {
    section("Summary");
    for outcome in results {
        println!("  {} {}", mark(outcome.passed), outcome.name);
    }

    let passed = results.iter().filter(|o| o.passed).count();
    let total = results.len();
    println!();
    println!("  {} {}/{} tests passed", mark(passed == total), passed, total);

    passed == total
}

/// Fatal transport failure that ended the run early.
pub fn fatal(kind: &str, msg: &str) {
    println!("\n⚠️  {}: {}", kind, msg);
}

pub fn dump_stderr(lines: &[String]) {
    println!("\n[server stderr (last {} lines)]:", lines.len());
    if lines.is_empty() {
        println!("  (none)");
    }
    for line in lines {
        println!("  {}", line);
    }
}
