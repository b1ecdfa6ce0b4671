use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::json;
use tokio::time::Instant;

use crate::agent::{AgentOutcome, ModelAgent, ToolInvocation};
use crate::automation::client::ToolClient;
use crate::automation::pool::SubprocessPool;
use crate::automation::protocol::{TOOL_CONSOLE_MESSAGES, TOOL_SCREENSHOT};
use crate::errors::{AgentError, ToolError};
use crate::plan::model::{MatrixCell, StepAction, TestFlow};
use crate::store::model::{CellResult, CellStatus, FailurePriority, StepResult, StepStatus};

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Chat surfaces choke on full agent transcripts; summaries are bounded and
/// the untruncated text goes to the artifact only.
const SUMMARY_LIMIT: usize = 2000;

/// Status markers scanned in priority order; the first one present decides.
const STATUS_MARKERS: [&str; 6] = [
    "test status:",
    "test outcome:",
    "final status:",
    "overall status:",
    "test results:",
    "test verdict:",
];
const MARKER_WINDOW: usize = 100;

const AFFIRMATIVE_PHRASES: [&str; 4] = [
    "completed successfully",
    "all steps passed",
    "all tests passed",
    "all checks passed",
];
const NEGATIVE_TOKENS: [&str; 3] = ["error", "failed", "crashed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

pub struct CellExecutor<'a> {
    pool: &'a SubprocessPool,
    agent: &'a dyn ModelAgent,
    agent_timeout: Duration,
}

impl<'a> CellExecutor<'a> {
    pub fn new(pool: &'a SubprocessPool, agent: &'a dyn ModelAgent) -> Self {
        Self {
            pool,
            agent,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Runs one cell to a `CellResult`. Never returns an error: every failure
    /// mode is folded into a FAIL result so one broken cell can't abort the
    /// run.
    pub async fn execute(&self, cell: &MatrixCell, user_request: &str) -> CellResult {
        let started = Instant::now();

        let handle = match self.pool.acquire(&cell.viewport, &cell.browser).await {
            Ok(handle) => handle,
            Err(error) => {
                warn!("cell {}: subprocess launch failed: {error:#}", cell.cell_id);
                // Launch failures are always P0: nothing was tested at all.
                return failed_result(
                    cell,
                    "subprocess launch failed",
                    FailurePriority::P0,
                    format!("{error:#}"),
                    started.elapsed(),
                );
            }
        };

        let prompt = build_agent_prompt(cell, user_request);
        let run = self.agent.run(&prompt, &handle, self.agent_timeout);
        let outcome = match tokio::time::timeout(self.agent_timeout, run).await {
            Err(_) => {
                self.evict_pair(cell).await;
                self.pool.release(handle);
                return failed_result(
                    cell,
                    "timeout",
                    classify_priority(cell),
                    format!("agent did not finish within {:?}", self.agent_timeout),
                    started.elapsed(),
                );
            }
            Ok(Err(error)) => {
                let (summary, evict) = describe_execution_error(&error);
                if evict {
                    self.evict_pair(cell).await;
                }
                self.pool.release(handle);
                return failed_result(
                    cell,
                    &summary,
                    classify_priority(cell),
                    format!("{error:#}"),
                    started.elapsed(),
                );
            }
            Ok(Ok(outcome)) => outcome,
        };

        let verdict = extract_verdict(&outcome.final_text);
        let console_errors = collect_console_errors(&handle).await;
        self.pool.release(handle);

        let status = match verdict {
            Verdict::Pass => CellStatus::Pass,
            Verdict::Fail => CellStatus::Fail,
        };
        let (failure_summary, failure_priority) = match status {
            CellStatus::Pass => (None, None),
            CellStatus::Fail => (
                Some(summarize_failure(&outcome)),
                Some(classify_priority(cell)),
            ),
        };

        CellResult {
            cell_id: cell.cell_id.clone(),
            status,
            step_results: derive_step_results(&cell.flow, &outcome, verdict),
            duration_ms: started.elapsed().as_millis() as u64,
            screenshots: collect_screenshots(&outcome.invocations),
            console_errors,
            failure_summary,
            failure_priority,
            agent_response_summary: truncate(&outcome.final_text, SUMMARY_LIMIT),
            agent_response: Some(outcome.final_text),
        }
    }

    async fn evict_pair(&self, cell: &MatrixCell) {
        self.pool
            .evict(&cell.viewport.name, &cell.browser.name)
            .await;
    }
}

/// Declares the emulated environment, forbids resizing, carries the original
/// request verbatim, and lists the numbered steps. The verbatim request is
/// load-bearing: free-form intent ("check the repo list of user X") only
/// survives through it.
pub fn build_agent_prompt(cell: &MatrixCell, user_request: &str) -> String {
    let mut prompt = String::new();
    _ = writeln!(
        prompt,
        "You are a QA engineer executing an automated test in a live browser session."
    );
    _ = writeln!(prompt, "\n## Environment");
    _ = writeln!(
        prompt,
        "- Browser: {} ({} engine, {:?} platform)",
        cell.browser.display_name, cell.browser.engine, cell.browser.platform
    );
    _ = writeln!(
        prompt,
        "- Viewport: {}, {}x{} at {}x scale, mobile: {}",
        cell.viewport.display_name,
        cell.viewport.width,
        cell.viewport.height,
        cell.viewport.device_scale_factor,
        if cell.viewport.is_mobile { "yes" } else { "no" }
    );
    _ = writeln!(
        prompt,
        "- Network: {} (latency {} ms, {} kbps down / {} kbps up, {}% packet loss)",
        cell.network.display_name,
        cell.network.latency_ms,
        cell.network.download_kbps,
        cell.network.upload_kbps,
        cell.network.packet_loss_pct
    );
    _ = writeln!(
        prompt,
        "\nThe browser context already emulates this environment; it was configured at launch. \
         Do not resize the viewport or change device emulation in any way."
    );
    _ = writeln!(prompt, "\n## Original request\n{user_request}");
    _ = writeln!(prompt, "\n## Test steps ({})", cell.flow.flow_name);
    for step in &cell.flow.steps {
        let value = step
            .value
            .as_ref()
            .map(|v| format!(" with value '{v}'"))
            .unwrap_or_default();
        _ = writeln!(
            prompt,
            "{}. {} '{}'{} - expected: {} (within {}s)",
            step.step_number, step.action, step.target, value, step.expected_outcome,
            step.timeout_seconds
        );
    }
    _ = writeln!(
        prompt,
        "\nExecute the steps with the available browser tools, honoring any additional intent \
         from the original request. Then report each step's outcome and end your reply with \
         exactly one line: 'Test Status: PASSED' or 'Test Status: FAILED'."
    );
    prompt
}

/// Scans the final agent message for the first status marker and reads the
/// verdict token out of the window behind it. Falls back to conservative
/// phrase matching when no marker is present.
pub fn extract_verdict(text: &str) -> Verdict {
    let lowered = text.to_lowercase();
    for marker in STATUS_MARKERS {
        let Some(position) = lowered.find(marker) else {
            continue;
        };
        let start = position + marker.len();
        let mut end = (start + MARKER_WINDOW).min(lowered.len());
        while end < lowered.len() && !lowered.is_char_boundary(end) {
            end += 1;
        }
        let window = &lowered[start..end];
        return match (window.find("pass"), window.find("fail")) {
            (Some(pass), Some(fail)) => {
                if pass <= fail {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                }
            }
            (Some(_), None) => Verdict::Pass,
            (None, Some(_)) => Verdict::Fail,
            (None, None) => fallback_verdict(&lowered),
        };
    }
    fallback_verdict(&lowered)
}

fn fallback_verdict(lowered: &str) -> Verdict {
    let affirmative = AFFIRMATIVE_PHRASES.iter().any(|p| lowered.contains(p));
    let negative = NEGATIVE_TOKENS.iter().any(|t| lowered.contains(t));
    if affirmative && !negative {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

/// (network, viewport) severity rule: baseline network on a baseline viewport
/// is P0, any degraded network is P1, everything else is edge-viewport P2.
pub fn classify_priority(cell: &MatrixCell) -> FailurePriority {
    if cell.network.is_baseline() && cell.viewport.baseline {
        FailurePriority::P0
    } else if !cell.network.is_baseline() {
        FailurePriority::P1
    } else {
        FailurePriority::P2
    }
}

/// Walks the flow steps against the invocation trace in order. Steps the agent
/// demonstrably executed get real outcomes; steps without a matching
/// invocation are SKIP. With no trace at all, a single synthetic step carries
/// the bounded agent summary.
fn derive_step_results(flow: &TestFlow, outcome: &AgentOutcome, verdict: Verdict) -> Vec<StepResult> {
    if outcome.invocations.is_empty() {
        return vec![StepResult {
            step_number: 1,
            status: match verdict {
                Verdict::Pass => StepStatus::Pass,
                Verdict::Fail => StepStatus::Fail,
            },
            actual_outcome: truncate(&outcome.final_text, SUMMARY_LIMIT),
            duration_ms: 0,
            error: None,
        }];
    }

    let mut results = Vec::with_capacity(flow.steps.len());
    let mut cursor = 0usize;
    for step in &flow.steps {
        let tool_name = step.action.to_string();
        let matched = if step.action == StepAction::Custom {
            None
        } else {
            outcome.invocations[cursor..]
                .iter()
                .position(|i| i.tool == tool_name)
                .map(|offset| cursor + offset)
        };
        match matched {
            Some(index) => {
                let invocation = &outcome.invocations[index];
                cursor = index + 1;
                results.push(StepResult {
                    step_number: step.step_number,
                    status: if invocation.ok {
                        StepStatus::Pass
                    } else {
                        StepStatus::Fail
                    },
                    actual_outcome: truncate(&invocation.detail, 500),
                    duration_ms: invocation.duration_ms,
                    error: if invocation.ok {
                        None
                    } else {
                        Some(truncate(&invocation.detail, 500))
                    },
                });
            }
            None => results.push(StepResult {
                step_number: step.step_number,
                status: StepStatus::Skip,
                actual_outcome: "no matching tool invocation recorded".to_string(),
                duration_ms: 0,
                error: None,
            }),
        }
    }
    results
}

fn collect_screenshots(invocations: &[ToolInvocation]) -> Vec<String> {
    invocations
        .iter()
        .filter(|i| i.tool == TOOL_SCREENSHOT && i.ok)
        .map(|i| {
            i.arguments
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("screenshot")
                .to_string()
        })
        .collect()
}

async fn collect_console_errors(handle: &Arc<ToolClient>) -> Vec<String> {
    match handle
        .call_tool(TOOL_CONSOLE_MESSAGES, json!({}))
        .await
    {
        Ok(text) => text
            .lines()
            .filter(|line| line.to_lowercase().contains("error"))
            .map(str::to_string)
            .collect(),
        Err(error) => {
            debug!("console message collection failed: {error}");
            Vec::new()
        }
    }
}

fn summarize_failure(outcome: &AgentOutcome) -> String {
    outcome
        .invocations
        .iter()
        .find(|i| !i.ok)
        .map(|i| format!("step '{}' failed: {}", i.tool, truncate(&i.detail, 200)))
        .unwrap_or_else(|| "agent reported a failing verdict".to_string())
}

fn describe_execution_error(error: &anyhow::Error) -> (String, bool) {
    if let Some(tool_error) = error.downcast_ref::<ToolError>() {
        return match tool_error {
            ToolError::Disconnected => ("subprocess disconnected".to_string(), true),
            other => (format!("tool protocol error: {other}"), true),
        };
    }
    if let Some(AgentError::Timeout { .. }) = error.downcast_ref::<AgentError>() {
        return ("timeout".to_string(), true);
    }
    (format!("agent execution failed: {error}"), false)
}

fn failed_result(
    cell: &MatrixCell,
    summary: &str,
    priority: FailurePriority,
    detail: String,
    elapsed: Duration,
) -> CellResult {
    CellResult {
        cell_id: cell.cell_id.clone(),
        status: CellStatus::Fail,
        step_results: vec![StepResult {
            step_number: 1,
            status: StepStatus::Fail,
            actual_outcome: summary.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            error: Some(truncate(&detail, 500)),
        }],
        duration_ms: elapsed.as_millis() as u64,
        screenshots: Vec::new(),
        console_errors: Vec::new(),
        failure_summary: Some(summary.to_string()),
        failure_priority: Some(priority),
        agent_response_summary: truncate(&detail, SUMMARY_LIMIT),
        agent_response: None,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::parser::RequestParser;
    use crate::plan::PlanBuilder;
    use rstest::rstest;

    fn cell_for(message: &str, viewport: &str, browser: &str, network: &str) -> MatrixCell {
        let catalog = Catalog::embedded().unwrap();
        let parsed = RequestParser::new(&catalog).parse(message).unwrap();
        let plan = PlanBuilder::new(&catalog).build(&parsed).unwrap();
        plan.cells
            .iter()
            .find(|c| {
                c.viewport.name == viewport && c.browser.name == browser && c.network.name == network
            })
            .cloned()
            .unwrap_or_else(|| panic!("no cell for ({viewport}, {browser}, {network})"))
    }

    #[rstest]
    #[case("Test Outcome: PASSED", Verdict::Pass)]
    #[case("Test Status: FAILED", Verdict::Fail)]
    #[case("ran 6 tools\nTEST STATUS: passed\nbye", Verdict::Pass)]
    #[case("Final Status: everything passed cleanly", Verdict::Pass)]
    #[case("Overall status: 3 failed, 1 passed", Verdict::Fail)]
    #[case("Test verdict: pass", Verdict::Pass)]
    fn marker_verdicts(#[case] text: &str, #[case] expected: Verdict) {
        assert_eq!(extract_verdict(text), expected);
    }

    #[test]
    fn first_marker_in_priority_order_wins() {
        let text = "Test Status: PASSED\nlater someone wrote Test Verdict: failed";
        assert_eq!(extract_verdict(text), Verdict::Pass);
    }

    #[test]
    fn marker_beats_surrounding_free_text() {
        let text = "Clicked 9 links, one console error seen.\nTest Outcome: PASSED";
        assert_eq!(extract_verdict(text), Verdict::Pass);
    }

    #[rstest]
    #[case("All steps completed successfully.", Verdict::Pass)]
    #[case("All steps completed successfully but one error was logged", Verdict::Fail)]
    #[case("The page crashed during navigation", Verdict::Fail)]
    #[case("Some unstructured rambling", Verdict::Fail)]
    fn fallback_verdicts(#[case] text: &str, #[case] expected: Verdict) {
        assert_eq!(extract_verdict(text), expected);
    }

    #[test]
    fn baseline_network_and_viewport_is_p0() {
        let cell = cell_for(
            "test pointblank.club on safari desktop",
            "desktop-standard",
            "webkit-desktop",
            "normal",
        );
        assert_eq!(classify_priority(&cell), FailurePriority::P0);
    }

    #[test]
    fn degraded_network_is_p1() {
        let cell = cell_for(
            "test pointblank.club on iphone under slow 3g",
            "iphone-13-pro",
            "webkit-ios",
            "slow-3g",
        );
        assert_eq!(classify_priority(&cell), FailurePriority::P1);
    }

    #[test]
    fn edge_viewport_on_baseline_network_is_p2() {
        let cell = cell_for(
            "test example.com on android and chrome",
            "android-medium",
            "chromium-desktop",
            "normal",
        );
        assert_eq!(classify_priority(&cell), FailurePriority::P2);
    }

    #[test]
    fn prompt_carries_the_original_request_verbatim() {
        let request = "test example.com and also check the repo list of user octocat";
        let cell = cell_for(request, "desktop-standard", "chromium-desktop", "normal");
        let prompt = build_agent_prompt(&cell, request);
        assert!(prompt.contains(request));
        assert!(prompt.contains("Do not resize the viewport"));
        assert!(prompt.contains("1920x1080"));
    }

    #[test]
    fn prompt_numbers_every_step() {
        let cell = cell_for(
            "test example.com signup",
            "desktop-standard",
            "chromium-desktop",
            "normal",
        );
        let prompt = build_agent_prompt(&cell, "test example.com signup");
        for step in &cell.flow.steps {
            assert!(prompt.contains(&format!("{}. {}", step.step_number, step.action)));
        }
    }

    #[test]
    fn steps_map_to_invocations_in_order() {
        let cell = cell_for("test example.com", "desktop-standard", "chromium-desktop", "normal");
        let outcome = AgentOutcome {
            final_text: "Test Status: PASSED".to_string(),
            invocations: vec![
                invocation("navigate", true, "loaded"),
                invocation("wait_for_selector", true, "visible"),
                invocation("assert_visible", true, "heading shown"),
                invocation("screenshot", true, "saved"),
            ],
        };
        let results = derive_step_results(&cell.flow, &outcome, Verdict::Pass);
        assert_eq!(results.len(), cell.flow.steps.len());
        assert!(results.iter().all(|r| r.status == StepStatus::Pass));
    }

    #[test]
    fn unmatched_steps_become_skips() {
        let cell = cell_for("test example.com", "desktop-standard", "chromium-desktop", "normal");
        let outcome = AgentOutcome {
            final_text: "Test Status: FAILED".to_string(),
            invocations: vec![invocation("navigate", false, "net::ERR_TIMED_OUT")],
        };
        let results = derive_step_results(&cell.flow, &outcome, Verdict::Fail);
        assert_eq!(results[0].status, StepStatus::Fail);
        assert!(results[1..].iter().all(|r| r.status == StepStatus::Skip));
    }

    #[test]
    fn empty_trace_produces_one_synthetic_step() {
        let cell = cell_for("test example.com", "desktop-standard", "chromium-desktop", "normal");
        let outcome = AgentOutcome {
            final_text: "Test Status: PASSED".to_string(),
            invocations: vec![],
        };
        let results = derive_step_results(&cell.flow, &outcome, Verdict::Pass);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepStatus::Pass);
    }

    #[test]
    fn screenshots_come_from_the_trace() {
        let invocations = vec![
            ToolInvocation {
                tool: "screenshot".to_string(),
                arguments: json!({"name": "landing"}),
                ok: true,
                detail: "saved".to_string(),
                duration_ms: 12,
            },
            invocation("navigate", true, "ok"),
        ];
        assert_eq!(collect_screenshots(&invocations), vec!["landing"]);
    }

    #[test]
    fn summaries_are_bounded() {
        let text = "x".repeat(5000);
        let truncated = truncate(&text, SUMMARY_LIMIT);
        assert_eq!(truncated.len(), SUMMARY_LIMIT + 3);
    }

    fn invocation(tool: &str, ok: bool, detail: &str) -> ToolInvocation {
        ToolInvocation {
            tool: tool.to_string(),
            arguments: json!({}),
            ok,
            detail: detail.to_string(),
            duration_ms: 5,
        }
    }
}
