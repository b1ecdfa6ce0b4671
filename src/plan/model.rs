use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use time::OffsetDateTime;

use crate::catalog::model::{BrowserProfile, NetworkProfile, ViewportProfile};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Navigate,
    Click,
    Fill,
    WaitForSelector,
    AssertVisible,
    Screenshot,
    Custom,
}

impl Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Navigate => f.write_str("navigate"),
            StepAction::Click => f.write_str("click"),
            StepAction::Fill => f.write_str("fill"),
            StepAction::WaitForSelector => f.write_str("wait_for_selector"),
            StepAction::AssertVisible => f.write_str("assert_visible"),
            StepAction::Screenshot => f.write_str("screenshot"),
            StepAction::Custom => f.write_str("custom"),
        }
    }
}

/// One step of a user journey. `expected_outcome` must be objective and
/// measurable ("within N seconds selector X is visible"), it is handed to the
/// agent verbatim and checked against its report.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TestStep {
    pub step_number: u32,
    pub action: StepAction,
    pub target: String,
    pub value: Option<String>,
    pub expected_outcome: String,
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TestFlow {
    pub flow_name: String,
    pub steps: Vec<TestStep>,
}

/// One point in the test matrix: a flow against a specific viewport, browser
/// engine and network profile.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MatrixCell {
    pub cell_id: String,
    pub flow: TestFlow,
    pub viewport: ViewportProfile,
    pub browser: BrowserProfile,
    pub network: NetworkProfile,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl MatrixCell {
    /// The (viewport, browser) pair deciding which subprocess serves this cell.
    pub fn pair(&self) -> (String, String) {
        (self.viewport.name.clone(), self.browser.name.clone())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TestPlan {
    pub plan_id: String,
    pub scenario_id: String,
    pub scenario_name: String,
    pub target_url: String,
    /// The original request text, verbatim. The cell executor forwards it to
    /// the agent so free-form intent survives the template expansion.
    pub user_request: String,
    pub flows: Vec<TestFlow>,
    pub cells: Vec<MatrixCell>,
    pub total_cells: usize,
    pub estimated_duration_s: u64,
}
