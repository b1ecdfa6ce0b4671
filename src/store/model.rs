use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use time::OffsetDateTime;

use crate::plan::model::TestFlow;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIP")]
    Skip,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Pass => f.write_str("PASS"),
            CellStatus::Fail => f.write_str("FAIL"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "PARTIAL")]
    Partial,
}

impl Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverallStatus::Pass => f.write_str("PASS"),
            OverallStatus::Fail => f.write_str("FAIL"),
            OverallStatus::Partial => f.write_str("PARTIAL"),
        }
    }
}

/// Failure severity. P0 fails on baseline network and a standard viewport,
/// P1 is network-induced, P2 is edge-viewport-induced.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailurePriority {
    P0,
    P1,
    P2,
}

impl Display for FailurePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePriority::P0 => f.write_str("P0"),
            FailurePriority::P1 => f.write_str("P1"),
            FailurePriority::P2 => f.write_str("P2"),
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_number: u32,
    pub status: StepStatus,
    pub actual_outcome: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CellResult {
    pub cell_id: String,
    pub status: CellStatus,
    pub step_results: Vec<StepResult>,
    pub duration_ms: u64,
    pub screenshots: Vec<String>,
    pub console_errors: Vec<String>,
    pub failure_summary: Option<String>,
    pub failure_priority: Option<FailurePriority>,
    /// Bounded excerpt for chat surfaces; the untruncated text lives in
    /// `agent_response` for debugging.
    pub agent_response_summary: String,
    pub agent_response: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentMatrix {
    pub viewports: Vec<String>,
    pub browsers: Vec<String>,
    pub networks: Vec<String>,
}

/// A persisted, replayable test definition. Never deleted by the core.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ScenarioDefinition {
    pub scenario_id: String,
    pub scenario_name: String,
    pub target_url: String,
    pub flows: Vec<TestFlow>,
    pub environment_matrix: EnvironmentMatrix,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_run_at: Option<OffsetDateTime>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ScenarioSummary {
    pub scenario_id: String,
    pub scenario_name: String,
    pub target_url: String,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_run_at: Option<OffsetDateTime>,
}

impl From<&ScenarioDefinition> for ScenarioSummary {
    fn from(scenario: &ScenarioDefinition) -> Self {
        Self {
            scenario_id: scenario.scenario_id.clone(),
            scenario_name: scenario.scenario_name.clone(),
            target_url: scenario.target_url.clone(),
            tags: scenario.tags.clone(),
            last_run_at: scenario.last_run_at,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FailuresByPriority {
    #[serde(rename = "P0")]
    pub p0: Vec<String>,
    #[serde(rename = "P1")]
    pub p1: Vec<String>,
    #[serde(rename = "P2")]
    pub p2: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassTotal {
    pub pass: usize,
    pub total: usize,
}

/// Immutable record of one plan execution. Append-only after emission.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RunArtifact {
    pub run_id: String,
    pub scenario_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
    pub overall_status: OverallStatus,
    pub total_cells: usize,
    pub passed_cells: usize,
    pub failed_cells: usize,
    pub cell_results: Vec<CellResult>,
    pub failures_by_priority: FailuresByPriority,
    pub by_viewport: BTreeMap<String, PassTotal>,
    pub by_browser: BTreeMap<String, PassTotal>,
    pub by_network: BTreeMap<String, PassTotal>,
}
