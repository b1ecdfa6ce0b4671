use std::collections::BTreeMap;
use std::fmt::Write as _;

use md5::{Digest, Md5};
use time::OffsetDateTime;

use crate::plan::model::TestPlan;
use crate::store::model::{
    CellResult, CellStatus, FailurePriority, FailuresByPriority, OverallStatus, PassTotal,
    RunArtifact,
};

/// Content-derived run id: timestamp plus a short digest of the scenario it
/// executed, unique per orchestration.
pub fn generate_run_id(scenario_id: &str, at: OffsetDateTime) -> String {
    let mut hasher = Md5::new();
    hasher.update(scenario_id.as_bytes());
    hasher.update(at.unix_timestamp_nanos().to_be_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("run_{}_{}", at.unix_timestamp(), &digest_hex[..8])
}

/// Pure fold of cell results into the immutable run record. Calling it twice
/// over the same inputs yields the same artifact.
pub fn aggregate(
    plan: &TestPlan,
    results: &[CellResult],
    run_id: &str,
    started_at: OffsetDateTime,
    completed_at: OffsetDateTime,
) -> RunArtifact {
    let passed_cells = results
        .iter()
        .filter(|r| r.status == CellStatus::Pass)
        .count();
    let failed_cells = results.len() - passed_cells;

    let overall_status = if failed_cells == 0 && passed_cells > 0 {
        OverallStatus::Pass
    } else if passed_cells == 0 {
        OverallStatus::Fail
    } else {
        OverallStatus::Partial
    };

    let mut failures_by_priority = FailuresByPriority::default();
    for result in results.iter().filter(|r| r.status == CellStatus::Fail) {
        let bucket = match result.failure_priority.unwrap_or(FailurePriority::P2) {
            FailurePriority::P0 => &mut failures_by_priority.p0,
            FailurePriority::P1 => &mut failures_by_priority.p1,
            FailurePriority::P2 => &mut failures_by_priority.p2,
        };
        bucket.push(result.cell_id.clone());
    }

    let mut by_viewport: BTreeMap<String, PassTotal> = BTreeMap::new();
    let mut by_browser: BTreeMap<String, PassTotal> = BTreeMap::new();
    let mut by_network: BTreeMap<String, PassTotal> = BTreeMap::new();
    for result in results {
        let Some(cell) = plan.cells.iter().find(|c| c.cell_id == result.cell_id) else {
            continue;
        };
        for (bucket, name) in [
            (&mut by_viewport, &cell.viewport.name),
            (&mut by_browser, &cell.browser.name),
            (&mut by_network, &cell.network.name),
        ] {
            let entry = bucket.entry(name.clone()).or_default();
            entry.total += 1;
            if result.status == CellStatus::Pass {
                entry.pass += 1;
            }
        }
    }

    RunArtifact {
        run_id: run_id.to_string(),
        scenario_id: plan.scenario_id.clone(),
        started_at,
        completed_at,
        overall_status,
        total_cells: results.len(),
        passed_cells,
        failed_cells,
        cell_results: results.to_vec(),
        failures_by_priority,
        by_viewport,
        by_browser,
        by_network,
    }
}

/// The human summary emitted to the requesting surface: header, critical
/// failures (P0 first), environment breakdown, then actionable next steps
/// including the exact re-run invocation.
pub fn render_summary(artifact: &RunArtifact, plan: &TestPlan) -> String {
    let mut out = String::new();

    _ = writeln!(out, "Test run {} - {}", artifact.run_id, artifact.overall_status);
    _ = writeln!(out, "Scenario: {} ({})", plan.scenario_name, plan.target_url);
    _ = writeln!(
        out,
        "Cells: {} passed / {} failed of {}",
        artifact.passed_cells, artifact.failed_cells, artifact.total_cells
    );

    if artifact.failed_cells > 0 {
        _ = writeln!(out, "\nFailures:");
        for (label, cell_ids) in [
            ("P0", &artifact.failures_by_priority.p0),
            ("P1", &artifact.failures_by_priority.p1),
            ("P2", &artifact.failures_by_priority.p2),
        ] {
            for cell_id in cell_ids {
                let summary = artifact
                    .cell_results
                    .iter()
                    .find(|r| &r.cell_id == cell_id)
                    .and_then(|r| r.failure_summary.clone())
                    .unwrap_or_else(|| "unclassified failure".to_string());
                _ = writeln!(out, "  [{label}] {cell_id}: {summary}");
            }
        }
    }

    _ = writeln!(out, "\nEnvironment breakdown:");
    for (label, rollup) in [
        ("viewport", &artifact.by_viewport),
        ("browser", &artifact.by_browser),
        ("network", &artifact.by_network),
    ] {
        for (name, counts) in rollup {
            _ = writeln!(out, "  {label} {name}: {}/{} passed", counts.pass, counts.total);
        }
    }

    _ = writeln!(out, "\nNext steps:");
    if !artifact.failures_by_priority.p0.is_empty() {
        _ = writeln!(
            out,
            "  - Fix the P0 failures first: they break the baseline experience."
        );
    }
    if artifact.failed_cells > 0 {
        _ = writeln!(
            out,
            "  - Screenshots and step details are in the run artifact {}.",
            artifact.run_id
        );
    }
    _ = writeln!(out, "  - Replay this scenario with: re-run {}", plan.scenario_name);
    out
}
