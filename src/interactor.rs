use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use log::debug;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{aggregate, generate_run_id, render_summary};
use crate::agent::ModelAgent;
use crate::automation::pool::SubprocessPool;
use crate::catalog::Catalog;
use crate::cli::Format;
use crate::executor::CellExecutor;
use crate::parser::{is_last_reference, RequestParser};
use crate::plan::model::TestPlan;
use crate::plan::PlanBuilder;
use crate::progress::RunStarted;
use crate::store::model::{RunArtifact, ScenarioSummary};
use crate::store::ScenarioStore;

pub enum RunOutcome {
    Completed(CompletedRun),
    /// Dry run: the plan was built and the scenario persisted, nothing ran.
    Planned(TestPlan),
    /// Cancelled at a cell boundary; no partial artifact was emitted.
    Cancelled,
}

pub struct CompletedRun {
    pub plan: TestPlan,
    pub artifact: RunArtifact,
    pub artifact_path: PathBuf,
    pub summary: String,
    pub duration: Duration,
}

/// Drives one request end to end: parse, plan (or rebuild a stored scenario),
/// persist, execute every cell sequentially, aggregate, persist the artifact,
/// then emit. The subprocess pool is owned here and always drained before
/// returning, whatever the outcome.
pub struct RunRequestInteractor {}

impl RunRequestInteractor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute<S: ScenarioStore + Sync>(
        &self,
        catalog: &Catalog,
        store: &S,
        agent: &dyn ModelAgent,
        message: &str,
        agent_timeout: Duration,
        dry_run: bool,
        cancel: &CancellationToken,
        progress_format: Format,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let steps = if dry_run { 3 } else { 4 };

        progress_format.progress(&format!(
            "{} Parsing request...",
            style(format!("[1/{steps}]")).bold().dim()
        ));
        let parsed = RequestParser::new(catalog).parse(message)?;

        progress_format.progress(&format!(
            "{} Building test plan...",
            style(format!("[2/{steps}]")).bold().dim()
        ));
        let builder = PlanBuilder::new(catalog);
        let plan = if parsed.is_rerun {
            let reference = parsed.rerun_reference.as_deref().unwrap_or("last");
            let scenario = if is_last_reference(reference) {
                store.resolve_last().await?
            } else {
                store.find_scenario(reference).await?
            };
            debug!("replaying scenario {}", scenario.scenario_id);
            builder.rebuild_from_scenario(&scenario, message)?
        } else {
            builder.build(&parsed)?
        };

        progress_format.progress(&format!(
            "{} Saving scenario {}...",
            style(format!("[3/{steps}]")).bold().dim(),
            plan.scenario_id
        ));
        store.save_scenario(plan.to_scenario_definition()).await?;

        if dry_run {
            return Ok(RunOutcome::Planned(plan));
        }

        let pool = SubprocessPool::new(catalog.launcher().clone());
        let run_started_at = OffsetDateTime::now_utc();
        let run_id = generate_run_id(&plan.scenario_id, run_started_at);
        progress_format.format(RunStarted {
            run_id: run_id.clone(),
            scenario_name: plan.scenario_name.clone(),
            total_cells: plan.total_cells,
            estimated_duration_s: plan.estimated_duration_s,
        })?;

        let executor = CellExecutor::new(&pool, agent).with_agent_timeout(agent_timeout);
        let results = run_cells(&executor, &plan, cancel, progress_format).await;

        // Deferred teardown: always drains, never raises. Cleanup noise stays
        // in the logs.
        pool.shutdown().await;

        let Some(results) = results else {
            progress_format.progress("Run cancelled; no artifact was written.");
            return Ok(RunOutcome::Cancelled);
        };
        let completed_at = OffsetDateTime::now_utc();

        let artifact = aggregate(&plan, &results, &run_id, run_started_at, completed_at);

        progress_format.progress(&format!(
            "{} Persisting run artifact {}...",
            style(format!("[4/{steps}]")).bold().dim(),
            artifact.run_id
        ));
        // Durable before visible: the artifact hits disk before any summary
        // reaches the outside world.
        let artifact_path = store.save_run_artifact(&artifact).await?;

        let summary = render_summary(&artifact, &plan);
        progress_format.progress(&format!(
            "Done in {}",
            HumanDuration(started.elapsed())
        ));

        Ok(RunOutcome::Completed(CompletedRun {
            plan,
            artifact,
            artifact_path,
            summary,
            duration: started.elapsed(),
        }))
    }
}

/// Sequential cell loop in plan order. Returns None when cancelled at a cell
/// boundary; in-flight work is never interrupted mid-cell.
async fn run_cells(
    executor: &CellExecutor<'_>,
    plan: &TestPlan,
    cancel: &CancellationToken,
    progress_format: Format,
) -> Option<Vec<crate::store::model::CellResult>> {
    let bar = if progress_format.supports_progress_bars() {
        let bar = ProgressBar::new(plan.total_cells as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .expect("static progress template"),
        );
        Some(bar)
    } else {
        None
    };

    let mut results = Vec::with_capacity(plan.total_cells);
    for cell in &plan.cells {
        if cancel.is_cancelled() {
            if let Some(bar) = &bar {
                bar.abandon_with_message("cancelled");
            }
            return None;
        }
        if let Some(bar) = &bar {
            bar.set_message(cell.cell_id.clone());
        }
        results.push(executor.execute(cell, &plan.user_request).await);
        if let Some(bar) = &bar {
            bar.inc(1);
        }
    }
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }
    Some(results)
}

pub struct ListScenariosInteractor {}

impl ListScenariosInteractor {
    pub(crate) async fn execute<S: ScenarioStore + Sync>(
        &self,
        store: &S,
        progress_format: Format,
    ) -> Result<()> {
        let scenarios = store.list_all_scenarios().await?;
        progress_format.format(ScenarioList(scenarios))?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct ScenarioList(pub Vec<ScenarioSummary>);

impl Display for ScenarioList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("No scenarios saved yet.");
        }
        for scenario in &self.0 {
            let last_run = scenario
                .last_run_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "never".to_string());
            writeln!(
                f,
                "{}  {}  [{}]  last run: {}",
                scenario.scenario_id,
                scenario.target_url,
                scenario.tags.join(", "),
                last_run
            )?;
        }
        Ok(())
    }
}

pub struct ListRunsInteractor {}

impl ListRunsInteractor {
    pub(crate) async fn execute<S: ScenarioStore + Sync>(
        &self,
        store: &S,
        progress_format: Format,
    ) -> Result<()> {
        let runs = store.list_run_artifacts().await?;
        progress_format.format(RunList(runs))?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct RunList(pub Vec<RunArtifact>);

impl Display for RunList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("No runs recorded yet.");
        }
        for run in &self.0 {
            writeln!(
                f,
                "{}  {}  {}  {}/{} passed  {}",
                run.run_id,
                run.scenario_id,
                run.overall_status,
                run.passed_cells,
                run.total_cells,
                run.started_at
            )?;
        }
        Ok(())
    }
}

pub struct ShowRunInteractor {}

impl ShowRunInteractor {
    pub(crate) async fn execute<S: ScenarioStore + Sync>(
        &self,
        store: &S,
        run_id: &str,
        progress_format: Format,
    ) -> Result<()> {
        let artifact = store.load_run_artifact(run_id).await?;
        match progress_format {
            Format::Standard | Format::Plain | Format::Yaml => {
                println!("{}", serde_yaml::to_string(&artifact)?)
            }
            Format::Json => println!("{}", serde_json::to_string(&artifact)?),
        }
        Ok(())
    }
}

pub struct ShowCatalogInteractor {}

impl ShowCatalogInteractor {
    pub(crate) fn execute(&self, catalog: &Catalog, progress_format: Format) -> Result<()> {
        match progress_format {
            Format::Standard | Format::Plain | Format::Yaml => {
                println!("{}", serde_yaml::to_string(catalog.document())?)
            }
            Format::Json => println!("{}", serde_json::to_string(catalog.document())?),
        }
        Ok(())
    }
}
