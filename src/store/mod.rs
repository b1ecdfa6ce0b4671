pub mod model;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::fs;

use crate::errors::StoreError;
use model::{RunArtifact, ScenarioDefinition, ScenarioSummary};

const SCENARIOS_DIR: &str = "scenarios";
const RUNS_DIR: &str = "runs";

#[async_trait]
pub trait ScenarioStore {
    /// Upsert by scenario id. Updating preserves `created_at` and refreshes
    /// `last_run_at`; the stored document is returned.
    async fn save_scenario(&self, scenario: ScenarioDefinition) -> Result<ScenarioDefinition>;
    async fn load_scenario(&self, scenario_id: &str) -> Result<ScenarioDefinition>;
    async fn list_all_scenarios(&self) -> Result<Vec<ScenarioSummary>>;
    /// Resolution order: exact id, then case-insensitive name substring, then
    /// target-URL host substring. Multiple matches at one level are ambiguous.
    async fn find_scenario(&self, reference: &str) -> Result<ScenarioDefinition>;
    /// The scenario with the greatest `last_run_at` (falling back to
    /// `created_at`).
    async fn resolve_last(&self) -> Result<ScenarioDefinition>;
    /// Write-once. Re-submitting an existing run id fails with `Duplicate`.
    async fn save_run_artifact(&self, artifact: &RunArtifact) -> Result<PathBuf>;
    async fn load_run_artifact(&self, run_id: &str) -> Result<RunArtifact>;
    /// All persisted runs, most recent first.
    async fn list_run_artifacts(&self) -> Result<Vec<RunArtifact>>;
}

pub struct FsScenarioStore {
    root: PathBuf,
}

impl FsScenarioStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let expanded = shellexpand::tilde(&root.to_string_lossy().into_owned()).into_owned();
        Self {
            root: PathBuf::from(expanded),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scenario_path(&self, scenario_id: &str) -> PathBuf {
        self.root
            .join(SCENARIOS_DIR)
            .join(format!("{scenario_id}.json"))
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join(RUNS_DIR).join(format!("{run_id}.json"))
    }

    async fn load_all_definitions(&self) -> Result<Vec<ScenarioDefinition>> {
        let dir = self.root.join(SCENARIOS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|error| StoreError::ReadFailure {
                path: dir.clone(),
                error,
            })?;
        let mut scenarios = Vec::new();
        while let Some(entry) =
            entries
                .next_entry()
                .await
                .map_err(|error| StoreError::ReadFailure {
                    path: dir.clone(),
                    error,
                })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            scenarios.push(read_json::<ScenarioDefinition>(&path).await?);
        }
        // Directory iteration order is filesystem-dependent.
        scenarios.sort_by(|a, b| a.scenario_id.cmp(&b.scenario_id));
        Ok(scenarios)
    }

    async fn available_names(&self) -> String {
        match self.load_all_definitions().await {
            Ok(scenarios) if !scenarios.is_empty() => scenarios
                .iter()
                .map(|s| s.scenario_name.clone())
                .collect::<Vec<_>>()
                .join(", "),
            _ => "(none)".to_string(),
        }
    }
}

#[async_trait]
impl ScenarioStore for FsScenarioStore {
    async fn save_scenario(&self, scenario: ScenarioDefinition) -> Result<ScenarioDefinition> {
        let path = self.scenario_path(&scenario.scenario_id);
        let mut document = scenario;
        if path.exists() {
            let existing = read_json::<ScenarioDefinition>(&path).await?;
            document.created_at = existing.created_at;
        }
        document.last_run_at = Some(OffsetDateTime::now_utc());
        write_json_atomic(&path, &document).await?;
        debug!("Saved scenario {}", document.scenario_id);
        Ok(document)
    }

    async fn load_scenario(&self, scenario_id: &str) -> Result<ScenarioDefinition> {
        let path = self.scenario_path(scenario_id);
        if !path.exists() {
            return Err(StoreError::ScenarioNotFound {
                reference: scenario_id.to_string(),
                available: self.available_names().await,
            }
            .into());
        }
        read_json(&path).await
    }

    async fn list_all_scenarios(&self) -> Result<Vec<ScenarioSummary>> {
        Ok(self
            .load_all_definitions()
            .await?
            .iter()
            .map(ScenarioSummary::from)
            .collect())
    }

    async fn find_scenario(&self, reference: &str) -> Result<ScenarioDefinition> {
        let scenarios = self.load_all_definitions().await?;

        if let Some(exact) = scenarios.iter().find(|s| s.scenario_id == reference) {
            return Ok(exact.clone());
        }

        let needle = reference.to_lowercase();
        let by_name: Vec<&ScenarioDefinition> = scenarios
            .iter()
            .filter(|s| s.scenario_name.to_lowercase().contains(&needle))
            .collect();
        match by_name.len() {
            1 => return Ok(by_name[0].clone()),
            n if n > 1 => {
                return Err(StoreError::Ambiguous {
                    reference: reference.to_string(),
                    matches: join_names(&by_name),
                }
                .into())
            }
            _ => {}
        }

        let by_host: Vec<&ScenarioDefinition> = scenarios
            .iter()
            .filter(|s| {
                url::Url::parse(&s.target_url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_lowercase().contains(&needle)))
                    .unwrap_or(false)
            })
            .collect();
        match by_host.len() {
            1 => Ok(by_host[0].clone()),
            0 => Err(StoreError::ScenarioNotFound {
                reference: reference.to_string(),
                available: self.available_names().await,
            }
            .into()),
            _ => Err(StoreError::Ambiguous {
                reference: reference.to_string(),
                matches: join_names(&by_host),
            }
            .into()),
        }
    }

    async fn resolve_last(&self) -> Result<ScenarioDefinition> {
        let mut scenarios = self.load_all_definitions().await?;
        if scenarios.is_empty() {
            return Err(StoreError::NoHistory.into());
        }
        scenarios.sort_by_key(|s| std::cmp::Reverse(s.last_run_at.unwrap_or(s.created_at)));
        Ok(scenarios.remove(0))
    }

    async fn save_run_artifact(&self, artifact: &RunArtifact) -> Result<PathBuf> {
        let path = self.run_path(&artifact.run_id);
        if path.exists() {
            return Err(StoreError::Duplicate {
                run_id: artifact.run_id.clone(),
            }
            .into());
        }
        write_json_atomic(&path, artifact).await?;
        debug!("Persisted run artifact {}", artifact.run_id);
        Ok(path)
    }

    async fn load_run_artifact(&self, run_id: &str) -> Result<RunArtifact> {
        let path = self.run_path(run_id);
        if !path.exists() {
            let available = self
                .list_run_artifacts()
                .await
                .unwrap_or_default()
                .iter()
                .take(5)
                .map(|a| a.run_id.clone())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StoreError::RunNotFound {
                run_id: run_id.to_string(),
                available: if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available
                },
            }
            .into());
        }
        read_json(&path).await
    }

    async fn list_run_artifacts(&self) -> Result<Vec<RunArtifact>> {
        let dir = self.root.join(RUNS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|error| StoreError::ReadFailure {
                path: dir.clone(),
                error,
            })?;
        let mut artifacts: Vec<RunArtifact> = Vec::new();
        while let Some(entry) =
            entries
                .next_entry()
                .await
                .map_err(|error| StoreError::ReadFailure {
                    path: dir.clone(),
                    error,
                })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            artifacts.push(read_json::<RunArtifact>(&path).await?);
        }
        artifacts.sort_by_key(|a| std::cmp::Reverse(a.started_at));
        Ok(artifacts)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|error| StoreError::ReadFailure {
            path: path.to_path_buf(),
            error,
        })?;
    // Unknown fields are tolerated so newer writers stay readable.
    let value = serde_json::from_str(&content).map_err(|error| StoreError::MalformedDocument {
        path: path.to_path_buf(),
        error,
    })?;
    Ok(value)
}

/// Rename-on-completion so readers never observe a torn document.
async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|error| StoreError::WriteFailure {
            path: parent.to_path_buf(),
            error,
        })?;

    let content = serde_json::to_string_pretty(value)?;
    let parent = parent.to_path_buf();
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::result::Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(|error| StoreError::WriteFailure {
            path: parent.clone(),
            error,
        })?;
        use std::io::Write;
        tmp.write_all(content.as_bytes())
            .map_err(|error| StoreError::WriteFailure {
                path: target.clone(),
                error,
            })?;
        tmp.persist(&target)
            .map_err(|error| StoreError::WriteFailure {
                path: target.clone(),
                error: error.error,
            })?;
        Ok(())
    })
    .await??;
    Ok(())
}

fn join_names(scenarios: &[&ScenarioDefinition]) -> String {
    scenarios
        .iter()
        .map(|s| s.scenario_name.clone())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::EnvironmentMatrix;
    use tempfile::TempDir;
    use time::Duration;

    fn scenario(id: &str, name: &str, url: &str) -> ScenarioDefinition {
        ScenarioDefinition {
            scenario_id: id.to_string(),
            scenario_name: name.to_string(),
            target_url: url.to_string(),
            flows: vec![],
            environment_matrix: EnvironmentMatrix {
                viewports: vec!["desktop-standard".into()],
                browsers: vec!["chromium-desktop".into()],
                networks: vec!["normal".into()],
            },
            tags: vec!["landing".into()],
            created_at: OffsetDateTime::now_utc(),
            last_run_at: None,
        }
    }

    fn artifact(run_id: &str) -> RunArtifact {
        RunArtifact {
            run_id: run_id.to_string(),
            scenario_id: "s1".into(),
            started_at: OffsetDateTime::now_utc(),
            completed_at: OffsetDateTime::now_utc(),
            overall_status: model::OverallStatus::Pass,
            total_cells: 0,
            passed_cells: 0,
            failed_cells: 0,
            cell_results: vec![],
            failures_by_priority: Default::default(),
            by_viewport: Default::default(),
            by_browser: Default::default(),
            by_network: Default::default(),
        }
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        let saved = store
            .save_scenario(scenario("landing-example-com-1vp", "landing-example.com-1vp", "https://example.com/"))
            .await
            .unwrap();
        let loaded = store.load_scenario("landing-example-com-1vp").await.unwrap();
        assert_eq!(saved, loaded);
    }

    #[tokio::test]
    async fn upsert_preserves_created_at_and_refreshes_last_run_at() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());

        let first = store
            .save_scenario(scenario("s1", "one", "https://one.example.com/"))
            .await
            .unwrap();

        let second = store
            .save_scenario(scenario("s1", "one", "https://one.example.com/"))
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_run_at.unwrap() >= first.last_run_at.unwrap());
    }

    #[tokio::test]
    async fn find_scenario_resolution_order() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        store
            .save_scenario(scenario("s1", "checkout smoke", "https://shop.example.com/"))
            .await
            .unwrap();
        store
            .save_scenario(scenario("s2", "editorial smoke", "https://blog.example.org/"))
            .await
            .unwrap();

        // exact id
        let found = store.find_scenario("s1").await.unwrap();
        assert_eq!(found.scenario_name, "checkout smoke");

        // case-insensitive name substring
        let found = store.find_scenario("EDITORIAL").await.unwrap();
        assert_eq!(found.scenario_id, "s2");

        // host substring, tried only after name matching finds nothing
        let found = store.find_scenario("shop.example").await.unwrap();
        assert_eq!(found.scenario_id, "s1");
    }

    #[tokio::test]
    async fn ambiguous_reference_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        store
            .save_scenario(scenario("a", "landing-a.example.com", "https://a.example.com/"))
            .await
            .unwrap();
        store
            .save_scenario(scenario("b", "landing-b.example.com", "https://b.example.com/"))
            .await
            .unwrap();

        let error = store.find_scenario("landing").await.unwrap_err();
        assert!(format!("{error}").contains("ambiguous"));
    }

    #[tokio::test]
    async fn missing_reference_lists_available() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        store
            .save_scenario(scenario("a", "landing-a.example.com", "https://a.example.com/"))
            .await
            .unwrap();

        let error = store.find_scenario("nothing-like-this").await.unwrap_err();
        let message = format!("{error}");
        assert!(message.contains("landing-a.example.com"));
    }

    #[tokio::test]
    async fn resolve_last_prefers_most_recent_run() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());

        let mut old = scenario("old", "old", "https://old.example.com/");
        old.created_at = OffsetDateTime::now_utc() - Duration::hours(2);
        store.save_scenario(old).await.unwrap();

        store
            .save_scenario(scenario("new", "new", "https://new.example.com/"))
            .await
            .unwrap();

        let last = store.resolve_last().await.unwrap();
        assert_eq!(last.scenario_id, "new");
    }

    #[tokio::test]
    async fn resolve_last_on_empty_store_is_no_history() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        assert!(store.resolve_last().await.is_err());
    }

    #[tokio::test]
    async fn run_artifacts_are_write_once() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());

        store.save_run_artifact(&artifact("run_1")).await.unwrap();
        let error = store.save_run_artifact(&artifact("run_1")).await.unwrap_err();
        assert!(format!("{error}").contains("immutable"));
    }

    #[tokio::test]
    async fn run_artifacts_can_be_read_back() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());

        let mut first = artifact("run_1");
        first.started_at = OffsetDateTime::now_utc() - Duration::minutes(5);
        store.save_run_artifact(&first).await.unwrap();
        store.save_run_artifact(&artifact("run_2")).await.unwrap();

        let loaded = store.load_run_artifact("run_1").await.unwrap();
        assert_eq!(loaded.run_id, "run_1");

        let listed = store.list_run_artifacts().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, "run_2");

        let error = store.load_run_artifact("run_404").await.unwrap_err();
        assert!(format!("{error}").contains("run_2"));
    }

    #[tokio::test]
    async fn unknown_fields_are_tolerated_on_read() {
        let dir = TempDir::new().unwrap();
        let store = FsScenarioStore::new(dir.path());
        let saved = store
            .save_scenario(scenario("s1", "one", "https://one.example.com/"))
            .await
            .unwrap();

        let path = store.scenario_path("s1");
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["added_by_a_newer_writer"] = serde_json::json!({"ok": true});
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let loaded = store.load_scenario("s1").await.unwrap();
        assert_eq!(loaded.scenario_id, saved.scenario_id);
    }
}
