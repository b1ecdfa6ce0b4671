use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::time::{sleep, Instant};

use crate::catalog::model::{BrowserProfile, LauncherConfig, ViewportProfile};
use crate::errors::PoolError;

use super::client::ToolClient;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Owns every automation subprocess of one run. A subprocess serves all cells
/// of one (viewport, browser) pair; device emulation is fixed at context
/// creation, so pairs can never share a subprocess.
///
/// Owned by the orchestrator and torn down at run end; never shared across
/// runs.
pub struct SubprocessPool {
    launcher: LauncherConfig,
    entries: tokio::sync::Mutex<HashMap<(String, String), Arc<ToolClient>>>,
    next_port_offset: AtomicU16,
}

impl SubprocessPool {
    pub fn new(launcher: LauncherConfig) -> Self {
        Self {
            launcher,
            entries: tokio::sync::Mutex::new(HashMap::new()),
            next_port_offset: AtomicU16::new(0),
        }
    }

    /// Returns the cached healthy handle for the pair or launches a fresh
    /// subprocess. The entry lock is held across the launch, which serializes
    /// acquires; cells execute sequentially so there is no contention to lose.
    pub async fn acquire(
        &self,
        viewport: &ViewportProfile,
        browser: &BrowserProfile,
    ) -> Result<Arc<ToolClient>> {
        let pair = (viewport.name.clone(), browser.name.clone());
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&pair) {
            if existing.is_healthy() {
                debug!("reusing subprocess for pair {pair:?}");
                return Ok(Arc::clone(existing));
            }
            warn!("subprocess for pair {pair:?} is dead, relaunching");
            if let Some(stale) = entries.remove(&pair) {
                stale.shutdown().await;
            }
        }

        let port = self.allocate_port();
        let command = self.build_command(viewport, browser, port);
        let command_line = render_command_line(&command);
        info!("launching subprocess for pair {pair:?} on port {port}");

        let client = ToolClient::spawn(command).map_err(|error| PoolError::SpawnFailure {
            command: command_line,
            error: error.into(),
        })?;

        self.wait_until_ready(&client, viewport, browser).await?;

        let handle = Arc::new(client);
        entries.insert(pair, Arc::clone(&handle));
        Ok(handle)
    }

    /// Marks the handle returned. The subprocess stays cached for the next
    /// cell of the same pair.
    pub fn release(&self, handle: Arc<ToolClient>) {
        debug!("released tool handle (healthy: {})", handle.is_healthy());
    }

    /// Terminates and forgets the pair, forcing the next acquire to relaunch.
    pub async fn evict(&self, viewport_name: &str, browser_name: &str) {
        let pair = (viewport_name.to_string(), browser_name.to_string());
        let removed = self.entries.lock().await.remove(&pair);
        if let Some(client) = removed {
            warn!("evicting subprocess for pair {pair:?}");
            client.shutdown().await;
        }
    }

    /// Drains every launched subprocess. Cleanup problems are logged and
    /// swallowed; one stuck subprocess must not block the rest, and teardown
    /// noise is never a test failure.
    pub async fn shutdown(&self) {
        let drained: Vec<((String, String), Arc<ToolClient>)> =
            self.entries.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        info!("shutting down {} automation subprocess(es)", drained.len());
        for (pair, client) in drained {
            debug!("terminating subprocess for pair {pair:?}");
            client.shutdown().await;
        }
    }

    fn allocate_port(&self) -> u16 {
        let offset = self.next_port_offset.fetch_add(1, Ordering::Relaxed);
        self.launcher.base_port + offset
    }

    fn build_command(
        &self,
        viewport: &ViewportProfile,
        browser: &BrowserProfile,
        port: u16,
    ) -> Command {
        let mut command = Command::new(&self.launcher.command);
        command.args(&self.launcher.base_args);
        command.args(&viewport.launch_args);
        command.args(&browser.launch_args);
        if let Some(executable) = &browser.executable_path {
            command.arg("--executable-path");
            command.arg(executable);
        }
        command.arg("--port");
        command.arg(port.to_string());

        // Always exported, not only for WebKit: engines that auto-detect fine
        // today have broken detection after browser updates often enough.
        let browsers_path = shellexpand::tilde(&self.launcher.browsers_path).into_owned();
        command.env(&self.launcher.browsers_path_env, browsers_path);
        command
    }

    /// Probes the stdio protocol until a tool-listing call succeeds.
    async fn wait_until_ready(
        &self,
        client: &ToolClient,
        viewport: &ViewportProfile,
        browser: &BrowserProfile,
    ) -> Result<()> {
        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        let mut initialized = false;
        loop {
            if initialized || client.initialize().await.is_ok() {
                initialized = true;
                match client.list_tools().await {
                    Ok(tools) => {
                        debug!(
                            "subprocess ready with {} tools for ({}, {})",
                            tools.len(),
                            viewport.name,
                            browser.name
                        );
                        return Ok(());
                    }
                    Err(error) => debug!("tool listing not ready yet: {error}"),
                }
            }
            if Instant::now() >= deadline {
                client.shutdown().await;
                return Err(PoolError::SubprocessLaunchTimeout {
                    viewport: viewport.name.clone(),
                    browser: browser.name.clone(),
                    timeout: LAUNCH_TIMEOUT,
                }
                .into());
            }
            sleep(PROBE_INTERVAL).await;
        }
    }
}

fn render_command_line(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![std_command.get_program().to_string_lossy().into_owned()];
    parts.extend(
        std_command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn pool() -> SubprocessPool {
        let catalog = Catalog::embedded().unwrap();
        SubprocessPool::new(catalog.launcher().clone())
    }

    #[test]
    fn ports_are_monotonic_from_the_base() {
        let pool = pool();
        assert_eq!(pool.allocate_port(), 8900);
        assert_eq!(pool.allocate_port(), 8901);
        assert_eq!(pool.allocate_port(), 8902);
    }

    #[test]
    fn command_line_orders_base_viewport_browser_then_port() {
        let catalog = Catalog::embedded().unwrap();
        let pool = SubprocessPool::new(catalog.launcher().clone());
        let viewport = catalog.lookup_viewport("iphone-13-pro").unwrap();
        let browser = catalog.lookup_browser("webkit-ios").unwrap();

        let command = pool.build_command(viewport, browser, 8900);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let headless = args.iter().position(|a| a == "--headless").unwrap();
        let viewport_size = args.iter().position(|a| a == "--viewport-size").unwrap();
        let engine = args.iter().position(|a| a == "--browser").unwrap();
        let port = args.iter().position(|a| a == "--port").unwrap();
        assert!(headless < viewport_size);
        assert!(viewport_size < engine);
        assert!(engine < port);
        assert_eq!(args[port + 1], "8900");
    }

    #[test]
    fn browsers_path_is_exported_for_every_engine() {
        let catalog = Catalog::embedded().unwrap();
        let pool = SubprocessPool::new(catalog.launcher().clone());
        let viewport = catalog.lookup_viewport("desktop-standard").unwrap();

        for browser_name in ["chromium-desktop", "webkit-desktop", "firefox-desktop"] {
            let browser = catalog.lookup_browser(browser_name).unwrap();
            let command = pool.build_command(viewport, browser, 9000);
            let envs: Vec<(String, Option<String>)> = command
                .as_std()
                .get_envs()
                .map(|(k, v)| {
                    (
                        k.to_string_lossy().into_owned(),
                        v.map(|v| v.to_string_lossy().into_owned()),
                    )
                })
                .collect();
            assert!(envs
                .iter()
                .any(|(k, v)| k == "PLAYWRIGHT_BROWSERS_PATH" && v.is_some()));
        }
    }

    #[tokio::test]
    async fn shutdown_with_no_subprocesses_is_a_no_op() {
        pool().shutdown().await;
    }
}
