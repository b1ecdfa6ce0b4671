use std::{fmt::Display, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Chromium,
    Webkit,
    Firefox,
}

impl Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Engine::Chromium => f.write_str("chromium"),
            Engine::Webkit => f.write_str("webkit"),
            Engine::Firefox => f.write_str("firefox"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Desktop,
    Mobile,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    Tablet,
    Desktop,
}

/// A device emulation profile. `launch_args` is the exact argument vector the
/// automation subprocess needs to create its browser context with this
/// emulation; resizing after launch is not supported because media queries and
/// touch emulation are only applied at context creation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ViewportProfile {
    pub name: String,
    pub display_name: String,
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub is_mobile: bool,
    pub device_class: DeviceClass,
    #[serde(default)]
    pub baseline: bool,
    #[serde(default)]
    pub launch_args: Vec<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BrowserProfile {
    pub name: String,
    pub display_name: String,
    pub engine: Engine,
    pub platform: Platform,
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Required for engines the launcher can't auto-detect, e.g. WebKit.
    pub executable_path: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub name: String,
    pub display_name: String,
    pub latency_ms: u32,
    pub download_kbps: u32,
    pub upload_kbps: u32,
    #[serde(default)]
    pub packet_loss_pct: f64,
}

impl NetworkProfile {
    pub fn is_baseline(&self) -> bool {
        self.name == super::NETWORK_NORMAL
    }
}

/// How to start one automation subprocess. The full command line is
/// `command base_args <viewport args> <browser args> --port <P>`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LauncherConfig {
    pub command: String,
    #[serde(default)]
    pub base_args: Vec<String>,
    /// Environment variable carrying the browser installation root. Set on
    /// every launch regardless of engine; WebKit auto-detection fails without it.
    pub browsers_path_env: String,
    pub browsers_path: String,
    pub base_port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CatalogDocument {
    pub launcher: LauncherConfig,
    pub viewports: Vec<ViewportProfile>,
    pub browsers: Vec<BrowserProfile>,
    pub networks: Vec<NetworkProfile>,
    /// Hosts that always get WebKit coverage regardless of request keywords.
    #[serde(default)]
    pub force_webkit_hosts: Vec<String>,
}
