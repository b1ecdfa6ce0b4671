pub mod model;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;

use crate::errors::CatalogError;
use model::{BrowserProfile, CatalogDocument, LauncherConfig, NetworkProfile, ViewportProfile};

pub const NETWORK_NORMAL: &str = "normal";
pub const NETWORK_SLOW_3G: &str = "slow-3g";
pub const NETWORK_FLAKY_EDGE: &str = "flaky-edge";

pub const VIEWPORT_IPHONE: &str = "iphone-13-pro";
pub const VIEWPORT_IPAD: &str = "ipad-air";
pub const VIEWPORT_ANDROID: &str = "android-medium";
pub const VIEWPORT_DESKTOP: &str = "desktop-standard";

pub const BROWSER_CHROMIUM: &str = "chromium-desktop";
pub const BROWSER_WEBKIT: &str = "webkit-desktop";
pub const BROWSER_WEBKIT_IOS: &str = "webkit-ios";
pub const BROWSER_FIREFOX: &str = "firefox-desktop";

const DEFAULT_CATALOG: &str = include_str!("default_catalog.yaml");

/// Profile names picked for a request, in catalog order within each dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSelection {
    pub viewports: Vec<String>,
    pub browsers: Vec<String>,
    pub networks: Vec<String>,
}

/// Immutable environment catalog, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Catalog {
    document: CatalogDocument,
}

impl Catalog {
    pub fn embedded() -> Result<Self> {
        let document: CatalogDocument = serde_yaml::from_str(DEFAULT_CATALOG)
            .map_err(|error| CatalogError::MalformedCatalog { error })?;
        Ok(Self { document })
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let path_str = path.to_string_lossy();
        let expanded = shellexpand::tilde(path_str.as_ref()).into_owned();
        let content =
            fs::read_to_string(&expanded)
                .await
                .map_err(|error| CatalogError::OpenFileFailure {
                    path: PathBuf::from(&expanded),
                    error,
                })?;
        let document: CatalogDocument = serde_yaml::from_str(&content)
            .map_err(|error| CatalogError::MalformedCatalog { error })?;
        Ok(Self { document })
    }

    pub fn launcher(&self) -> &LauncherConfig {
        &self.document.launcher
    }

    pub fn lookup_viewport(&self, name: &str) -> Result<&ViewportProfile> {
        self.document
            .viewports
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                CatalogError::UnknownProfile {
                    kind: "viewport".into(),
                    name: name.into(),
                    known: join_names(self.document.viewports.iter().map(|v| v.name.as_str())),
                }
                .into()
            })
    }

    pub fn lookup_browser(&self, name: &str) -> Result<&BrowserProfile> {
        self.document
            .browsers
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| {
                CatalogError::UnknownProfile {
                    kind: "browser".into(),
                    name: name.into(),
                    known: join_names(self.document.browsers.iter().map(|b| b.name.as_str())),
                }
                .into()
            })
    }

    pub fn lookup_network(&self, name: &str) -> Result<&NetworkProfile> {
        self.document
            .networks
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| {
                CatalogError::UnknownProfile {
                    kind: "network".into(),
                    name: name.into(),
                    known: join_names(self.document.networks.iter().map(|n| n.name.as_str())),
                }
                .into()
            })
    }

    pub fn list_all_viewports(&self) -> &[ViewportProfile] {
        &self.document.viewports
    }

    pub fn list_all_browsers(&self) -> &[BrowserProfile] {
        &self.document.browsers
    }

    pub fn list_all_networks(&self) -> &[NetworkProfile] {
        &self.document.networks
    }

    pub fn document(&self) -> &CatalogDocument {
        &self.document
    }

    /// Maps request keywords (and the target host) to profile names. The input
    /// is the whole lowercased request, keyword matching is substring-based.
    pub fn select_profiles_for_keywords(
        &self,
        message: &str,
        target_host: Option<&str>,
    ) -> ProfileSelection {
        let message = message.to_lowercase();
        let has = |keyword: &str| message.contains(keyword);

        // A request that names a matrix gets the full responsive trio, so the
        // expansion always yields at least three cells.
        let matrix_request = has("responsive")
            || has("cross-browser")
            || has("cross browser")
            || (has("safari") && has("chrome"))
            || (has("mobile") && has("desktop"));

        let mut viewports: Vec<String> = Vec::new();
        if matrix_request {
            push_unique(&mut viewports, VIEWPORT_IPHONE);
            push_unique(&mut viewports, VIEWPORT_IPAD);
            push_unique(&mut viewports, VIEWPORT_DESKTOP);
        }
        if has("iphone") || has("ios") {
            push_unique(&mut viewports, VIEWPORT_IPHONE);
        }
        if has("ipad") {
            push_unique(&mut viewports, VIEWPORT_IPAD);
        }
        if has("android") {
            push_unique(&mut viewports, VIEWPORT_ANDROID);
        }
        if has("desktop") {
            push_unique(&mut viewports, VIEWPORT_DESKTOP);
        }
        if has("mobile") {
            push_unique(&mut viewports, VIEWPORT_IPHONE);
        }
        if viewports.is_empty() {
            push_unique(&mut viewports, VIEWPORT_DESKTOP);
        }

        let mut browsers: Vec<String> = Vec::new();
        if has("safari") {
            push_unique(&mut browsers, BROWSER_WEBKIT);
        }
        if has("ios") || has("iphone") {
            push_unique(&mut browsers, BROWSER_WEBKIT_IOS);
        }
        if has("chrome") {
            push_unique(&mut browsers, BROWSER_CHROMIUM);
        }
        if has("firefox") {
            push_unique(&mut browsers, BROWSER_FIREFOX);
        }
        if has("cross-browser") || has("cross browser") {
            push_unique(&mut browsers, BROWSER_CHROMIUM);
            push_unique(&mut browsers, BROWSER_WEBKIT);
        }
        if browsers.is_empty() {
            push_unique(&mut browsers, BROWSER_CHROMIUM);
        }
        if let Some(host) = target_host {
            if self.is_forced_webkit_host(host) {
                push_unique(&mut browsers, BROWSER_WEBKIT);
                push_unique(&mut browsers, BROWSER_WEBKIT_IOS);
            }
        }

        let mut networks: Vec<String> = vec![NETWORK_NORMAL.to_string()];
        if has("slow") || has("3g") {
            push_unique(&mut networks, NETWORK_SLOW_3G);
        }
        if has("flaky") {
            push_unique(&mut networks, NETWORK_FLAKY_EDGE);
        }

        ProfileSelection {
            viewports,
            browsers,
            networks,
        }
    }

    fn is_forced_webkit_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.document.force_webkit_hosts.iter().any(|forced| {
            host == *forced || host.ends_with(&format!(".{forced}"))
        })
    }
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn catalog() -> Catalog {
        Catalog::embedded().unwrap()
    }

    #[test]
    fn embedded_catalog_parses() {
        let catalog = catalog();
        assert_eq!(catalog.list_all_viewports().len(), 4);
        assert_eq!(catalog.list_all_browsers().len(), 4);
        assert_eq!(catalog.list_all_networks().len(), 3);
        assert_eq!(catalog.launcher().base_port, 8900);
    }

    #[test]
    fn lookup_unknown_profile_lists_known_names() {
        let error = catalog().lookup_viewport("galaxy-fold").unwrap_err();
        let message = format!("{error}");
        assert!(message.contains("galaxy-fold"));
        assert!(message.contains(VIEWPORT_IPHONE));
        assert!(message.contains(VIEWPORT_DESKTOP));
    }

    #[test]
    fn responsive_expands_to_three_viewports() {
        let selection = catalog().select_profiles_for_keywords("test example.com responsive", None);
        assert_eq!(
            selection.viewports,
            vec![VIEWPORT_IPHONE, VIEWPORT_IPAD, VIEWPORT_DESKTOP]
        );
    }

    #[rstest]
    #[case("check on iphone please", VIEWPORT_IPHONE)]
    #[case("our ios users see a blank page", VIEWPORT_IPHONE)]
    #[case("test ipad layout", VIEWPORT_IPAD)]
    #[case("android rendering", VIEWPORT_ANDROID)]
    #[case("desktop only", VIEWPORT_DESKTOP)]
    #[case("mobile check", VIEWPORT_IPHONE)]
    fn viewport_keywords(#[case] message: &str, #[case] expected: &str) {
        let selection = catalog().select_profiles_for_keywords(message, None);
        assert!(selection.viewports.iter().any(|v| v == expected));
    }

    #[rstest]
    #[case("safari is broken", BROWSER_WEBKIT)]
    #[case("verify in chrome", BROWSER_CHROMIUM)]
    #[case("firefox regression", BROWSER_FIREFOX)]
    fn browser_keywords(#[case] message: &str, #[case] expected: &str) {
        let selection = catalog().select_profiles_for_keywords(message, None);
        assert!(selection.browsers.iter().any(|b| b == expected));
    }

    #[test]
    fn iphone_adds_mobile_safari_additively() {
        let selection = catalog().select_profiles_for_keywords("iphone safari run", None);
        assert_eq!(selection.browsers, vec![BROWSER_WEBKIT, BROWSER_WEBKIT_IOS]);
    }

    #[test]
    fn cross_browser_selects_both_engines() {
        let selection = catalog().select_profiles_for_keywords("cross-browser pass", None);
        assert!(selection.browsers.contains(&BROWSER_CHROMIUM.to_string()));
        assert!(selection.browsers.contains(&BROWSER_WEBKIT.to_string()));
    }

    #[rstest]
    #[case("test example.com on safari and chrome")]
    #[case("cross-browser check of example.com")]
    #[case("test example.com on mobile and desktop")]
    fn matrix_requests_expand_to_at_least_three_cells(#[case] message: &str) {
        let selection = catalog().select_profiles_for_keywords(message, None);
        let cells =
            selection.viewports.len() * selection.browsers.len() * selection.networks.len();
        assert!(cells >= 3, "{message} produced only {cells} cell(s)");
    }

    #[test]
    fn normal_network_is_always_first() {
        let selection = catalog().select_profiles_for_keywords("test under slow 3g", None);
        assert_eq!(selection.networks, vec![NETWORK_NORMAL, NETWORK_SLOW_3G]);

        let selection = catalog().select_profiles_for_keywords("flaky connection", None);
        assert_eq!(selection.networks, vec![NETWORK_NORMAL, NETWORK_FLAKY_EDGE]);
    }

    #[test]
    fn forced_webkit_host_adds_webkit_browsers() {
        let selection = catalog()
            .select_profiles_for_keywords("test the landing page", Some("careers.pointblank.club"));
        assert!(selection.browsers.contains(&BROWSER_WEBKIT.to_string()));
        assert!(selection.browsers.contains(&BROWSER_WEBKIT_IOS.to_string()));

        let selection =
            catalog().select_profiles_for_keywords("test the landing page", Some("example.com"));
        assert_eq!(selection.browsers, vec![BROWSER_CHROMIUM]);
    }

    #[test]
    fn defaults_when_no_keywords() {
        let selection = catalog().select_profiles_for_keywords("test example.com", None);
        assert_eq!(selection.viewports, vec![VIEWPORT_DESKTOP]);
        assert_eq!(selection.browsers, vec![BROWSER_CHROMIUM]);
        assert_eq!(selection.networks, vec![NETWORK_NORMAL]);
    }
}
