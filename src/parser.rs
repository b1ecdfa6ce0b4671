use anyhow::Result;
use regex::Regex;
use url::Url;

use crate::catalog::Catalog;
use crate::errors::ParseError;

pub const FLOW_LANDING: &str = "landing";
pub const FLOW_SIGNUP: &str = "signup";
pub const FLOW_PRICING: &str = "pricing";

/// References that resolve against run history instead of the scenario index.
pub const LAST_REFERENCES: &[&str] = &["last", "last test", "latest", "most recent"];

/// Structured form of one natural-language testing request. Transient, built
/// once per orchestration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub raw_message: String,
    /// Absent only for re-run requests, which resolve a stored scenario.
    pub target_url: Option<Url>,
    pub flow_names: Vec<String>,
    pub viewport_names: Vec<String>,
    pub browser_names: Vec<String>,
    pub network_names: Vec<String>,
    pub is_rerun: bool,
    pub rerun_reference: Option<String>,
    pub custom_user_instruction: String,
    pub extracted_email: Option<String>,
    pub extracted_phone: Option<String>,
}

pub struct RequestParser<'a> {
    catalog: &'a Catalog,
}

impl<'a> RequestParser<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Deterministic, pure transformation of the raw message.
    pub fn parse(&self, message: &str) -> Result<ParsedRequest> {
        let raw_message = message.trim().to_string();

        let rerun_reference = detect_rerun_reference(&raw_message);
        let is_rerun = rerun_reference.is_some();

        let target_url = extract_target_url(&raw_message);
        if target_url.is_none() && !is_rerun {
            return Err(ParseError::MalformedRequest {
                message: raw_message,
            }
            .into());
        }

        let host = target_url
            .as_ref()
            .and_then(|u| u.host_str().map(str::to_string));
        let selection = self
            .catalog
            .select_profiles_for_keywords(&raw_message, host.as_deref());

        Ok(ParsedRequest {
            custom_user_instruction: raw_message.clone(),
            flow_names: detect_flows(&raw_message),
            extracted_email: extract_email(&raw_message),
            extracted_phone: extract_phone(&raw_message),
            raw_message,
            target_url,
            viewport_names: selection.viewports,
            browser_names: selection.browsers,
            network_names: selection.networks,
            is_rerun,
            rerun_reference,
        })
    }
}

/// Subdomain-preserving URL extraction. Tries, in order: chat-surface-wrapped
/// forms (`<https://host|label>`), explicit `scheme://host` forms, then bare
/// dotted hostnames against a closed TLD list. There is deliberately no
/// default-URL fallback; a naked substring match would strip subdomains.
fn extract_target_url(message: &str) -> Option<Url> {
    let wrapped = Regex::new(r"<(https?://[^>|\s]+)(?:\|[^>]*)?>").unwrap();
    if let Some(captures) = wrapped.captures(message) {
        if let Ok(url) = Url::parse(&captures[1]) {
            return Some(url);
        }
    }

    let explicit = Regex::new(r"\bhttps?://[^\s<>]+").unwrap();
    if let Some(found) = explicit.find(message) {
        let candidate = found.as_str().trim_end_matches(['.', ',', '!', '?', ')']);
        if let Ok(url) = Url::parse(candidate) {
            return Some(url);
        }
    }

    let bare = Regex::new(
        r"(?i)\b((?:[a-z0-9][a-z0-9-]*\.)+(?:com|org|net|io|dev|app|club|tech|ai|co|xyz|me|info|us|uk|in|edu|gov))\b(/[^\s]*)?",
    )
    .unwrap();
    for captures in bare.captures_iter(message) {
        let whole = captures.get(0).unwrap();
        // A hostname preceded by '@' is the domain part of an email literal.
        if message[..whole.start()].ends_with('@') {
            continue;
        }
        let host = &captures[1];
        let path = captures.get(2).map(|m| m.as_str()).unwrap_or("");
        if let Ok(url) = Url::parse(&format!("https://{}{}", host.to_lowercase(), path)) {
            return Some(url);
        }
    }

    None
}

fn detect_flows(message: &str) -> Vec<String> {
    let lowered = message.to_lowercase();
    let mut flows = Vec::new();
    if ["register", "signup", "sign up", "sign-up", "recruit"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        flows.push(FLOW_SIGNUP.to_string());
    }
    if ["pricing", "plans"].iter().any(|k| lowered.contains(k)) {
        flows.push(FLOW_PRICING.to_string());
    }
    if flows.is_empty() {
        flows.push(FLOW_LANDING.to_string());
    }
    flows
}

/// Matches `re-run <ref>`, `rerun <ref>`, `run <ref> again`, `repeat <ref>`
/// and `execute <scenario-id>`. History references (`last`, `latest`, ...)
/// are preserved verbatim and resolved against the store later.
fn detect_rerun_reference(message: &str) -> Option<String> {
    let lowered = message.to_lowercase();

    let patterns = [
        Regex::new(r"re-?run\s+(.+)").unwrap(),
        Regex::new(r"\brun\s+(.+?)\s+again\b").unwrap(),
        Regex::new(r"\brepeat\s+(.+)").unwrap(),
        Regex::new(r"\bexecute\s+([a-z0-9][a-z0-9_-]*)").unwrap(),
    ];

    for pattern in &patterns {
        if let Some(captures) = pattern.captures(&lowered) {
            let reference = captures[1].trim().trim_end_matches(['.', '!', '?']);
            let reference = reference.strip_prefix("the ").unwrap_or(reference).trim();
            if reference.is_empty() {
                continue;
            }
            for special in LAST_REFERENCES {
                if reference == *special || reference.starts_with(&format!("{special} ")) {
                    return Some((*special).to_string());
                }
            }
            return Some(reference.to_string());
        }
    }
    None
}

pub fn is_last_reference(reference: &str) -> bool {
    LAST_REFERENCES.contains(&reference.to_lowercase().trim())
}

fn extract_email(message: &str) -> Option<String> {
    let email = Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap();
    email.find(message).map(|m| m.as_str().to_string())
}

fn extract_phone(message: &str) -> Option<String> {
    let phone = Regex::new(r"\+?[0-9][0-9\- ]{7,}[0-9]").unwrap();
    phone.find(message).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(message: &str) -> ParsedRequest {
        let catalog = Catalog::embedded().unwrap();
        RequestParser::new(&catalog).parse(message).unwrap()
    }

    #[test]
    fn preserves_subdomains() {
        let parsed = parse("test careers.pointblank.club on iphone");
        assert_eq!(
            parsed.target_url.unwrap().host_str(),
            Some("careers.pointblank.club")
        );
        assert!(parsed
            .viewport_names
            .contains(&"iphone-13-pro".to_string()));
    }

    #[rstest]
    #[case("test https://app.example.com/login now", "app.example.com")]
    #[case("check <https://careers.pointblank.club|careers.pointblank.club>", "careers.pointblank.club")]
    #[case("check <http://shop.example.io>", "shop.example.io")]
    #[case("look at Example.COM please", "example.com")]
    fn url_extraction(#[case] message: &str, #[case] expected_host: &str) {
        let parsed = parse(message);
        assert_eq!(parsed.target_url.unwrap().host_str(), Some(expected_host));
    }

    #[test]
    fn email_domain_is_not_a_target() {
        let parsed = parse("signup on portal.example.com with user@throwaway.dev");
        assert_eq!(
            parsed.target_url.unwrap().host_str(),
            Some("portal.example.com")
        );
        assert_eq!(parsed.extracted_email.as_deref(), Some("user@throwaway.dev"));
    }

    #[test]
    fn missing_url_is_an_error() {
        let catalog = Catalog::embedded().unwrap();
        let result = RequestParser::new(&catalog).parse("test the thing on iphone");
        assert!(result.is_err());
    }

    #[rstest]
    #[case("test example.com signup flow", vec![FLOW_SIGNUP])]
    #[case("can users register on example.com?", vec![FLOW_SIGNUP])]
    #[case("check example.com pricing page", vec![FLOW_PRICING])]
    #[case("example.com plans and signup", vec![FLOW_SIGNUP, FLOW_PRICING])]
    #[case("test example.com", vec![FLOW_LANDING])]
    fn flow_detection(#[case] message: &str, #[case] expected: Vec<&str>) {
        assert_eq!(parse(message).flow_names, expected);
    }

    #[rstest]
    #[case("re-run last", "last")]
    #[case("rerun latest", "latest")]
    #[case("re-run the last test", "last")]
    #[case("run checkout-example-com again", "checkout-example-com")]
    #[case("repeat most recent", "most recent")]
    #[case("execute landing-example-com-1vp", "landing-example-com-1vp")]
    fn rerun_detection(#[case] message: &str, #[case] expected: &str) {
        let parsed = parse(message);
        assert!(parsed.is_rerun);
        assert_eq!(parsed.rerun_reference.as_deref(), Some(expected));
    }

    #[test]
    fn rerun_with_special_reference_needs_no_url() {
        let parsed = parse("re-run last");
        assert!(parsed.target_url.is_none());
        assert!(is_last_reference(parsed.rerun_reference.as_deref().unwrap()));
    }

    #[test]
    fn plain_run_is_not_a_rerun() {
        let parsed = parse("test example.com on safari and chrome");
        assert!(!parsed.is_rerun);
        assert!(parsed.rerun_reference.is_none());
    }

    #[test]
    fn matrix_request_expands_to_at_least_three_cells_worth() {
        let parsed = parse("test pointblank.club responsive on safari and chrome");
        assert_eq!(
            parsed.viewport_names,
            vec!["iphone-13-pro", "ipad-air", "desktop-standard"]
        );
        assert!(parsed.browser_names.contains(&"webkit-desktop".to_string()));
        assert!(parsed
            .browser_names
            .contains(&"chromium-desktop".to_string()));
    }

    #[test]
    fn phone_literal_extraction() {
        let parsed = parse("register on example.com with +1 555 0100 4242");
        assert_eq!(parsed.extracted_phone.as_deref(), Some("+1 555 0100 4242"));
    }

    #[test]
    fn parser_is_deterministic() {
        let first = parse("test careers.pointblank.club responsive under slow 3g");
        let second = parse("test careers.pointblank.club responsive under slow 3g");
        assert_eq!(first, second);
    }

    #[test]
    fn keeps_the_original_message_for_the_agent() {
        let message = "test example.com and check the repo list of user octocat";
        let parsed = parse(message);
        assert_eq!(parsed.custom_user_instruction, message);
    }
}
