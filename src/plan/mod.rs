pub mod model;

use anyhow::Result;
use time::OffsetDateTime;

use crate::catalog::Catalog;
use crate::errors::PlanError;
use crate::parser::{ParsedRequest, FLOW_LANDING, FLOW_PRICING, FLOW_SIGNUP};
use crate::store::model::{EnvironmentMatrix, ScenarioDefinition};
use model::{MatrixCell, StepAction, TestFlow, TestPlan, TestStep};

const AVG_CELL_SECONDS: u64 = 45;
const DEFAULT_SIGNUP_EMAIL: &str = "qa.tester+signup@example.com";

pub struct PlanBuilder<'a> {
    catalog: &'a Catalog,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn build(&self, parsed: &ParsedRequest) -> Result<TestPlan> {
        let target_url = parsed
            .target_url
            .as_ref()
            .ok_or(PlanError::MissingTargetUrl)?;
        let target = target_url.to_string();
        let host = target_url.host_str().unwrap_or(&target).to_string();

        let flows: Vec<TestFlow> = parsed
            .flow_names
            .iter()
            .map(|name| build_flow(name, &target, parsed))
            .collect();

        let viewports = self.ordered_viewports(&parsed.viewport_names)?;
        let browsers = self.ordered_browsers(&parsed.browser_names)?;
        let networks = self.ordered_networks(&parsed.network_names)?;

        let primary_flow = flows
            .first()
            .map(|f| f.flow_name.clone())
            .unwrap_or_else(|| FLOW_LANDING.to_string());
        let scenario_name = format!("{}-{}-{}vp", primary_flow, host, viewports.len());

        self.assemble(
            scenario_name,
            target,
            parsed.raw_message.clone(),
            flows,
            viewports,
            browsers,
            networks,
        )
    }

    /// Rebuilds a fresh plan (new plan id, new cell ids) from a stored
    /// scenario, keeping its flows and environment matrix.
    pub fn rebuild_from_scenario(
        &self,
        scenario: &ScenarioDefinition,
        user_request: &str,
    ) -> Result<TestPlan> {
        let viewports = self.ordered_viewports(&scenario.environment_matrix.viewports)?;
        let browsers = self.ordered_browsers(&scenario.environment_matrix.browsers)?;
        let networks = self.ordered_networks(&scenario.environment_matrix.networks)?;

        self.assemble(
            scenario.scenario_name.clone(),
            scenario.target_url.clone(),
            user_request.to_string(),
            scenario.flows.clone(),
            viewports,
            browsers,
            networks,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        scenario_name: String,
        target_url: String,
        user_request: String,
        flows: Vec<TestFlow>,
        viewports: Vec<String>,
        browsers: Vec<String>,
        networks: Vec<String>,
    ) -> Result<TestPlan> {
        let now = OffsetDateTime::now_utc();
        let run_timestamp = now.unix_timestamp();

        let mut cells = Vec::new();
        for flow in &flows {
            for viewport_name in &viewports {
                let viewport = self.catalog.lookup_viewport(viewport_name)?;
                for browser_name in &browsers {
                    let browser = self.catalog.lookup_browser(browser_name)?;
                    for network_name in &networks {
                        let network = self.catalog.lookup_network(network_name)?;
                        cells.push(MatrixCell {
                            cell_id: format!(
                                "{}_{}_{}_{}_{}",
                                flow.flow_name,
                                viewport.name,
                                browser.name,
                                network.name,
                                run_timestamp
                            ),
                            flow: flow.clone(),
                            viewport: viewport.clone(),
                            browser: browser.clone(),
                            network: network.clone(),
                            created_at: now,
                        });
                    }
                }
            }
        }

        if cells.is_empty() {
            return Err(PlanError::EmptyPlan.into());
        }

        let total_cells = cells.len();
        Ok(TestPlan {
            plan_id: format!("plan_{run_timestamp}"),
            scenario_id: slug(&scenario_name),
            scenario_name,
            target_url,
            user_request,
            flows,
            cells,
            total_cells,
            estimated_duration_s: total_cells as u64 * AVG_CELL_SECONDS,
        })
    }

    fn ordered_viewports(&self, names: &[String]) -> Result<Vec<String>> {
        for name in names {
            self.catalog.lookup_viewport(name)?;
        }
        Ok(order_by_catalog(names, |name| {
            self.catalog
                .list_all_viewports()
                .iter()
                .position(|v| v.name == *name)
        }))
    }

    fn ordered_browsers(&self, names: &[String]) -> Result<Vec<String>> {
        for name in names {
            self.catalog.lookup_browser(name)?;
        }
        Ok(order_by_catalog(names, |name| {
            self.catalog
                .list_all_browsers()
                .iter()
                .position(|b| b.name == *name)
        }))
    }

    fn ordered_networks(&self, names: &[String]) -> Result<Vec<String>> {
        for name in names {
            self.catalog.lookup_network(name)?;
        }
        Ok(order_by_catalog(names, |name| {
            self.catalog
                .list_all_networks()
                .iter()
                .position(|n| n.name == *name)
        }))
    }
}

impl TestPlan {
    /// The persistable form of this plan. The environment matrix is the union
    /// of profile names its cells actually reference.
    pub fn to_scenario_definition(&self) -> ScenarioDefinition {
        let mut viewports: Vec<String> = Vec::new();
        let mut browsers: Vec<String> = Vec::new();
        let mut networks: Vec<String> = Vec::new();
        for cell in &self.cells {
            push_unique(&mut viewports, &cell.viewport.name);
            push_unique(&mut browsers, &cell.browser.name);
            push_unique(&mut networks, &cell.network.name);
        }

        let mut tags: Vec<String> = self.flows.iter().map(|f| f.flow_name.clone()).collect();
        if viewports.len() * browsers.len() * networks.len() > 1 {
            tags.push("matrix".to_string());
        }

        let now = OffsetDateTime::now_utc();
        ScenarioDefinition {
            scenario_id: self.scenario_id.clone(),
            scenario_name: self.scenario_name.clone(),
            target_url: self.target_url.clone(),
            flows: self.flows.clone(),
            environment_matrix: EnvironmentMatrix {
                viewports,
                browsers,
                networks,
            },
            tags,
            created_at: now,
            last_run_at: Some(now),
        }
    }
}

/// Catalog order is the canonical dimension order for the Cartesian product.
fn order_by_catalog(names: &[String], position: impl Fn(&String) -> Option<usize>) -> Vec<String> {
    let mut ordered: Vec<String> = names.to_vec();
    ordered.sort_by_key(|name| position(name).unwrap_or(usize::MAX));
    ordered.dedup();
    ordered
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut previous_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            previous_dash = false;
        } else if !previous_dash && !out.is_empty() {
            out.push('-');
            previous_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn build_flow(name: &str, target_url: &str, parsed: &ParsedRequest) -> TestFlow {
    match name {
        FLOW_SIGNUP => signup_flow(target_url, parsed),
        FLOW_PRICING => pricing_flow(target_url),
        _ => landing_flow(target_url),
    }
}

fn landing_flow(target_url: &str) -> TestFlow {
    TestFlow {
        flow_name: FLOW_LANDING.to_string(),
        steps: vec![
            step(
                1,
                StepAction::Navigate,
                target_url,
                None,
                "Within 15 seconds the page document finishes loading",
                15,
            ),
            step(
                2,
                StepAction::WaitForSelector,
                "body",
                None,
                "Within 10 seconds selector 'body' is attached and visible",
                10,
            ),
            step(
                3,
                StepAction::AssertVisible,
                "h1, [role='heading']",
                None,
                "A top-level heading is visible in the viewport",
                5,
            ),
            step(
                4,
                StepAction::Screenshot,
                "landing",
                None,
                "A screenshot named 'landing' is captured",
                10,
            ),
        ],
    }
}

fn signup_flow(target_url: &str, parsed: &ParsedRequest) -> TestFlow {
    let email = parsed
        .extracted_email
        .clone()
        .unwrap_or_else(|| DEFAULT_SIGNUP_EMAIL.to_string());

    let mut steps = vec![
        step(
            1,
            StepAction::Navigate,
            target_url,
            None,
            "Within 15 seconds the page document finishes loading",
            15,
        ),
        step(
            2,
            StepAction::Click,
            "a[href*='signup'], a[href*='register'], a[href*='join']",
            None,
            "Within 10 seconds a signup form becomes visible",
            10,
        ),
        step(
            3,
            StepAction::Fill,
            "input[type='email'], input[name*='email']",
            Some(email),
            "The email field contains the provided value",
            10,
        ),
    ];
    if let Some(phone) = &parsed.extracted_phone {
        steps.push(step(
            steps.len() as u32 + 1,
            StepAction::Fill,
            "input[type='tel'], input[name*='phone']",
            Some(phone.clone()),
            "The phone field contains the provided value",
            10,
        ));
    }
    let submit_number = steps.len() as u32 + 1;
    steps.push(step(
        submit_number,
        StepAction::Click,
        "button[type='submit'], input[type='submit']",
        None,
        "Within 10 seconds the form submits without a client-side validation error",
        10,
    ));
    steps.push(step(
        submit_number + 1,
        StepAction::Screenshot,
        "signup",
        None,
        "A screenshot named 'signup' is captured",
        10,
    ));

    TestFlow {
        flow_name: FLOW_SIGNUP.to_string(),
        steps,
    }
}

fn pricing_flow(target_url: &str) -> TestFlow {
    TestFlow {
        flow_name: FLOW_PRICING.to_string(),
        steps: vec![
            step(
                1,
                StepAction::Navigate,
                target_url,
                None,
                "Within 15 seconds the page document finishes loading",
                15,
            ),
            step(
                2,
                StepAction::Click,
                "a[href*='pricing'], a[href*='plans']",
                None,
                "Within 10 seconds the pricing page is reached",
                10,
            ),
            step(
                3,
                StepAction::WaitForSelector,
                "main, [class*='pricing'], [class*='plan']",
                None,
                "Within 10 seconds pricing content is attached and visible",
                10,
            ),
            step(
                4,
                StepAction::Screenshot,
                "pricing",
                None,
                "A screenshot named 'pricing' is captured",
                10,
            ),
        ],
    }
}

fn step(
    step_number: u32,
    action: StepAction,
    target: &str,
    value: Option<String>,
    expected_outcome: &str,
    timeout_seconds: u64,
) -> TestStep {
    TestStep {
        step_number,
        action,
        target: target.to_string(),
        value,
        expected_outcome: expected_outcome.to_string(),
        timeout_seconds,
    }
}
