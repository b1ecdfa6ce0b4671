use std::{io::Write, path::PathBuf, time::Duration};

use console::Style;
use thiserror::Error;
use tokio::io;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I couldn't parse a target URL from the request. Include a site to test, e.g. 'test careers.example.com on iphone'")]
    MalformedRequest { message: String },
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown {kind} profile '{name}'. Known profiles: {known}")]
    UnknownProfile {
        kind: String,
        name: String,
        known: String,
    },

    #[error("Can't open catalog file. Double check you've supplied correct path\npath = {path}")]
    OpenFileFailure { path: PathBuf, error: io::Error },

    #[error("Malformed catalog document\nerror = {error}")]
    MalformedCatalog { error: serde_yaml::Error },
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("The request produced no cells to run")]
    EmptyPlan,

    #[error("A test plan needs a target URL")]
    MissingTargetUrl,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No scenario matches '{reference}'. Available scenarios: {available}")]
    ScenarioNotFound {
        reference: String,
        available: String,
    },

    #[error("Reference '{reference}' is ambiguous, it matches: {matches}")]
    Ambiguous { reference: String, matches: String },

    #[error("No scenarios have been run yet, nothing to replay")]
    NoHistory,

    #[error("Run artifact {run_id} already exists and is immutable")]
    Duplicate { run_id: String },

    #[error("No run artifact named '{run_id}'. Recent runs: {available}")]
    RunNotFound { run_id: String, available: String },

    #[error("Failed to write {path}, the document was not persisted\nerror = {error}")]
    WriteFailure { path: PathBuf, error: io::Error },

    #[error("Failed to read {path}\nerror = {error}")]
    ReadFailure { path: PathBuf, error: io::Error },

    #[error("Malformed document at {path}\nerror = {error}")]
    MalformedDocument {
        path: PathBuf,
        error: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Automation subprocess for ({viewport}, {browser}) did not become ready within {timeout:?}")]
    SubprocessLaunchTimeout {
        viewport: String,
        browser: String,
        timeout: Duration,
    },

    #[error("Failed to spawn automation subprocess\ncommand = {command}\nerror = {error}")]
    SpawnFailure { command: String, error: io::Error },
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool call '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Tool protocol error: {message}")]
    Protocol { message: String },

    #[error("Tool call '{tool}' timed out after {timeout:?}")]
    CallTimeout { tool: String, timeout: Duration },

    #[error("Automation subprocess disconnected")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Model API request failed\nerror = {error}")]
    RequestFailed { error: reqwest::Error },

    #[error("Failed to parse model API response\nerror = {error}")]
    DeserializationFailure { error: reqwest::Error },

    #[error("Model API returned status {status}: {body}")]
    ApiFailure { status: u16, body: String },

    #[error("Model credentials are missing. Set {var} to run tests")]
    MissingCredentials { var: String },

    #[error("Agent did not finish within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Agent exceeded the maximum of {max_turns} tool turns without a final answer")]
    TurnBudgetExhausted { max_turns: usize },
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Result file extension '{extension}' is not supported. Supported: {supported}")]
    InvalidFileExtension { extension: String, supported: String },

    #[error("Non-UTF8 paths are not supported\npath = {path}")]
    NonUTF8Path { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("A test run is already in progress, try again once it completes")]
    Busy,

    #[error("Event is missing a message body")]
    EmptyBody,

    #[error("Event is not addressed to the orchestrator")]
    NotAddressed,

    #[error("Stale event ({age_seconds}s old), dropped")]
    Stale { age_seconds: i64 },

    #[error("Duplicate event {event_id}, dropped")]
    Duplicate { event_id: String },
}

pub fn default_error_handler(
    error: Box<dyn std::error::Error + Send + 'static>,
    output: &mut dyn Write,
) {
    let red = Style::new().red();
    _ = writeln!(output, "{}", red.apply_to(error));
}
