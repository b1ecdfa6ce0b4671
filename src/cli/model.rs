use std::fmt::Display;

use anyhow::Result;
use serde::Serialize;

/// Output formats for progress lines and structured results. `Plain` keeps
/// the text output but drops animated progress bars, for CI logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Format {
    #[default]
    Standard,
    Plain,
    Json,
    Yaml,
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Standard => f.write_str("standard"),
            Format::Plain => f.write_str("plain"),
            Format::Json => f.write_str("json"),
            Format::Yaml => f.write_str("yaml"),
        }
    }
}

impl Format {
    pub fn progress(&self, message: &str) {
        match self {
            Format::Standard | Format::Plain => println!("{message}"),
            Format::Json | Format::Yaml => {}
        }
    }

    pub fn format<T: Serialize + Display>(&self, value: T) -> Result<()> {
        match self {
            Format::Standard | Format::Plain => println!("{value}"),
            Format::Json => println!("{}", serde_json::to_string(&value)?),
            Format::Yaml => println!("{}", serde_yaml::to_string(&value)?),
        }
        Ok(())
    }

    pub fn supports_progress_bars(&self) -> bool {
        matches!(self, Format::Standard)
    }
}
