use serde_with::DurationSecondsWithFrac;
use std::{fmt::Display, time::Duration};

use serde::Serialize;
use serde_with::serde_as;

#[derive(Serialize)]
pub struct RunStarted {
    pub run_id: String,
    pub scenario_name: String,
    pub total_cells: usize,
    pub estimated_duration_s: u64,
}

impl Display for RunStarted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!(
            "Run {} started: {} cell(s) for '{}', estimated {}s",
            self.run_id, self.total_cells, self.scenario_name, self.estimated_duration_s
        ))
    }
}

#[serde_as]
#[derive(Serialize)]
pub struct RunCompleted {
    pub run_id: String,
    pub scenario_name: String,
    pub state: String,
    pub passed: usize,
    pub failed: usize,
    pub artifact_path: String,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    pub summary: String,
}

impl Display for RunCompleted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.as_ref() {
            "PASS" => f.write_str("Test run finished\n")?,
            "PARTIAL" | "FAIL" => f.write_str("Test run finished with failures\n")?,
            _ => f.write_str("Test run crashed\n")?,
        };
        f.write_fmt(format_args!("\tstate: {}\n", self.state))?;
        f.write_fmt(format_args!("\tpassed: {}\n", self.passed))?;
        f.write_fmt(format_args!("\tfailed: {}\n", self.failed))?;
        f.write_fmt(format_args!("\tartifact: {}\n", self.artifact_path))?;

        let s = self.duration.as_secs();
        let ms = self.duration.subsec_millis();
        let (h, s) = (s / 3600, s % 3600);
        let (m, s) = (s / 60, s % 60);
        f.write_fmt(format_args!(
            "\tduration: {:02}:{:02}:{:02}.{:03}\n",
            h, m, s, ms
        ))?;
        f.write_str("\n")?;
        f.write_str(&self.summary)?;
        Ok(())
    }
}
