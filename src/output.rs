//! Rendering of a command line run.

use serde::Serialize;
use std::time::Duration;

use crate::cli::{OutputFormat, VerbosityLevel};
use crate::pipeline::CheckResult;
use crate::report::Report;

/// Verdict for one input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
    Error,
}

impl Verdict {
    pub fn of(result: &CheckResult) -> Self {
        match &result.outcome {
            Ok(report) if report.acceptable => Verdict::Accepted,
            Ok(_) => Verdict::Rejected,
            Err(_) => Verdict::Error,
        }
    }
}

/// Totals of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub errors: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn from_results(results: &[CheckResult], duration: Duration) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            duration,
            ..RunSummary::default()
        };
        for result in results {
            match Verdict::of(result) {
                Verdict::Accepted => summary.accepted += 1,
                Verdict::Rejected => summary.rejected += 1,
                Verdict::Error => summary.errors += 1,
            }
        }
        summary
    }

    pub fn all_accepted(&self) -> bool {
        self.accepted == self.total
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    input: &'a str,
    verdict: Verdict,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a Report>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct JsonRun<'a> {
    summary: &'a RunSummary,
    results: Vec<JsonEntry<'a>>,
}

/// Formatter for check results
pub struct Output {
    format: OutputFormat,
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(format: OutputFormat, verbosity: VerbosityLevel) -> Self {
        Self {
            format,
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn with_colors(mut self, show_colors: bool) -> Self {
        self.show_colors = show_colors;
        self
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    pub fn format_results(&self, results: &[CheckResult], duration: Duration) -> String {
        let summary = RunSummary::from_results(results, duration);
        match self.format {
            OutputFormat::Json => self.format_json(results, &summary),
            OutputFormat::Summary => self.format_summary(&summary),
            OutputFormat::Human => self.format_human(results, &summary),
        }
    }

    fn format_human(&self, results: &[CheckResult], summary: &RunSummary) -> String {
        let mut output = String::new();

        if self.verbosity == VerbosityLevel::Quiet {
            if !summary.all_accepted() {
                output.push_str(&format!(
                    "Rejected: {} Errors: {}\n",
                    summary.rejected, summary.errors
                ));
            }
            return output;
        }

        for result in results {
            let verdict = Verdict::of(result);
            if verdict != Verdict::Accepted || self.verbosity >= VerbosityLevel::Verbose {
                output.push_str(&self.format_result(result));
                output.push('\n');
            }
        }
        output.push_str(&self.format_summary(summary));
        output
    }

    pub fn format_result(&self, result: &CheckResult) -> String {
        let duration = format_duration(result.duration);
        match &result.outcome {
            Ok(report) if report.acceptable => format!(
                "{}  {} ({}) - {}",
                self.colorize("✓ ACCEPTED", "32"),
                result.input,
                duration,
                report.scenario.as_deref().unwrap_or_default()
            ),
            Ok(report) => {
                let mut output = format!(
                    "{}  {} ({})",
                    self.colorize("✗ REJECTED", "31"),
                    result.input,
                    duration
                );
                for reason in rejection_reasons(report) {
                    output.push_str(&format!("\n    {}", reason));
                }
                output
            }
            Err(e) => format!(
                "{}  {} ({}) - {}",
                self.colorize("⚠ ERROR", "33"),
                result.input,
                duration,
                e
            ),
        }
    }

    fn format_summary(&self, summary: &RunSummary) -> String {
        let mut output = String::new();
        output.push_str("Check Summary:\n");
        output.push_str(&format!("  Total documents: {}\n", summary.total));
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Accepted:", "32"),
            summary.accepted
        ));
        if summary.rejected > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Rejected:", "31"),
                summary.rejected
            ));
        }
        if summary.errors > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Errors:", "33"),
                summary.errors
            ));
        }
        output.push_str(&format!(
            "  Acceptance rate: {:.1}%\n",
            summary.acceptance_rate()
        ));
        output.push_str(&format!(
            "  Duration: {}\n",
            format_duration(summary.duration)
        ));
        output
    }

    fn format_json(&self, results: &[CheckResult], summary: &RunSummary) -> String {
        let run = JsonRun {
            summary,
            results: results
                .iter()
                .map(|result| JsonEntry {
                    input: &result.input,
                    verdict: Verdict::of(result),
                    duration_ms: result.duration.as_millis(),
                    report: result.outcome.as_ref().ok(),
                    error: result.outcome.as_ref().err().map(|e| e.to_string()),
                })
                .collect(),
        };
        match serde_json::to_string_pretty(&run) {
            Ok(json) => format!("{}\n", json),
            Err(e) => format!("{{\"error\": \"{}\"}}\n", e),
        }
    }
}

/// Why a report is not acceptable, in pipeline order
fn rejection_reasons(report: &Report) -> Vec<String> {
    let mut reasons = Vec::new();
    if !report.well_formed {
        reasons.push("document is not well-formed".to_string());
        for error in &report.syntax_errors {
            reasons.push(format!("  {}", error));
        }
        return reasons;
    }
    if let Some(failure) = &report.selection_failure {
        reasons.push(failure.clone());
        return reasons;
    }
    if let Some(schema) = &report.schema
        && !schema.is_valid()
    {
        reasons.push("schema validation failed".to_string());
        for error in schema.errors() {
            reasons.push(format!("  {}", error));
        }
    }
    for rule in report.failed_rules() {
        reasons.push(format!("business rules {} reported errors", rule.resource.name));
    }
    reasons
}

fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}
