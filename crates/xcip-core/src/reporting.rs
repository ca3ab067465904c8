//! Persisted session artifacts: pretty JSON and a Markdown summary.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use crate::orchestration::{FileStatus, SessionReport};
use crate::report::RunReport;

pub const SCHEMA_VERSION: &str = "1.0";

/// Envelope written as the session JSON artifact.
#[derive(Debug, Clone, Serialize)]
pub struct SessionArtifact<'a> {
    pub schema_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub passed: bool,
    pub files_passed: usize,
    pub files_failed: usize,
    pub session: &'a SessionReport,
}

impl<'a> SessionArtifact<'a> {
    pub fn new(session: &'a SessionReport) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            passed: !session.has_failures(),
            files_passed: session.passed_count(),
            files_failed: session.failed_count(),
            session,
        }
    }
}

pub fn render_session_json(session: &SessionReport) -> Result<String> {
    serde_json::to_string_pretty(&SessionArtifact::new(session)).context("serialize session report")
}

/// Write the session report in pretty JSON format.
pub fn write_session_json(path: &Path, session: &SessionReport) -> Result<()> {
    let content = render_session_json(session)?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render a Markdown summary of a session.
pub fn render_session_md(session: &SessionReport) -> String {
    let mut out = String::new();
    out.push_str("# XCIP Session Report\n\n");
    out.push_str(&format!(
        "- input: `{}`\n- manifests: {}\n- passed: {}\n- failed: {}\n\n",
        session.input.display(),
        session.files.len(),
        session.passed_count(),
        session.failed_count()
    ));

    for file in &session.files {
        out.push_str(&format!("## `{}`\n\n", file.path.display()));
        match &file.status {
            FileStatus::Malformed { .. } => out.push_str("Status: malformed\n\n"),
            FileStatus::Invalid { .. } => out.push_str("Status: invalid\n\n"),
            FileStatus::Unreadable { reason } => {
                out.push_str(&format!("Status: unreadable ({reason})\n\n"))
            }
            FileStatus::PlanFailed { reason, .. } => {
                out.push_str(&format!("Status: plan failed ({reason})\n\n"))
            }
            FileStatus::Executed {
                excluded_connections,
                run,
                ..
            } => {
                out.push_str(&format!(
                    "Status: {}\n\n",
                    if file.passed() { "passed" } else { "failed" }
                ));
                if !excluded_connections.is_empty() {
                    out.push_str(&format!(
                        "Excluded connections: {}\n\n",
                        excluded_connections.join(", ")
                    ));
                }
                render_run(&mut out, run);
            }
        }

        let violations = file.violations();
        if !violations.is_empty() {
            out.push_str("### Violations\n");
            for v in violations {
                out.push_str(&format!("- {v}\n"));
            }
            out.push('\n');
        }
    }
    out
}

fn render_run(out: &mut String, run: &RunReport) {
    let summary = run.summary();
    out.push_str(&format!(
        "Device {}: {}/{} events passed, {} warning(s){}\n\n",
        run.device,
        summary.passed,
        summary.total,
        summary.warnings,
        if run.cancelled { ", cancelled" } else { "" }
    ));
    out.push_str("| # | event | outcome | attempts | warnings |\n");
    out.push_str("|---|-------|---------|----------|----------|\n");
    for event in &run.events {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            event.event_id.0,
            event.label,
            event.outcome.label(),
            event.attempts,
            event.warnings.len()
        ));
    }
    out.push('\n');

    let notes: Vec<String> = run
        .warnings
        .iter()
        .cloned()
        .chain(run.events.iter().flat_map(|e| {
            e.warnings
                .iter()
                .map(move |w| format!("{}: {}", e.label, w))
        }))
        .collect();
    if !notes.is_empty() {
        out.push_str("### Warnings\n");
        for note in notes {
            out.push_str(&format!("- {note}\n"));
        }
        out.push('\n');
    }
}

/// Write the Markdown summary.
pub fn write_session_md(path: &Path, session: &SessionReport) -> Result<()> {
    let md = render_session_md(session);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
