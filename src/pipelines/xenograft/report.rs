//! End-of-run reporting.
//!
//! `RunReporter::finalize` consumes the reporter, so the summary files are written exactly once.
//! A failure here is a `PipelineError::Reporting` and never changes the run verdict.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use serde::Serialize;

use crate::config::defs::{
    PipelineError, RunConfig, EXECUTION_SUMMARY_JSON, PIPELINE_REPORT_HTML, PIPELINE_REPORT_TXT,
    SOFTWARE_VERSIONS_TSV,
};
use crate::config::layout::OutputLayout;
use crate::config::naming::SAMPLE_SUFFIX_TABLE_VERSION;
use crate::graph::{Stage, TaskRecord};
use crate::utils::command::ToolVersion;

lazy_static! {
    static ref ALIGNMENT_RATE_RE: Regex =
        Regex::new(r"(?i)overall alignment rate:\s*([0-9]+(?:\.[0-9]+)?)%").expect("static alignment rate pattern");
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub sample: String,
    pub read_count: u64,
    pub alignment_rate: Option<f64>,
    pub hisat2_summary: PathBuf,
    pub sorted_bam: PathBuf,
    pub transcripts_gtf: PathBuf,
    pub plot: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSample {
    pub sample: String,
    pub stage: Option<Stage>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachmentStatus {
    NotAvailable,
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    Attached { path: PathBuf, size: u64 },
}

impl AttachmentStatus {
    pub fn describe(&self) -> String {
        match self {
            AttachmentStatus::NotAvailable => "MultiQC report not available".to_string(),
            AttachmentStatus::TooLarge { path, size, limit } => format!(
                "MultiQC report {} too large to attach ({} > {} bytes)",
                path.display(),
                size,
                limit
            ),
            AttachmentStatus::Attached { path, .. } => format!("MultiQC report {} attached", path.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_name: String,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub reference_built: bool,
    pub succeeded: Vec<SampleReport>,
    pub failed: Vec<FailedSample>,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks: Vec<TaskRecord>,
}

impl RunSummary {
    /// Successful when the reference built and at least one sample finished, or nothing failed.
    pub fn is_success(&self) -> bool {
        self.reference_built && (!self.succeeded.is_empty() || self.failed.is_empty())
    }
}

/// Reads `Overall alignment rate: X%` from a HISAT2 `--new-summary` file.
pub fn parse_alignment_rate(summary: &Path) -> Option<f64> {
    let text = fs::read_to_string(summary).ok()?;
    ALIGNMENT_RATE_RE
        .captures(&text)
        .and_then(|caps| caps[1].parse().ok())
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn fmt_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.2}%", r)).unwrap_or_else(|| "n/a".to_string())
}

#[derive(Serialize)]
struct ExecutionSummary<'a> {
    #[serde(flatten)]
    summary: &'a RunSummary,
    success: bool,
    sample_suffix_table_version: u32,
    multiqc: &'a AttachmentStatus,
    email: Option<&'a str>,
    versions: &'a [ToolVersion],
}

pub struct RunReporter {
    config: std::sync::Arc<RunConfig>,
    info_dir: PathBuf,
    versions: Vec<ToolVersion>,
}

impl RunReporter {
    pub fn new(config: std::sync::Arc<RunConfig>, layout: &OutputLayout, versions: Vec<ToolVersion>) -> Self {
        RunReporter {
            config,
            info_dir: layout.pipeline_info_dir(),
            versions,
        }
    }

    pub fn attachment_status(&self) -> AttachmentStatus {
        let Some(path) = &self.config.multiqc_report else {
            return AttachmentStatus::NotAvailable;
        };
        match fs::metadata(path) {
            Err(_) => AttachmentStatus::NotAvailable,
            Ok(meta) if meta.len() > self.config.max_multiqc_email_size => AttachmentStatus::TooLarge {
                path: path.clone(),
                size: meta.len(),
                limit: self.config.max_multiqc_email_size,
            },
            Ok(meta) => AttachmentStatus::Attached {
                path: path.clone(),
                size: meta.len(),
            },
        }
    }

    /// Writes the text, HTML, JSON and software-version reports.
    pub fn finalize(self, summary: &RunSummary) -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(&self.info_dir).map_err(|e| self.error(&self.info_dir, e))?;
        let attachment = self.attachment_status();

        let written = vec![
            self.write_file(PIPELINE_REPORT_TXT, |w| self.write_text(w, summary, &attachment))?,
            self.write_file(PIPELINE_REPORT_HTML, |w| self.write_html(w, summary, &attachment))?,
            self.write_file(EXECUTION_SUMMARY_JSON, |w| {
                let doc = ExecutionSummary {
                    summary,
                    success: summary.is_success(),
                    sample_suffix_table_version: SAMPLE_SUFFIX_TABLE_VERSION,
                    multiqc: &attachment,
                    email: self.config.email.as_deref(),
                    versions: &self.versions,
                };
                serde_json::to_writer_pretty(&mut *w, &doc).map_err(std::io::Error::other)?;
                writeln!(w)
            })?,
            self.write_file(SOFTWARE_VERSIONS_TSV, |w| {
                writeln!(w, "tool\tversion")?;
                writeln!(w, "{}\t{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
                for v in &self.versions {
                    writeln!(w, "{}\t{}", v.tool, v.version)?;
                }
                Ok(())
            })?,
        ];
        info!("{}", attachment.describe());
        if let Some(email) = &self.config.email {
            info!("Summary e-mail delivery to {} is not configured; see {}", email, self.info_dir.display());
        }
        info!("Run report written to {}", self.info_dir.display());
        Ok(written)
    }

    fn error(&self, path: &Path, e: std::io::Error) -> PipelineError {
        PipelineError::Reporting(format!("{}: {}", path.display(), e))
    }

    fn write_file<F>(&self, name: &str, body: F) -> Result<PathBuf, PipelineError>
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        let path = self.info_dir.join(name);
        let file = File::create(&path).map_err(|e| self.error(&path, e))?;
        let mut writer = BufWriter::new(file);
        body(&mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| self.error(&path, e))?;
        Ok(path)
    }

    fn write_text<W: Write>(&self, w: &mut W, summary: &RunSummary, attachment: &AttachmentStatus) -> std::io::Result<()> {
        let verdict = if summary.is_success() { "completed successfully" } else { "FAILED" };
        writeln!(w, "Run {} {}", summary.run_name, verdict)?;
        writeln!(w, "Started:  {}", summary.started.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(w, "Finished: {}", summary.finished.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(w, "Duration: {}s", (summary.finished - summary.started).num_seconds())?;
        writeln!(w, "Output:   {}", self.config.out_dir.display())?;
        writeln!(w, "Strandedness: {}", self.config.strandedness)?;
        writeln!(w, "Xeno contigs: {}", self.config.reference.xeno.join(","))?;
        writeln!(w, "Reference built: {}", if summary.reference_built { "yes" } else { "no" })?;
        writeln!(w, "Tasks succeeded: {}", summary.tasks_succeeded)?;
        writeln!(w, "Tasks failed:    {}", summary.tasks_failed)?;
        writeln!(w)?;
        writeln!(w, "Succeeded samples ({}):", summary.succeeded.len())?;
        for s in &summary.succeeded {
            writeln!(
                w,
                "  {}\treads={}\talignment_rate={}",
                s.sample,
                s.read_count,
                fmt_rate(s.alignment_rate)
            )?;
        }
        writeln!(w, "Failed samples ({}):", summary.failed.len())?;
        for f in &summary.failed {
            let stage = f.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
            writeln!(w, "  {}\t[{}]\t{}", f.sample, stage, f.error)?;
        }
        writeln!(w)?;
        writeln!(w, "{}", attachment.describe())?;
        Ok(())
    }

    fn write_html<W: Write>(&self, w: &mut W, summary: &RunSummary, attachment: &AttachmentStatus) -> std::io::Result<()> {
        let verdict = if summary.is_success() { "completed successfully" } else { "failed" };
        writeln!(w, "<!DOCTYPE html>")?;
        writeln!(w, "<html><head><meta charset=\"utf-8\"><title>{}</title></head><body>", html_escape(&summary.run_name))?;
        writeln!(w, "<h1>Run {} {}</h1>", html_escape(&summary.run_name), verdict)?;
        writeln!(
            w,
            "<p>Started {} &middot; finished {} &middot; {} tasks succeeded, {} failed</p>",
            summary.started.format("%Y-%m-%d %H:%M:%S"),
            summary.finished.format("%Y-%m-%d %H:%M:%S"),
            summary.tasks_succeeded,
            summary.tasks_failed
        )?;
        writeln!(w, "<table><tr><th>Sample</th><th>Reads</th><th>Alignment rate</th><th>Plot</th></tr>")?;
        for s in &summary.succeeded {
            writeln!(
                w,
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                html_escape(&s.sample),
                s.read_count,
                fmt_rate(s.alignment_rate),
                html_escape(&s.plot.display().to_string())
            )?;
        }
        writeln!(w, "</table>")?;
        if !summary.failed.is_empty() {
            writeln!(w, "<h2>Failed samples</h2><ul>")?;
            for f in &summary.failed {
                writeln!(w, "<li><b>{}</b>: {}</li>", html_escape(&f.sample), html_escape(&f.error))?;
            }
            writeln!(w, "</ul>")?;
        }
        writeln!(w, "<p>{}</p>", html_escape(&attachment.describe()))?;
        writeln!(w, "</body></html>")?;
        Ok(())
    }
}
