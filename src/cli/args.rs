use std::time::Duration;

use clap::{ArgGroup, Parser, ValueEnum};
use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum Profile {
    #[default]
    Standard,
    Docker,
    Singularity,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "xenotx-pipelines", version, about = "Xenograft transcript extraction, quantification and visualization")]
#[command(group(ArgGroup::new("inputs").required(true).args(["input", "read_paths"])))]
pub struct Arguments {
    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long, help = "Glob matching one alignment file per sample, e.g. 'data/*.bam'")]
    pub input: Option<String>,

    #[arg(long = "read-paths", help = "CSV/TSV table of sample,path rows")]
    pub read_paths: Option<String>,

    #[arg(long)]
    pub fasta: String,

    #[arg(long)]
    pub gtf: String,

    #[arg(long, value_delimiter = ',', required = true, help = "Comma-separated xeno contig names")]
    pub xeno: Vec<String>,

    #[arg(long = "forward-stranded", default_value_t = false)]
    pub forward_stranded: bool,

    #[arg(long = "reverse-stranded", default_value_t = false)]
    pub reverse_stranded: bool,

    #[arg(long = "unstranded", default_value_t = false)]
    pub unstranded: bool,

    #[arg(short = 'o', long = "outdir", default_value = "results")]
    pub out_dir: String,

    #[arg(long = "work-dir", default_value = "work", help = "Scratch space for intermediate files")]
    pub work_dir: String,

    #[arg(long = "single-end", default_value_t = false)]
    pub single_end: bool,

    #[arg(long = "max-memory", default_value = "128.GB", value_parser = parse_memory)]
    pub max_memory: u64,

    #[arg(long = "max-cpus", default_value_t = 16)]
    pub max_cpus: usize,

    #[arg(long = "max-time", default_value = "240.h", value_parser = parse_duration)]
    pub max_time: Duration,

    #[arg(long = "task-cpus", default_value_t = 4)]
    pub task_cpus: usize,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub email: Option<String>,

    #[arg(long = "max-multiqc-email-size", default_value = "25.MB", value_parser = parse_memory)]
    pub max_multiqc_email_size: u64,

    #[arg(long = "multiqc-report", help = "Optional MultiQC report to attach to the run summary")]
    pub multiqc_report: Option<String>,

    #[arg(long = "save-reference", default_value_t = false)]
    pub save_reference: bool,

    #[arg(long = "save-unaligned", default_value_t = false)]
    pub save_unaligned: bool,

    #[arg(long = "keep-intermediates", default_value_t = false)]
    pub keep_intermediates: bool,

    #[arg(long, default_value = "standard", value_enum)]
    pub profile: Profile,

    #[arg(long, help = "Container image for the docker/singularity profiles")]
    pub container: Option<String>,

    #[arg(long = "skip-tool-check", default_value_t = false)]
    pub skip_tool_check: bool,
}

lazy_static! {
    static ref MEMORY_RE: Regex =
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*\.?\s*([KMGT]?)B?\s*$").expect("static memory pattern");
    static ref DURATION_RE: Regex =
        Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*\.?\s*(s|sec|m|min|h|d)\s*$").expect("static duration pattern");
}

/// Parses memory sizes such as `128.GB`, `16 GB`, `512M` or `1024` into bytes.
pub fn parse_memory(s: &str) -> Result<u64, String> {
    let caps = MEMORY_RE
        .captures(s)
        .ok_or_else(|| format!("Invalid memory value '{}', expected e.g. 128.GB", s))?;
    let value: f64 = caps[1].parse().map_err(|e| format!("Invalid memory value '{}': {}", s, e))?;
    let multiplier: u64 = match caps[2].to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        other => return Err(format!("Unknown memory unit '{}'", other)),
    };
    Ok((value * multiplier as f64) as u64)
}

/// Parses durations such as `240.h`, `90m`, `2d` or `30s`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let caps = DURATION_RE
        .captures(s)
        .ok_or_else(|| format!("Invalid time value '{}', expected e.g. 240.h", s))?;
    let value: f64 = caps[1].parse().map_err(|e| format!("Invalid time value '{}': {}", s, e))?;
    let seconds = match caps[2].to_ascii_lowercase().as_str() {
        "s" | "sec" => 1.0,
        "m" | "min" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        other => return Err(format!("Unknown time unit '{}'", other)),
    };
    Duration::try_from_secs_f64(value * seconds).map_err(|e| format!("Invalid time value '{}': {}", s, e))
}
