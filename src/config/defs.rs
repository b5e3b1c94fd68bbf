use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use log::LevelFilter;

use crate::cli::{Arguments, Profile};
use crate::graph::{ChannelError, Stage};
use crate::utils::file::resolve_path;

// External software
pub const SAMTOOLS_TAG: &str = "samtools";
pub const HISAT2_TAG: &str = "hisat2";
pub const HISAT2_BUILD_TAG: &str = "hisat2-build";
pub const HISAT2_SPLICE_SITES_TAG: &str = "hisat2_extract_splice_sites.py";
pub const HISAT2_EXONS_TAG: &str = "hisat2_extract_exons.py";
pub const STRINGTIE_TAG: &str = "stringtie";
pub const GFFREAD_TAG: &str = "gffread";
pub const MOSDEPTH_TAG: &str = "mosdepth";

/// Tools probed before the graph runs.
pub const PREFLIGHT_TOOLS: &[&str] = &[
    SAMTOOLS_TAG,
    HISAT2_TAG,
    STRINGTIE_TAG,
    GFFREAD_TAG,
    MOSDEPTH_TAG,
];

lazy_static! {
    /// Oldest known-good (major, minor) per tool. `samtools view -X` needs 1.10.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(SAMTOOLS_TAG, (1, 10));
        m.insert(HISAT2_TAG, (2, 1));
        m.insert(STRINGTIE_TAG, (2, 1));
        m.insert(GFFREAD_TAG, (0, 12));
        m.insert(MOSDEPTH_TAG, (0, 3));
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Index,
    View,
    Sort,
    Fastq,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Fastq => "fastq",
        }
    }
}

// Output layout
pub const REFERENCE_DIR: &str = "reference_genome";
pub const HISAT2_DIR: &str = "HISAT2";
pub const HISAT2_SORTED_DIR: &str = "aligned_sorted";
pub const HISAT2_UNALIGNED_DIR: &str = "unaligned";
pub const STRINGTIE_DIR: &str = "stringtieFPKM";
pub const STRINGTIE_TRANSCRIPTS_DIR: &str = "transcripts";
pub const STRINGTIE_COV_REFS_DIR: &str = "cov_refs";
pub const STRINGTIE_FASTA_DIR: &str = "fasta";
pub const VIZ_DIR: &str = "viz";
pub const PIPELINE_INFO_DIR: &str = "pipeline_info";

// Static Filenames
pub const PIPELINE_REPORT_TXT: &str = "pipeline_report.txt";
pub const PIPELINE_REPORT_HTML: &str = "pipeline_report.html";
pub const EXECUTION_SUMMARY_JSON: &str = "execution_summary.json";
pub const SOFTWARE_VERSIONS_TSV: &str = "software_versions.tsv";

// Static Parameters

/// unmapped | secondary | supplementary
pub const FASTQ_EXCLUDE_FLAGS: u16 = 0x904;
/// unmapped, mate unmapped, secondary
pub const HISAT2_EXCLUDE_FLAGS: &[u16] = &[4, 8, 256];
pub const COVERAGE_WINDOW: u32 = 1;
pub const SORT_MEMORY_CAP: u64 = 768 * 1_048_576;
pub const STDERR_TAIL_LINES: usize = 20;

pub const ASSEMBLED_TABLE_FIELDS: &[&str] = &[
    "@chr",
    "@start",
    "@end",
    "@strand",
    "@numexons",
    "reference_id",
    "ref_gene_id",
    "ref_gene_name",
    "FPKM",
];
pub const REFERENCE_TABLE_FIELDS: &[&str] = &["@chr", "@start", "@end", "@strand", "@numexons", "gene_name"];

pub const BAM_EXT: &str = "bam";
pub const BAI_EXT: &str = "bai";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strandedness {
    Forward,
    Reverse,
    Unstranded,
}

impl Strandedness {
    /// Resolves the three mutually exclusive strand switches.
    /// No switch set means unstranded; more than one is a configuration error.
    pub fn resolve(forward: bool, reverse: bool, unstranded: bool) -> Result<Self, PipelineError> {
        let set = [forward, reverse, unstranded].iter().filter(|&&s| s).count();
        if set > 1 {
            return Err(PipelineError::Configuration(
                "--forward-stranded, --reverse-stranded and --unstranded are mutually exclusive".to_string(),
            ));
        }
        Ok(match (forward, reverse) {
            (true, _) => Strandedness::Forward,
            (_, true) => Strandedness::Reverse,
            _ => Strandedness::Unstranded,
        })
    }

    pub fn hisat2_strandness(&self, single_end: bool) -> Option<&'static str> {
        match (self, single_end) {
            (Strandedness::Forward, true) => Some("F"),
            (Strandedness::Forward, false) => Some("FR"),
            (Strandedness::Reverse, true) => Some("R"),
            (Strandedness::Reverse, false) => Some("RF"),
            (Strandedness::Unstranded, _) => None,
        }
    }

    pub fn stringtie_flag(&self) -> Option<&'static str> {
        match self {
            Strandedness::Forward => Some("--fr"),
            Strandedness::Reverse => Some("--rf"),
            Strandedness::Unstranded => None,
        }
    }
}

impl std::fmt::Display for Strandedness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strandedness::Forward => "forward",
            Strandedness::Reverse => "reverse",
            Strandedness::Unstranded => "unstranded",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    /// Explicit `sample,path` table.
    Table(PathBuf),
    Glob(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionProfile {
    Standard,
    Docker { image: String },
    Singularity { image: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceBundle {
    pub fasta: PathBuf,
    pub gtf: PathBuf,
    pub xeno: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cpus: usize,
    pub max_memory: u64,
    pub max_time: Duration,
}

impl ResourceLimits {
    /// Clamps the requested ceilings to what the host actually has.
    pub fn clamp_to_host(&self, host_cores: usize, host_ram: u64) -> ResourceLimits {
        ResourceLimits {
            max_cpus: self.max_cpus.min(host_cores.max(1)),
            max_memory: if host_ram == 0 { self.max_memory } else { self.max_memory.min(host_ram) },
            max_time: self.max_time,
        }
    }
}

/// Immutable run-wide settings. Built once in `main` and handed to every stage as `Arc<RunConfig>`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub input: InputSpec,
    pub reference: ReferenceBundle,
    pub strandedness: Strandedness,
    pub single_end: bool,
    pub resources: ResourceLimits,
    pub task_cpus: usize,
    pub run_name: String,
    pub email: Option<String>,
    pub max_multiqc_email_size: u64,
    pub multiqc_report: Option<PathBuf>,
    pub save_reference: bool,
    pub save_unaligned: bool,
    pub keep_intermediates: bool,
    pub profile: ExecutionProfile,
    pub log_level: LevelFilter,
}

impl RunConfig {
    /// Validates parsed arguments into the run configuration.
    /// Relative paths are resolved against `cwd`.
    pub fn from_args(args: Arguments, cwd: &Path) -> Result<RunConfig, PipelineError> {
        let strandedness = Strandedness::resolve(args.forward_stranded, args.reverse_stranded, args.unstranded)?;

        let input = match (args.input, args.read_paths) {
            (Some(pattern), None) => InputSpec::Glob(pattern),
            (None, Some(table)) => InputSpec::Table(resolve_path(Path::new(&table), cwd)),
            _ => {
                return Err(PipelineError::Configuration(
                    "Exactly one of --input or --read-paths is required".to_string(),
                ));
            }
        };

        let xeno: Vec<String> = args
            .xeno
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if xeno.is_empty() {
            return Err(PipelineError::Configuration("--xeno needs at least one contig name".to_string()));
        }

        if args.max_cpus == 0 || args.task_cpus == 0 {
            return Err(PipelineError::Configuration("CPU counts must be at least 1".to_string()));
        }

        let profile = match (args.profile, args.container) {
            (Profile::Standard, _) => ExecutionProfile::Standard,
            (Profile::Docker, Some(image)) => ExecutionProfile::Docker { image },
            (Profile::Singularity, Some(image)) => ExecutionProfile::Singularity { image },
            (other, None) => {
                return Err(PipelineError::Configuration(format!(
                    "Profile {:?} needs --container <image>",
                    other
                )));
            }
        };

        let run_name = args
            .name
            .unwrap_or_else(|| format!("xenotx_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));

        Ok(RunConfig {
            cwd: cwd.to_path_buf(),
            out_dir: resolve_path(Path::new(&args.out_dir), cwd),
            work_dir: resolve_path(Path::new(&args.work_dir), cwd),
            input,
            reference: ReferenceBundle {
                fasta: resolve_path(Path::new(&args.fasta), cwd),
                gtf: resolve_path(Path::new(&args.gtf), cwd),
                xeno,
            },
            strandedness,
            single_end: args.single_end,
            resources: ResourceLimits {
                max_cpus: args.max_cpus,
                max_memory: args.max_memory,
                max_time: args.max_time,
            },
            task_cpus: args.task_cpus,
            run_name,
            email: args.email,
            max_multiqc_email_size: args.max_multiqc_email_size,
            multiqc_report: args.multiqc_report.map(|p| resolve_path(Path::new(&p), cwd)),
            save_reference: args.save_reference,
            save_unaligned: args.save_unaligned,
            keep_intermediates: args.keep_intermediates,
            profile,
            log_level: if args.verbose { LevelFilter::Debug } else { LevelFilter::Info },
        })
    }

    /// CPUs handed to a single tool invocation, never above the global ceiling.
    pub fn task_cpus(&self) -> usize {
        self.task_cpus.min(self.resources.max_cpus).max(1)
    }

    /// Per-thread memory for `samtools sort -m`.
    pub fn sort_memory_per_thread(&self) -> u64 {
        let per_thread = self.resources.max_memory / self.task_cpus() as u64;
        per_thread.min(SORT_MEMORY_CAP).max(1_048_576)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to spawn {tool}: {error}. Is {tool} installed?")]
    Spawn { tool: String, error: String },
    #[error("{tool} exited with status {code:?}: {stderr}")]
    ExitStatus { tool: String, code: Option<i32>, stderr: String },
    #[error("{tool} input missing: {}", .path.display())]
    MissingInput { tool: String, path: PathBuf },
    #[error("{tool} did not produce declared output: {}", .path.display())]
    MissingOutput { tool: String, path: PathBuf },
    #[error("{tool} exceeded time limit of {limit:?}")]
    TimedOut { tool: String, limit: Duration },
    #[error("{tool} I/O error: {error}")]
    Io { tool: String, error: String },
    #[error("Upstream input unavailable: {0}")]
    Upstream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Missing reference file: {}", .0.display())]
    MissingReference(PathBuf),
    #[error("Reference build failed: {0}")]
    ReferenceBuild(#[source] ToolError),
    #[error("{stage} failed for sample {sample}: {source}")]
    StageTool {
        stage: Stage,
        sample: String,
        #[source]
        source: ToolError,
    },
    #[error("Reporting failed: {0}")]
    Reporting(String),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("IO error: {0}")]
    IOError(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Fatal errors abort the whole run; everything else is scoped to one sample or to reporting.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::StageTool { .. } | PipelineError::Reporting(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}
