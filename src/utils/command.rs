//! Typed builders for every external tool invocation, plus version probing.
//!
//! Each builder returns a `ToolCommand`: the argv plus the files it reads and writes,
//! so the scheduler can check inputs, verify outputs and mount directories in containers.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::process::Command;

use crate::config::defs::{ExecutionProfile, PipelineError, TOOL_VERSIONS};
use crate::graph::runner::container_argv;
use crate::utils::streams::{read_child_output_to_vec, ChildStream};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub tool: String,
    pub args: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Extra directories a container must see (index prefixes, output prefixes).
    pub mounts: Vec<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub cpus: usize,
    /// Peak memory in bytes the tool is expected to hold; 0 when negligible.
    pub memory: u64,
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl ToolCommand {
    pub fn new(tool: &str) -> Self {
        ToolCommand {
            tool: tool.to_string(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            mounts: Vec::new(),
            stdout: None,
            cpus: 1,
            memory: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Positional input file.
    pub fn input(mut self, path: &Path) -> Self {
        self.args.push(path_arg(path));
        self.inputs.push(path.to_path_buf());
        self
    }

    /// Positional output file.
    pub fn output(mut self, path: &Path) -> Self {
        self.args.push(path_arg(path));
        self.outputs.push(path.to_path_buf());
        self
    }

    pub fn input_flag(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).input(path)
    }

    pub fn output_flag(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).output(path)
    }

    /// Output the tool derives on its own, not named on the command line.
    pub fn declare_output(mut self, path: &Path) -> Self {
        self.outputs.push(path.to_path_buf());
        self
    }

    /// Input the tool finds on its own (e.g. a BAM index next to the BAM).
    pub fn require(mut self, path: &Path) -> Self {
        self.inputs.push(path.to_path_buf());
        self
    }

    /// Makes the directory holding a prefix-named artifact visible to containers.
    pub fn mount_prefix(mut self, prefix: &Path) -> Self {
        if let Some(parent) = prefix.parent() {
            self.mounts.push(parent.to_path_buf());
        }
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self.outputs.push(path.to_path_buf());
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.tool.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Whether `flag` appears as an argument.
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Value following `flag`, if any.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn display(&self) -> String {
        let mut line = self.argv().join(" ");
        if let Some(stdout) = &self.stdout {
            line.push_str(&format!(" > {}", stdout.display()));
        }
        line
    }
}

pub mod samtools {
    use std::path::Path;

    use crate::config::defs::{
        SamtoolsSubcommand, FASTQ_EXCLUDE_FLAGS, HISAT2_EXCLUDE_FLAGS, SAMTOOLS_TAG,
    };
    use super::ToolCommand;

    fn base(sub: SamtoolsSubcommand, cpus: usize) -> ToolCommand {
        ToolCommand::new(SAMTOOLS_TAG)
            .arg(sub.as_str())
            .arg("-@")
            .arg(cpus.to_string())
            .cpus(cpus)
    }

    pub fn index(bam: &Path, bai: &Path, cpus: usize) -> ToolCommand {
        base(SamtoolsSubcommand::Index, cpus).input(bam).output(bai)
    }

    /// Subsets `bam` to `regions` using an explicit index file (`-X`).
    pub fn view_regions(bam: &Path, bai: &Path, regions: &[String], out: &Path, cpus: usize) -> ToolCommand {
        base(SamtoolsSubcommand::View, cpus)
            .arg("-b")
            .output_flag("-o", out)
            .arg("-X")
            .input(bam)
            .input(bai)
            .args(regions.iter().cloned())
    }

    /// SAM to BAM, dropping unmapped, mate-unmapped and secondary records.
    pub fn view_filter(sam: &Path, out: &Path, cpus: usize) -> ToolCommand {
        let mask = HISAT2_EXCLUDE_FLAGS.iter().fold(0u16, |acc, f| acc | f);
        base(SamtoolsSubcommand::View, cpus)
            .arg("-b")
            .arg("-F")
            .arg(mask.to_string())
            .output_flag("-o", out)
            .input(sam)
    }

    /// `memory_per_thread` is in bytes and passed to `-m` as mebibytes.
    /// The declared memory is `-m` times `-@`.
    pub fn sort(input: &Path, out: &Path, cpus: usize, memory_per_thread: u64, by_name: bool) -> ToolCommand {
        let mib = (memory_per_thread / 1_048_576).max(1);
        let mut cmd = base(SamtoolsSubcommand::Sort, cpus)
            .arg("-m")
            .arg(format!("{}M", mib))
            .memory(mib * 1_048_576 * cpus.max(1) as u64);
        if by_name {
            cmd = cmd.arg("-n");
        }
        cmd.output_flag("-o", out).input(input)
    }

    /// Name-sorted BAM to FASTQ. Paired mode writes both mates and discards singletons.
    pub fn fastq(input: &Path, mate1: &Path, mate2: Option<&Path>, cpus: usize) -> ToolCommand {
        let cmd = base(SamtoolsSubcommand::Fastq, cpus)
            .arg("-F")
            .arg(FASTQ_EXCLUDE_FLAGS.to_string());
        let cmd = match mate2 {
            Some(mate2) => cmd
                .output_flag("-1", mate1)
                .output_flag("-2", mate2)
                .args(["-0", "/dev/null", "-s", "/dev/null", "-n"]),
            None => cmd.output_flag("-0", mate1),
        };
        cmd.input(input)
    }
}

pub mod hisat2 {
    use std::path::{Path, PathBuf};

    use crate::config::defs::{HISAT2_BUILD_TAG, HISAT2_EXONS_TAG, HISAT2_SPLICE_SITES_TAG, HISAT2_TAG};
    use crate::utils::file::with_suffix;
    use super::ToolCommand;

    pub fn extract_splice_sites(gtf: &Path, out: &Path) -> ToolCommand {
        ToolCommand::new(HISAT2_SPLICE_SITES_TAG).input(gtf).stdout_to(out)
    }

    pub fn extract_exons(gtf: &Path, out: &Path) -> ToolCommand {
        ToolCommand::new(HISAT2_EXONS_TAG).input(gtf).stdout_to(out)
    }

    pub fn build(fasta: &Path, splice_sites: &Path, exons: &Path, index_base: &Path, cpus: usize) -> ToolCommand {
        ToolCommand::new(HISAT2_BUILD_TAG)
            .arg("-p")
            .arg(cpus.to_string())
            .input_flag("--ss", splice_sites)
            .input_flag("--exon", exons)
            .input(fasta)
            .arg(index_base.to_string_lossy())
            .mount_prefix(index_base)
            .cpus(cpus)
    }

    /// Small indexes end in `.ht2`, large ones in `.ht2l`.
    pub fn index_files_exist(index_base: &Path) -> bool {
        with_suffix(index_base, ".1.ht2").exists() || with_suffix(index_base, ".1.ht2l").exists()
    }

    #[derive(Debug, Clone)]
    pub struct AlignRequest<'a> {
        pub index_base: &'a Path,
        pub splice_sites: &'a Path,
        pub mate1: &'a Path,
        pub mate2: Option<&'a Path>,
        pub sam: &'a Path,
        pub summary: &'a Path,
        /// `--rna-strandness` value; `None` for unstranded libraries.
        pub strandness: Option<&'static str>,
        /// Prefix for unaligned reads, e.g. `HISAT2/unaligned/S1`.
        pub unaligned_prefix: Option<PathBuf>,
        pub cpus: usize,
    }

    pub fn align(req: &AlignRequest<'_>) -> ToolCommand {
        let mut cmd = ToolCommand::new(HISAT2_TAG)
            .arg("-x")
            .arg(req.index_base.to_string_lossy())
            .mount_prefix(req.index_base);
        cmd = match req.mate2 {
            Some(mate2) => cmd
                .input_flag("-1", req.mate1)
                .input_flag("-2", mate2)
                .args(["--no-mixed", "--no-discordant"]),
            None => cmd.input_flag("-U", req.mate1),
        };
        if let Some(strandness) = req.strandness {
            cmd = cmd.arg("--rna-strandness").arg(strandness);
        }
        cmd = cmd
            .input_flag("--known-splicesite-infile", req.splice_sites)
            .arg("--no-unal")
            .arg("-p")
            .arg(req.cpus.to_string())
            .args(["--met-stderr", "--new-summary"])
            .output_flag("--summary-file", req.summary)
            .output_flag("-S", req.sam)
            .cpus(req.cpus);
        if let Some(prefix) = &req.unaligned_prefix {
            cmd = match req.mate2 {
                Some(_) => cmd
                    .arg("--un-conc-gz")
                    .arg(with_suffix(prefix, ".unmapped_%.fastq.gz").to_string_lossy())
                    .declare_output(&with_suffix(prefix, ".unmapped_1.fastq.gz"))
                    .declare_output(&with_suffix(prefix, ".unmapped_2.fastq.gz")),
                None => cmd.output_flag("--un-gz", &with_suffix(prefix, ".unmapped.fastq.gz")),
            };
        }
        cmd
    }
}

pub mod stringtie {
    use std::path::Path;

    use crate::config::defs::STRINGTIE_TAG;
    use super::ToolCommand;

    #[derive(Debug, Clone)]
    pub struct AssembleRequest<'a> {
        pub bam: &'a Path,
        pub gtf: &'a Path,
        pub strand_flag: Option<&'static str>,
        pub transcripts: &'a Path,
        pub gene_abundance: &'a Path,
        pub coverage_refs: &'a Path,
        pub cpus: usize,
    }

    pub fn assemble(req: &AssembleRequest<'_>) -> ToolCommand {
        let mut cmd = ToolCommand::new(STRINGTIE_TAG).input(req.bam);
        if let Some(flag) = req.strand_flag {
            cmd = cmd.arg(flag);
        }
        cmd.arg("-p")
            .arg(req.cpus.to_string())
            .input_flag("-G", req.gtf)
            .output_flag("-o", req.transcripts)
            .output_flag("-A", req.gene_abundance)
            .output_flag("-C", req.coverage_refs)
            .cpus(req.cpus)
    }

    pub fn merge(gtf: &Path, transcripts: &Path, merged: &Path, cpus: usize) -> ToolCommand {
        ToolCommand::new(STRINGTIE_TAG)
            .arg("--merge")
            .arg("-p")
            .arg(cpus.to_string())
            .input_flag("-G", gtf)
            .output_flag("-o", merged)
            .input(transcripts)
            .cpus(cpus)
    }
}

pub mod gffread {
    use std::path::Path;

    use crate::config::defs::GFFREAD_TAG;
    use super::ToolCommand;

    pub fn transcript_fasta(gtf: &Path, genome: &Path, out: &Path) -> ToolCommand {
        ToolCommand::new(GFFREAD_TAG)
            .output_flag("-w", out)
            .input_flag("-g", genome)
            .input(gtf)
    }

    pub fn table(gtf: &Path, fields: &[&str], out: &Path) -> ToolCommand {
        ToolCommand::new(GFFREAD_TAG)
            .input(gtf)
            .arg("--table")
            .arg(fields.join(","))
            .output_flag("-o", out)
    }
}

pub mod mosdepth {
    use std::path::{Path, PathBuf};

    use crate::config::defs::{COVERAGE_WINDOW, MOSDEPTH_TAG};
    use crate::utils::file::with_suffix;
    use super::ToolCommand;

    pub fn regions_bed(prefix: &Path) -> PathBuf {
        with_suffix(prefix, ".regions.bed.gz")
    }

    pub fn summary(prefix: &Path) -> PathBuf {
        with_suffix(prefix, ".mosdepth.summary.txt")
    }

    /// Windowed depth over one contig of `bam` (`-c`), so nothing outside it is written.
    pub fn depth(bam: &Path, bai: &Path, prefix: &Path, contig: &str, cpus: usize) -> ToolCommand {
        ToolCommand::new(MOSDEPTH_TAG)
            .arg("-t")
            .arg(cpus.to_string())
            .arg("-b")
            .arg(COVERAGE_WINDOW.to_string())
            .arg("-n")
            .arg("-c")
            .arg(contig)
            .arg(prefix.to_string_lossy())
            .mount_prefix(prefix)
            .input(bam)
            .require(bai)
            .declare_output(&regions_bed(prefix))
            .declare_output(&summary(prefix))
            .cpus(cpus)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolVersion {
    pub tool: String,
    pub version: String,
}

/// `(major, minor)` from strings like `1.17`, `v0.3.3` or `2.2.1-beta`.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split(|c: char| c == '.' || c == '-');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|m| m.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|m| m.parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// One `--version` invocation with only `stream` piped.
async fn version_lines(tool: &str, argv: &[String], stream: ChildStream) -> Result<Vec<String>, PipelineError> {
    let (stdout, stderr) = match stream {
        ChildStream::Stdout => (std::process::Stdio::piped(), std::process::Stdio::null()),
        ChildStream::Stderr => (std::process::Stdio::null(), std::process::Stdio::piped()),
    };
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|e| PipelineError::Configuration(format!("Failed to spawn {}: {}. Is {} installed?", tool, e, tool)))?;
    read_child_output_to_vec(&mut child, stream)
        .await
        .map_err(|e| PipelineError::Configuration(format!("Could not read {} --version: {}", tool, e)))
}

/// Runs `<tool> --version` and reports the last token of the first line.
/// Tools that print nothing on stdout are asked again with stderr captured.
/// A missing tool is a configuration error; an old version only warns.
pub async fn check_version(tool: &str, profile: &ExecutionProfile, cwd: &Path) -> Result<ToolVersion, PipelineError> {
    let probe = ToolCommand::new(tool).arg("--version");
    let argv = container_argv(profile, &probe, cwd);
    debug!("Querying {}", argv.join(" "));

    let mut lines = version_lines(tool, &argv, ChildStream::Stdout).await?;
    if lines.iter().all(|l| l.trim().is_empty()) {
        debug!("{} --version wrote nothing to stdout, reading stderr", tool);
        lines = version_lines(tool, &argv, ChildStream::Stderr).await?;
    }
    let first_line = lines
        .iter()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PipelineError::Configuration(format!("No output from {} --version", tool)))?;
    let version = first_line
        .split_whitespace()
        .last()
        .ok_or_else(|| PipelineError::Configuration(format!("Invalid {} --version output: {}", tool, first_line)))?
        .to_string();

    if let (Some(found), Some(&minimum)) = (parse_version(&version), TOOL_VERSIONS.get(tool)) {
        if found < minimum {
            warn!(
                "{} {} is older than the tested minimum {}.{}",
                tool, version, minimum.0, minimum.1
            );
        }
    }
    info!("{} version {}", tool, version);
    Ok(ToolVersion {
        tool: tool.to_string(),
        version,
    })
}

pub async fn check_versions(tools: &[&str], profile: &ExecutionProfile, cwd: &Path) -> Result<Vec<ToolVersion>, PipelineError> {
    let results = join_all(tools.iter().map(|tool| check_version(tool, profile, cwd))).await;
    results.into_iter().collect()
}
