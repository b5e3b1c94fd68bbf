use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::{BoxFuture, FutureExt};
use tempfile::{tempdir, TempDir};

use xenotx_pipelines::cli::Arguments;
use xenotx_pipelines::config::defs::{PipelineError, RunConfig, ToolError};
use xenotx_pipelines::graph::{Stage, ToolOutput, ToolRunner};
use xenotx_pipelines::pipelines::xenograft;
use xenotx_pipelines::utils::command::ToolCommand;

type FailWhen = Box<dyn Fn(&ToolCommand) -> bool + Send + Sync>;

/// Records every command and fabricates plausible outputs instead of running tools.
struct FakeRunner {
    commands: Mutex<Vec<ToolCommand>>,
    fail_when: FailWhen,
    /// In-flight and peak `samtools sort` memory, from `-m` times `-@`.
    sort_memory: Mutex<(u64, u64)>,
}

impl FakeRunner {
    fn new() -> Self {
        Self::failing_when(|_| false)
    }

    fn failing_when(fail_when: impl Fn(&ToolCommand) -> bool + Send + Sync + 'static) -> Self {
        FakeRunner {
            commands: Mutex::new(Vec::new()),
            fail_when: Box::new(fail_when),
            sort_memory: Mutex::new((0, 0)),
        }
    }

    fn commands(&self) -> Vec<ToolCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, tool: &str) -> usize {
        self.commands().iter().filter(|c| c.tool == tool).count()
    }

    fn peak_sort_memory(&self) -> u64 {
        self.sort_memory.lock().unwrap().1
    }
}

/// Memory a `samtools sort` asks for: `-m` per thread times `-@` threads.
fn sort_memory(command: &ToolCommand) -> Option<u64> {
    if command.tool != "samtools" || command.args.first().map(String::as_str) != Some("sort") {
        return None;
    }
    let per_thread: u64 = command.arg_value("-m")?.trim_end_matches('M').parse().ok()?;
    let threads: u64 = command.arg_value("-@")?.parse().ok()?;
    Some(per_thread * 1_048_576 * threads)
}

fn gz(text: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()
}

fn fake_content(path: &Path) -> std::io::Result<Vec<u8>> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if name.ends_with(".fastq.gz") {
        gz("@r1\nACGTACGT\n+\nIIIIIIII\n@r2\nTTGGCCAA\n+\nIIIIIIII\n")
    } else if name.ends_with(".regions.bed.gz") {
        gz("chr1\t0\t100\t40.00\nchrX_donor\t0\t100\t5.00\nchrX_donor\t100\t200\t2.50\n")
    } else if name.ends_with(".assembled.tsv") {
        Ok(b"chrX_donor\t10\t150\t+\t2\tENST0001\tENSG0001\tGENE1\t12.5\nchrX_donor\t40\t190\t-\t1\t.\t.\t.\t3.1\n".to_vec())
    } else if name.ends_with(".reference.tsv") {
        Ok(b"chrX_donor\t5\t160\t+\t3\tGENE1\nchr1\t1\t50\t-\t1\tHOST1\n".to_vec())
    } else if name.ends_with(".hisat2_summary.txt") {
        Ok(b"HISAT2 summary stats:\n\tOverall alignment rate: 95.00%\n".to_vec())
    } else {
        Ok(b"fake\n".to_vec())
    }
}

fn write_outputs(command: &ToolCommand) -> std::io::Result<()> {
    for output in &command.outputs {
        fs::write(output, fake_content(output)?)?;
    }
    if command.tool == "hisat2-build" {
        if let Some(base) = command.args.last() {
            File::create(format!("{}.1.ht2", base))?;
        }
    }
    Ok(())
}

impl ToolRunner for FakeRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ToolError>> {
        async move {
            self.commands.lock().unwrap().push(command.clone());
            if let Some(memory) = sort_memory(command) {
                {
                    let mut usage = self.sort_memory.lock().unwrap();
                    usage.0 += memory;
                    usage.1 = usage.1.max(usage.0);
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                self.sort_memory.lock().unwrap().0 -= memory;
            }
            if (self.fail_when)(command) {
                return Err(ToolError::ExitStatus {
                    tool: command.tool.clone(),
                    code: Some(1),
                    stderr: "simulated failure".to_string(),
                });
            }
            write_outputs(command).map_err(|e| ToolError::Io {
                tool: command.tool.clone(),
                error: e.to_string(),
            })?;
            Ok(ToolOutput::default())
        }
        .boxed()
    }
}

/// Whether any file the command touches belongs to `sample`.
fn touches_sample(command: &ToolCommand, sample: &str) -> bool {
    command.inputs.iter().chain(command.outputs.iter()).any(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().starts_with(&format!("{}.", sample)))
            .unwrap_or(false)
    })
}

fn fixture(samples: &[&str]) -> Result<TempDir> {
    let dir = tempdir()?;
    fs::create_dir(dir.path().join("inputs"))?;
    for sample in samples {
        File::create(dir.path().join("inputs").join(format!("{}.bam", sample)))?;
    }
    fs::write(dir.path().join("genome.fa"), ">chrX_donor\nACGTACGTACGT\n")?;
    fs::write(
        dir.path().join("genes.gtf"),
        "chrX_donor\tsrc\texon\t5\t160\t.\t+\t.\tgene_id \"ENSG0001\"; transcript_id \"ENST0001\";\n",
    )?;
    Ok(dir)
}

fn config(cwd: &Path, extra: &[&str]) -> Result<RunConfig> {
    let mut argv = vec![
        "xenotx-pipelines",
        "--fasta",
        "genome.fa",
        "--gtf",
        "genes.gtf",
        "--xeno",
        "chrX_donor",
        "--outdir",
        "results",
        "--work-dir",
        "work",
        "--name",
        "test_run",
    ];
    argv.extend_from_slice(extra);
    let args = Arguments::try_parse_from(argv)?;
    Ok(RunConfig::from_args(args, cwd)?)
}

fn glob_config(cwd: &Path, extra: &[&str]) -> Result<RunConfig> {
    let mut args = vec!["--input", "inputs/*.bam", "--unstranded"];
    args.extend_from_slice(extra);
    config(cwd, &args)
}

fn list_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(path.strip_prefix(root)?.to_path_buf());
            }
        }
    }
    Ok(files)
}

fn expected_sample_files(sample: &str) -> Vec<String> {
    vec![
        format!("{s}/{s}.bam.bai", s = sample),
        format!("{s}/{s}_R1.fastq.gz", s = sample),
        format!("{s}/{s}_R2.fastq.gz", s = sample),
        format!("HISAT2/{}.hisat2_summary.txt", sample),
        format!("HISAT2/{}.bam", sample),
        format!("HISAT2/aligned_sorted/{}.sorted.bam", sample),
        format!("HISAT2/aligned_sorted/{}.sorted.bam.bai", sample),
        format!("stringtieFPKM/transcripts/{}_transcripts.gtf", sample),
        format!("stringtieFPKM/transcripts/{}_merged.gtf", sample),
        format!("stringtieFPKM/transcripts/{}.gene_abund.txt", sample),
        format!("stringtieFPKM/cov_refs/{}.cov_refs.gtf", sample),
        format!("stringtieFPKM/fasta/{}_transcripts.fa", sample),
        format!("viz/{s}/{s}.regions.bed.gz", s = sample),
        format!("viz/{s}/{s}.assembled.tsv", s = sample),
        format!("viz/{s}/{s}.reference.tsv", s = sample),
        format!("viz/{s}/{s}_xeno_plot.svg", s = sample),
    ]
}

#[tokio::test]
async fn test_two_samples_produce_documented_layout() -> Result<()> {
    let dir = fixture(&["S1", "S2"])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::new());

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert!(summary.is_success());
    assert!(summary.reference_built);
    assert!(summary.failed.is_empty());
    let ids: Vec<&str> = summary.succeeded.iter().map(|s| s.sample.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2"]);
    for report in &summary.succeeded {
        assert_eq!(report.read_count, 2);
        assert_eq!(report.alignment_rate, Some(95.0));
    }

    let results = dir.path().join("results");
    for sample in ["S1", "S2"] {
        for file in expected_sample_files(sample) {
            assert!(results.join(&file).is_file(), "missing {}", file);
        }
    }
    for file in [
        "pipeline_report.txt",
        "pipeline_report.html",
        "execution_summary.json",
        "software_versions.tsv",
    ] {
        assert!(results.join("pipeline_info").join(file).is_file(), "missing {}", file);
    }
    assert!(!results.join("reference_genome").exists());
    assert!(!results.join("HISAT2/unaligned").exists());

    let svg = fs::read_to_string(results.join("viz/S1/S1_xeno_plot.svg"))?;
    assert!(svg.contains("GENE1"));

    // Intermediates are cleaned up by default.
    assert!(!dir.path().join("work/S1/S1.xeno.bam").exists());
    assert!(!dir.path().join("work/S1/S1.sam").exists());
    Ok(())
}

#[tokio::test]
async fn test_reference_is_built_once_per_run() -> Result<()> {
    for n in [1usize, 5] {
        let names: Vec<String> = (1..=n).map(|i| format!("S{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let dir = fixture(&refs)?;
        let config = glob_config(dir.path(), &[])?;
        let runner = Arc::new(FakeRunner::new());

        let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

        assert_eq!(summary.succeeded.len(), n);
        assert_eq!(runner.count("hisat2-build"), 1);
        assert_eq!(runner.count("hisat2_extract_splice_sites.py"), 1);
        assert_eq!(runner.count("hisat2_extract_exons.py"), 1);
        assert_eq!(runner.count("hisat2"), n);
        let reference_tasks = summary
            .tasks
            .iter()
            .filter(|t| t.stage == Stage::ReferencePrep)
            .count();
        assert_eq!(reference_tasks, 3);
    }
    Ok(())
}

#[tokio::test]
async fn test_sample_failure_is_isolated() -> Result<()> {
    let dir = fixture(&["S1", "S2", "S3"])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::failing_when(|c| c.tool == "stringtie" && touches_sample(c, "S3")));

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert!(summary.is_success());
    let ids: Vec<&str> = summary.succeeded.iter().map(|s| s.sample.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].sample, "S3");
    assert_eq!(summary.failed[0].stage, Some(Stage::Quantify));
    assert!(summary.failed[0].error.contains("simulated failure"));

    let results = dir.path().join("results");
    for sample in ["S1", "S2"] {
        for file in expected_sample_files(sample) {
            assert!(results.join(&file).is_file(), "missing {}", file);
        }
    }
    assert!(!results.join("viz/S3/S3_xeno_plot.svg").exists());
    assert!(results.join("pipeline_info/execution_summary.json").is_file());
    Ok(())
}

#[tokio::test]
async fn test_every_sample_failing_is_not_success() -> Result<()> {
    let dir = fixture(&["S1", "S2"])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::failing_when(|c| c.tool == "mosdepth"));

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed.len(), 2);
    assert!(summary.failed.iter().all(|f| f.stage == Some(Stage::Visualize)));
    assert!(!summary.is_success());
    Ok(())
}

#[tokio::test]
async fn test_empty_glob_fails_before_touching_disk() -> Result<()> {
    let dir = fixture(&[])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::new());

    let err = xenograft::run(Arc::new(config), runner.clone(), Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)), "{}", err);
    assert!(!dir.path().join("results").exists());
    assert!(!dir.path().join("work").exists());
    assert!(runner.commands().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_empty_sample_table_is_rejected() -> Result<()> {
    let dir = fixture(&["S1"])?;
    fs::write(dir.path().join("samples.csv"), "sample,path\n")?;
    let config = config(dir.path(), &["--read-paths", "samples.csv", "--unstranded"])?;
    let runner = Arc::new(FakeRunner::new());

    let err = xenograft::run(Arc::new(config), runner.clone(), Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)), "{}", err);
    assert!(!dir.path().join("results").exists());
    Ok(())
}

#[tokio::test]
async fn test_sample_table_input() -> Result<()> {
    let dir = fixture(&["raw_1"])?;
    fs::write(dir.path().join("samples.csv"), "sample,path\nPDX7,inputs/raw_1.bam\n")?;
    let config = config(dir.path(), &["--read-paths", "samples.csv", "--reverse-stranded"])?;
    let runner = Arc::new(FakeRunner::new());

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert_eq!(summary.succeeded.len(), 1);
    assert_eq!(summary.succeeded[0].sample, "PDX7");
    let hisat2 = runner
        .commands()
        .into_iter()
        .find(|c| c.tool == "hisat2")
        .expect("hisat2 ran");
    assert_eq!(hisat2.arg_value("--rna-strandness"), Some("RF"));
    let stringtie = runner
        .commands()
        .into_iter()
        .find(|c| c.tool == "stringtie" && !c.has_arg("--merge"))
        .expect("stringtie ran");
    assert!(stringtie.has_arg("--rf"));
    Ok(())
}

#[test]
fn test_forward_and_reverse_are_rejected() -> Result<()> {
    let dir = fixture(&["S1"])?;
    let err = config(
        dir.path(),
        &["--input", "inputs/*.bam", "--forward-stranded", "--reverse-stranded"],
    )
    .unwrap_err();
    let err = err.downcast::<PipelineError>()?;
    assert!(matches!(err, PipelineError::Configuration(_)));
    Ok(())
}

#[tokio::test]
async fn test_sorted_bam_is_shared_read_only() -> Result<()> {
    let dir = fixture(&["S1"])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::new());

    xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    let sorted = dir.path().join("results/HISAT2/aligned_sorted/S1.sorted.bam");
    let commands = runner.commands();
    let producers: Vec<&ToolCommand> = commands.iter().filter(|c| c.outputs.contains(&sorted)).collect();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].tool, "samtools");
    assert_eq!(producers[0].args[0], "sort");

    let consumers: Vec<&ToolCommand> = commands.iter().filter(|c| c.inputs.contains(&sorted)).collect();
    let tools: BTreeSet<&str> = consumers.iter().map(|c| c.tool.as_str()).collect();
    assert_eq!(tools, BTreeSet::from(["mosdepth", "samtools", "stringtie"]));
    assert_eq!(consumers.len(), 3);
    assert!(consumers
        .iter()
        .filter(|c| c.tool == "samtools")
        .all(|c| c.args[0] == "index"));
    Ok(())
}

#[tokio::test]
async fn test_output_names_are_stable_across_runs() -> Result<()> {
    let mut listings = Vec::new();
    for _ in 0..2 {
        let dir = fixture(&["S1", "S2"])?;
        let config = glob_config(dir.path(), &[])?;
        let runner = Arc::new(FakeRunner::new());
        xenograft::run(Arc::new(config), runner, Vec::new()).await?;
        listings.push(list_files(&dir.path().join("results"))?);
    }
    assert_eq!(listings[0], listings[1]);
    Ok(())
}

#[tokio::test]
async fn test_single_end_and_saved_outputs() -> Result<()> {
    let dir = fixture(&["S1"])?;
    let config = glob_config(dir.path(), &["--single-end", "--save-reference", "--save-unaligned"])?;
    let runner = Arc::new(FakeRunner::new());

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;
    assert!(summary.is_success());

    let results = dir.path().join("results");
    assert!(results.join("S1/S1_R1.fastq.gz").is_file());
    assert!(!results.join("S1/S1_R2.fastq.gz").exists());
    assert!(results.join("reference_genome/genome.1.ht2").is_file());
    assert!(results.join("reference_genome/genes.splice_sites.txt").is_file());
    assert!(results.join("HISAT2/unaligned/S1.unmapped.fastq.gz").is_file());

    let hisat2 = runner
        .commands()
        .into_iter()
        .find(|c| c.tool == "hisat2")
        .expect("hisat2 ran");
    assert!(hisat2.has_arg("-U"));
    assert!(!hisat2.has_arg("-1"));
    assert_eq!(hisat2.arg_value("--rna-strandness"), None);
    Ok(())
}

#[tokio::test]
async fn test_reference_failure_stops_the_run() -> Result<()> {
    let dir = fixture(&["S1", "S2"])?;
    let config = glob_config(dir.path(), &[])?;
    let runner = Arc::new(FakeRunner::failing_when(|c| c.tool == "hisat2-build"));

    let err = xenograft::run(Arc::new(config), runner.clone(), Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ReferenceBuild(_)), "{}", err);
    assert_eq!(runner.count("hisat2"), 0);
    assert_eq!(runner.count("stringtie"), 0);
    let results = dir.path().join("results");
    assert!(!results.join("HISAT2/aligned_sorted/S1.sorted.bam").exists());
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(results.join("pipeline_info/execution_summary.json"))?)?;
    assert_eq!(json["reference_built"], false);
    assert_eq!(json["failed"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_sorts_stay_within_max_memory() -> Result<()> {
    let dir = fixture(&["S1", "S2", "S3", "S4"])?;
    let config = glob_config(
        dir.path(),
        &["--max-memory", "2.GB", "--max-cpus", "16", "--task-cpus", "4"],
    )?;
    let max_memory = config.resources.max_memory;
    let runner = Arc::new(FakeRunner::new());

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert_eq!(summary.succeeded.len(), 4);
    assert!(runner.peak_sort_memory() > 0);
    assert!(
        runner.peak_sort_memory() <= max_memory,
        "peak {} > ceiling {}",
        runner.peak_sort_memory(),
        max_memory
    );
    Ok(())
}

#[tokio::test]
async fn test_coverage_runs_once_per_xeno_contig() -> Result<()> {
    let dir = fixture(&["S1"])?;
    let config = glob_config(dir.path(), &["--xeno", "chrY_donor"])?;
    assert_eq!(config.reference.xeno, vec!["chrX_donor", "chrY_donor"]);
    let runner = Arc::new(FakeRunner::new());

    let summary = xenograft::run(Arc::new(config), runner.clone(), Vec::new()).await?;

    assert!(summary.is_success());
    let mut contigs: Vec<String> = runner
        .commands()
        .iter()
        .filter(|c| c.tool == "mosdepth")
        .map(|c| c.arg_value("-c").map(str::to_string).unwrap_or_default())
        .collect();
    contigs.sort();
    assert_eq!(contigs, vec!["chrX_donor", "chrY_donor"]);

    let viz = dir.path().join("results/viz/S1");
    assert!(viz.join("S1.chrX_donor.regions.bed.gz").is_file());
    assert!(viz.join("S1.chrY_donor.regions.bed.gz").is_file());
    assert!(!viz.join("S1.regions.bed.gz").exists());
    assert!(viz.join("S1_xeno_plot.svg").is_file());
    Ok(())
}

#[tokio::test]
async fn test_sample_id_cannot_escape_the_output_root() -> Result<()> {
    let dir = fixture(&["raw_1"])?;
    fs::write(dir.path().join("samples.csv"), "../escaped,inputs/raw_1.bam\n")?;
    let config = config(dir.path(), &["--read-paths", "samples.csv", "--unstranded"])?;
    let runner = Arc::new(FakeRunner::new());

    let err = xenograft::run(Arc::new(config), runner.clone(), Vec::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)), "{}", err);
    assert!(runner.commands().is_empty());
    assert!(!dir.path().join("escaped").exists());
    assert!(!dir.path().join("results").exists());
    Ok(())
}
