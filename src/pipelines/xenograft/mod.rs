//! Xenograft transcript pipeline.
//!
//! Graph shape: one reference build, broadcast to every sample branch; per sample
//! extract -> align -> sort/index -> {quantify, coverage} -> plot. Branch outcomes
//! meet in a barrier that fires once every branch has finished.

pub mod align;
pub mod extract;
pub mod input;
pub mod quantify;
pub mod reference;
pub mod report;
pub mod sort;
pub mod visualize;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Local;
use log::{error, info, warn};

use crate::config::defs::{PipelineError, RunConfig, ToolError};
use crate::config::layout::OutputLayout;
use crate::graph::{barrier, broadcast, Broadcast, Scheduler, Stage, ToolRunner};
use crate::utils::command::ToolVersion;
use crate::utils::file::ensure_dir;
use input::Sample;
use reference::ReferenceIndex;
use report::{parse_alignment_rate, FailedSample, RunReporter, RunSummary, SampleReport};

/// Shared, read-only state handed to every stage.
pub struct StageContext {
    pub config: Arc<RunConfig>,
    pub layout: OutputLayout,
    pub scheduler: Scheduler,
}

type SampleOutcome = Result<SampleReport, FailedSample>;

/// Maps a tool failure to the error of one sample's stage.
pub(crate) fn stage_error(stage: Stage, sample: &str) -> impl Fn(ToolError) -> PipelineError {
    let sample = sample.to_string();
    move |source| PipelineError::StageTool {
        stage,
        sample: sample.clone(),
        source,
    }
}

fn failure(sample: &str, error: &PipelineError) -> FailedSample {
    let stage = match error {
        PipelineError::StageTool { stage, .. } => Some(*stage),
        _ => None,
    };
    FailedSample {
        sample: sample.to_string(),
        stage,
        error: error.to_string(),
    }
}

async fn run_sample(
    ctx: Arc<StageContext>,
    sample: Sample,
    index: Broadcast<ReferenceIndex>,
) -> Result<SampleReport, PipelineError> {
    let reads = extract::extract_region(&ctx, &sample).await?;

    let index = index.get().await.map_err(|e| PipelineError::StageTool {
        stage: Stage::Align,
        sample: sample.id.clone(),
        source: ToolError::Upstream(e.to_string()),
    })?;
    let aligned = align::align_sample(&ctx, &reads, &index).await?;
    let sorted = sort::sort_and_index(&ctx, &aligned).await?;

    let (quant, coverage) = tokio::try_join!(
        quantify::quantify(&ctx, &sorted),
        visualize::compute_coverage(&ctx, &sorted),
    )?;
    let viz = visualize::render_comparison(&ctx, &coverage, &quant).await?;

    Ok(SampleReport {
        sample: sample.id.clone(),
        read_count: reads.read_count,
        alignment_rate: parse_alignment_rate(&aligned.summary),
        hisat2_summary: aligned.summary,
        sorted_bam: sorted.bam,
        transcripts_gtf: quant.transcripts,
        plot: viz.plot,
    })
}

/// Runs the whole graph. Configuration and reference errors are returned; per-sample
/// failures are collected into the summary.
pub async fn run(
    config: Arc<RunConfig>,
    runner: Arc<dyn ToolRunner>,
    versions: Vec<ToolVersion>,
) -> Result<RunSummary, PipelineError> {
    let started = Local::now();
    let samples = input::resolve_inputs(&config)?;

    let layout = OutputLayout::new(&config.out_dir);
    for dir in layout.shared_dirs().iter().chain(std::iter::once(&config.work_dir)) {
        ensure_dir(dir)?;
    }
    if config.save_unaligned {
        ensure_dir(&layout.unaligned_dir())?;
    }

    let scratch = if config.save_reference {
        None
    } else {
        Some(
            tempfile::Builder::new()
                .prefix("xenotx_reference_")
                .tempdir_in(&config.work_dir)?,
        )
    };
    let index_dir = match &scratch {
        Some(dir) => dir.path().to_path_buf(),
        None => layout.reference_dir(),
    };
    ensure_dir(&index_dir)?;

    let scheduler = Scheduler::new(runner, config.resources);
    let ctx = Arc::new(StageContext {
        config: config.clone(),
        layout: layout.clone(),
        scheduler,
    });

    let (publisher, index_rx) = broadcast::<ReferenceIndex>("reference_index");
    let reference_task = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let index = reference::prepare_reference(ctx, &index_dir).await?;
            publisher.publish(index);
            Ok::<(), PipelineError>(())
        })
    };

    let sample_ids: Vec<String> = samples.iter().map(|s| s.id.clone()).collect();
    let (producers, outcomes) = barrier::<SampleOutcome>("sample_branches", samples.len());
    let mut branches = Vec::with_capacity(samples.len());
    for (sample, producer) in samples.into_iter().zip(producers) {
        let ctx = ctx.clone();
        let index_rx = index_rx.clone();
        branches.push(tokio::spawn(async move {
            let id = sample.id.clone();
            let outcome = match run_sample(ctx, sample, index_rx).await {
                Ok(report) => {
                    info!("Sample {} finished", id);
                    Ok(report)
                }
                Err(e) if e.is_fatal() => {
                    error!("Sample {} stopped outside a tool stage: {}", id, e);
                    Err(failure(&id, &e))
                }
                Err(e) => {
                    warn!("Sample {} failed: {}", id, e);
                    Err(failure(&id, &e))
                }
            };
            if producer.send(outcome).is_ok() {
                producer.complete();
            }
        }));
    }
    drop(index_rx);

    let reference_result = match reference_task.await {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Other(anyhow!("reference task failed: {}", e))),
    };
    let reporter = RunReporter::new(config.clone(), &layout, versions);

    if let Err(e) = reference_result {
        error!("{}; aborting {} sample branches", e, branches.len());
        for branch in &branches {
            branch.abort();
        }
        let ledger = ctx.scheduler.ledger();
        let summary = RunSummary {
            run_name: config.run_name.clone(),
            started,
            finished: Local::now(),
            reference_built: false,
            succeeded: Vec::new(),
            failed: sample_ids
                .iter()
                .map(|id| FailedSample {
                    sample: id.clone(),
                    stage: Some(Stage::ReferencePrep),
                    error: e.to_string(),
                })
                .collect(),
            tasks_succeeded: ledger.succeeded(),
            tasks_failed: ledger.failed(),
            tasks: ledger.records(),
        };
        if let Err(report_err) = reporter.finalize(&summary) {
            warn!("{}", report_err);
        }
        return Err(e);
    }

    let collected = outcomes.collect_partial().await;
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for outcome in collected.items {
        match outcome {
            Ok(report) => succeeded.push(report),
            Err(failed_sample) => failed.push(failed_sample),
        }
    }
    let reported: HashSet<String> = succeeded
        .iter()
        .map(|s: &SampleReport| s.sample.clone())
        .chain(failed.iter().map(|f: &FailedSample| f.sample.clone()))
        .collect();
    for id in sample_ids.iter().filter(|id| !reported.contains(*id)) {
        failed.push(FailedSample {
            sample: id.clone(),
            stage: None,
            error: "sample branch ended without reporting an outcome".to_string(),
        });
    }
    succeeded.sort_by(|a, b| a.sample.cmp(&b.sample));
    failed.sort_by(|a, b| a.sample.cmp(&b.sample));

    if !failed.is_empty() && !succeeded.is_empty() {
        warn!(
            "{} of {} samples failed ({}); the run is still reported successful",
            failed.len(),
            sample_ids.len(),
            failed.iter().map(|f| f.sample.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let ledger = ctx.scheduler.ledger();
    let summary = RunSummary {
        run_name: config.run_name.clone(),
        started,
        finished: Local::now(),
        reference_built: true,
        succeeded,
        failed,
        tasks_succeeded: ledger.succeeded(),
        tasks_failed: ledger.failed(),
        tasks: ledger.records(),
    };
    info!(
        "{} samples succeeded, {} failed; {} tasks succeeded, {} failed",
        summary.succeeded.len(),
        summary.failed.len(),
        summary.tasks_succeeded,
        summary.tasks_failed
    );

    if let Err(e) = reporter.finalize(&summary) {
        warn!("{}", e);
    }
    drop(scratch);
    Ok(summary)
}
