// Per-sample visualization: mosdepth coverage, transcript tables and the comparison plot.
use std::path::{Path, PathBuf};

use anyhow::Context;
use futures::future::try_join_all;

use crate::config::defs::{PipelineError, ASSEMBLED_TABLE_FIELDS, REFERENCE_TABLE_FIELDS};
use crate::graph::{Stage, StageTask};
use crate::pipelines::xenograft::quantify::Quantification;
use crate::pipelines::xenograft::sort::SortedAlignment;
use crate::pipelines::xenograft::{stage_error, StageContext};
use crate::utils::command::{gffread, mosdepth};
use crate::utils::plotting::plot_xeno_comparison;
use crate::utils::tables::{read_coverage_bed, read_reference_table, read_transcript_table};

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageTrack {
    pub sample: String,
    /// One mosdepth regions file per xeno contig, in contig order.
    pub regions_beds: Vec<PathBuf>,
    pub summaries: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationReport {
    pub sample: String,
    pub assembled_table: PathBuf,
    pub reference_table: PathBuf,
    pub plot: PathBuf,
}

/// mosdepth prefix for one contig; a lone contig keeps the bare sample prefix.
pub fn coverage_prefix(viz_dir: &Path, sample: &str, contig: &str, contigs: usize) -> PathBuf {
    if contigs == 1 {
        viz_dir.join(sample)
    } else {
        viz_dir.join(format!("{}.{}", sample, contig))
    }
}

/// Depth at single-base windows, one mosdepth run per xeno contig.
pub async fn compute_coverage(ctx: &StageContext, sorted: &SortedAlignment) -> Result<CoverageTrack, PipelineError> {
    let id = sorted.sample.as_str();
    let viz_dir = ctx.layout.viz_dir(id);
    let contigs = &ctx.config.reference.xeno;
    let prefixes: Vec<PathBuf> = contigs
        .iter()
        .map(|contig| coverage_prefix(&viz_dir, id, contig, contigs.len()))
        .collect();

    try_join_all(contigs.iter().zip(&prefixes).map(|(contig, prefix)| {
        let command = mosdepth::depth(&sorted.bam, &sorted.bai, prefix, contig, ctx.config.task_cpus());
        ctx.scheduler.execute(StageTask::for_sample(Stage::Visualize, id, command))
    }))
    .await
    .map_err(stage_error(Stage::Visualize, id))?;

    Ok(CoverageTrack {
        sample: id.to_string(),
        regions_beds: prefixes.iter().map(|p| mosdepth::regions_bed(p)).collect(),
        summaries: prefixes.iter().map(|p| mosdepth::summary(p)).collect(),
    })
}

pub async fn render_comparison(
    ctx: &StageContext,
    coverage: &CoverageTrack,
    quant: &Quantification,
) -> Result<VisualizationReport, PipelineError> {
    let id = coverage.sample.as_str();
    let err = stage_error(Stage::Visualize, id);
    let viz_dir = ctx.layout.viz_dir(id);
    let assembled_table = viz_dir.join(format!("{}.assembled.tsv", id));
    let reference_table = viz_dir.join(format!("{}.reference.tsv", id));
    let plot = viz_dir.join(format!("{}_xeno_plot.svg", id));

    let assembled = gffread::table(&quant.transcripts, ASSEMBLED_TABLE_FIELDS, &assembled_table);
    let reference = gffread::table(&ctx.config.reference.gtf, REFERENCE_TABLE_FIELDS, &reference_table);
    tokio::try_join!(
        ctx.scheduler.execute(StageTask::for_sample(Stage::Visualize, id, assembled)),
        ctx.scheduler.execute(StageTask::for_sample(Stage::Visualize, id, reference)),
    )
    .map_err(&err)?;

    let contigs = ctx.config.reference.xeno.clone();
    let sample = id.to_string();
    let (beds, assembled_path, reference_path, plot_path) =
        (coverage.regions_beds.clone(), assembled_table.clone(), reference_table.clone(), plot.clone());
    ctx.scheduler
        .execute_blocking(Stage::Visualize, id, "plot", move || {
            let mut coverage = Vec::new();
            for bed in &beds {
                coverage.extend(read_coverage_bed(bed, &contigs)?);
            }
            let assembled = read_transcript_table(&assembled_path)?;
            let reference: Vec<_> = read_reference_table(&reference_path)?
                .into_iter()
                .filter(|r| contigs.contains(&r.chr))
                .collect();
            plot_xeno_comparison(&coverage, &reference, &assembled, &contigs, &sample, &plot_path)
                .with_context(|| format!("rendering {}", plot_path.display()))
        })
        .await
        .map_err(&err)?;

    Ok(VisualizationReport {
        sample: id.to_string(),
        assembled_table,
        reference_table,
        plot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_prefix_per_contig() {
        let dir = Path::new("results/viz/S1");
        assert_eq!(coverage_prefix(dir, "S1", "chrX_donor", 1), dir.join("S1"));
        assert_eq!(coverage_prefix(dir, "S1", "chrY_donor", 2), dir.join("S1.chrY_donor"));
    }
}
