// Coordinate sort + index. The sorted pair is shared read-only by quantification and coverage.
use std::path::PathBuf;

use crate::config::defs::PipelineError;
use crate::config::layout::bam_index_path;
use crate::graph::{Stage, StageTask};
use crate::pipelines::xenograft::align::AlignedSample;
use crate::pipelines::xenograft::{stage_error, StageContext};
use crate::utils::command::samtools;

#[derive(Debug, Clone, PartialEq)]
pub struct SortedAlignment {
    pub sample: String,
    pub bam: PathBuf,
    pub bai: PathBuf,
}

pub async fn sort_and_index(ctx: &StageContext, aligned: &AlignedSample) -> Result<SortedAlignment, PipelineError> {
    let config = &ctx.config;
    let id = aligned.sample.as_str();
    let cpus = config.task_cpus();
    let err = stage_error(Stage::SortIndex, id);

    let stem = aligned
        .bam
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.to_string());
    let sorted = ctx.layout.sorted_dir().join(format!("{}.sorted.bam", stem));
    let bai = bam_index_path(&sorted);

    let task = StageTask::for_sample(
        Stage::SortIndex,
        id,
        samtools::sort(&aligned.bam, &sorted, cpus, config.sort_memory_per_thread(), false),
    );
    ctx.scheduler.execute(task).await.map_err(&err)?;

    let task = StageTask::for_sample(Stage::SortIndex, id, samtools::index(&sorted, &bai, cpus));
    ctx.scheduler.execute(task).await.map_err(&err)?;

    Ok(SortedAlignment {
        sample: id.to_string(),
        bam: sorted,
        bai,
    })
}
