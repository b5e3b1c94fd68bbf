// Strandedness-aware HISAT2 alignment against the broadcast index.
use std::path::PathBuf;

use crate::config::defs::PipelineError;
use crate::config::naming::alignment_prefix;
use crate::graph::{Stage, StageTask};
use crate::pipelines::xenograft::extract::ExtractedReads;
use crate::pipelines::xenograft::reference::ReferenceIndex;
use crate::pipelines::xenograft::{stage_error, StageContext};
use crate::utils::command::{hisat2, samtools};
use crate::utils::file::remove_intermediates;

#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSample {
    pub sample: String,
    pub bam: PathBuf,
    pub summary: PathBuf,
}

pub async fn align_sample(
    ctx: &StageContext,
    reads: &ExtractedReads,
    index: &ReferenceIndex,
) -> Result<AlignedSample, PipelineError> {
    let config = &ctx.config;
    let id = reads.sample.as_str();
    let cpus = config.task_cpus();
    let err = stage_error(Stage::Align, id);

    let prefix = alignment_prefix(&reads.mate1);
    let hisat2_dir = ctx.layout.hisat2_dir();
    let sam = config.work_dir.join(id).join(format!("{}.sam", prefix));
    let summary = hisat2_dir.join(format!("{}.hisat2_summary.txt", prefix));
    let bam = hisat2_dir.join(format!("{}.bam", prefix));

    let request = hisat2::AlignRequest {
        index_base: &index.index_base,
        splice_sites: &index.splice_sites,
        mate1: &reads.mate1,
        mate2: reads.mate2.as_deref(),
        sam: &sam,
        summary: &summary,
        strandness: config.strandedness.hisat2_strandness(config.single_end),
        unaligned_prefix: config.save_unaligned.then(|| ctx.layout.unaligned_dir().join(&prefix)),
        cpus,
    };
    let task = StageTask::for_sample(Stage::Align, id, hisat2::align(&request));
    ctx.scheduler.execute(task).await.map_err(&err)?;

    let task = StageTask::for_sample(Stage::Align, id, samtools::view_filter(&sam, &bam, cpus));
    ctx.scheduler.execute(task).await.map_err(&err)?;

    if !config.keep_intermediates {
        remove_intermediates(&[sam]);
    }

    Ok(AlignedSample {
        sample: id.to_string(),
        bam,
        summary,
    })
}
