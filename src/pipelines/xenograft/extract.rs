// Region extraction: index the input alignment if needed, subset to the xeno contigs, write FASTQ.
use std::path::PathBuf;

use log::{debug, info};

use crate::config::defs::{PipelineError, ToolError};
use crate::config::layout::existing_bam_index;
use crate::graph::{Stage, StageTask};
use crate::pipelines::xenograft::input::Sample;
use crate::pipelines::xenograft::{stage_error, StageContext};
use crate::utils::command::samtools;
use crate::utils::fastq::count_fastq_records;
use crate::utils::file::{remove_intermediates, with_suffix};

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedReads {
    pub sample: String,
    pub mate1: PathBuf,
    /// `None` in single-end mode.
    pub mate2: Option<PathBuf>,
    pub read_count: u64,
}

pub async fn extract_region(ctx: &StageContext, sample: &Sample) -> Result<ExtractedReads, PipelineError> {
    let config = &ctx.config;
    let id = sample.id.as_str();
    let cpus = config.task_cpus();
    let err = stage_error(Stage::RegionExtract, id);
    let sample_dir = ctx.layout.sample_dir(id);
    let work_dir = config.work_dir.join(id);

    let index = match existing_bam_index(&sample.alignment) {
        Some(index) => {
            debug!("[{}] {} reusing index {}", Stage::RegionExtract, id, index.display());
            index
        }
        None => {
            let file_name = sample
                .alignment
                .file_name()
                .ok_or_else(|| err(ToolError::MissingInput {
                    tool: "samtools".to_string(),
                    path: sample.alignment.clone(),
                }))?;
            let index = with_suffix(&sample_dir.join(file_name), ".bai");
            let task = StageTask::for_sample(
                Stage::RegionExtract,
                id,
                samtools::index(&sample.alignment, &index, cpus),
            );
            ctx.scheduler.execute(task).await.map_err(&err)?;
            index
        }
    };

    let subset = work_dir.join(format!("{}.xeno.bam", id));
    let task = StageTask::for_sample(
        Stage::RegionExtract,
        id,
        samtools::view_regions(&sample.alignment, &index, &config.reference.xeno, &subset, cpus),
    );
    ctx.scheduler.execute(task).await.map_err(&err)?;

    let name_sorted = work_dir.join(format!("{}.xeno.namesorted.bam", id));
    let task = StageTask::for_sample(
        Stage::RegionExtract,
        id,
        samtools::sort(&subset, &name_sorted, cpus, config.sort_memory_per_thread(), true),
    );
    ctx.scheduler.execute(task).await.map_err(&err)?;

    let mate1 = sample_dir.join(format!("{}_R1.fastq.gz", id));
    let mate2 = if config.single_end {
        None
    } else {
        Some(sample_dir.join(format!("{}_R2.fastq.gz", id)))
    };
    let task = StageTask::for_sample(
        Stage::RegionExtract,
        id,
        samtools::fastq(&name_sorted, &mate1, mate2.as_deref(), cpus),
    );
    ctx.scheduler.execute(task).await.map_err(&err)?;

    let count_path = mate1.clone();
    let read_count = ctx
        .scheduler
        .execute_blocking(Stage::RegionExtract, id, "count_reads", move || count_fastq_records(&count_path))
        .await
        .map_err(&err)?;
    info!("[{}] {} extracted {} reads on {}", Stage::RegionExtract, id, read_count, config.reference.xeno.join(","));

    if !config.keep_intermediates {
        remove_intermediates(&[subset, name_sorted]);
    }

    Ok(ExtractedReads {
        sample: id.to_string(),
        mate1,
        mate2,
        read_count,
    })
}
