// Reference preparation: splice-site and exon tables from the GTF, then the HISAT2 index.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::defs::{PipelineError, ToolError, HISAT2_BUILD_TAG};
use crate::graph::{barrier, BarrierProducer, ChannelError, Stage, StageTask};
use crate::pipelines::xenograft::StageContext;
use crate::utils::command::{hisat2, ToolCommand};

/// Everything the aligner needs from the reference build. Read-only once published.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceIndex {
    pub index_base: PathBuf,
    pub splice_sites: PathBuf,
    pub exons: PathBuf,
}

#[derive(Debug)]
enum ReferenceTable {
    SpliceSites(PathBuf),
    Exons(PathBuf),
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reference".to_string())
}

/// Runs one table extraction; the producer completes only on success.
async fn extract_table(
    ctx: Arc<StageContext>,
    command: ToolCommand,
    table: ReferenceTable,
    producer: BarrierProducer<ReferenceTable>,
) -> Result<(), ToolError> {
    ctx.scheduler.execute(StageTask::new(Stage::ReferencePrep, None, command)).await?;
    producer
        .send(table)
        .map_err(|e| ToolError::Upstream(e.to_string()))?;
    producer.complete();
    Ok(())
}

/// Builds the index into `index_dir`. Runs once per run; any failure is fatal.
pub async fn prepare_reference(ctx: Arc<StageContext>, index_dir: &Path) -> Result<ReferenceIndex, PipelineError> {
    let reference = &ctx.config.reference;
    let gtf_stem = file_stem(&reference.gtf);
    let splice_sites = index_dir.join(format!("{}.splice_sites.txt", gtf_stem));
    let exons = index_dir.join(format!("{}.exons.txt", gtf_stem));
    let index_base = index_dir.join(file_stem(&reference.fasta));

    info!("Preparing HISAT2 reference in {}", index_dir.display());

    let (producers, tables) = barrier::<ReferenceTable>("reference_tables", 2);
    let mut producers = producers.into_iter();
    let jobs = [
        (
            hisat2::extract_splice_sites(&reference.gtf, &splice_sites),
            ReferenceTable::SpliceSites(splice_sites.clone()),
        ),
        (
            hisat2::extract_exons(&reference.gtf, &exons),
            ReferenceTable::Exons(exons.clone()),
        ),
    ];
    let mut handles = Vec::new();
    for (command, table) in jobs {
        let producer = producers
            .next()
            .ok_or_else(|| PipelineError::Channel(ChannelError::ConsumerGone("reference_tables".to_string())))?;
        handles.push(tokio::spawn(extract_table(ctx.clone(), command, table, producer)));
    }

    let collected = tables.collect().await;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PipelineError::ReferenceBuild(e)),
            Err(e) => {
                return Err(PipelineError::ReferenceBuild(ToolError::Upstream(format!(
                    "reference table task failed: {}",
                    e
                ))));
            }
        }
    }
    let collected = collected.map_err(|e| PipelineError::ReferenceBuild(ToolError::Upstream(e.to_string())))?;

    let mut splice_sites_table = None;
    let mut exons_table = None;
    for table in collected {
        match table {
            ReferenceTable::SpliceSites(path) => splice_sites_table = Some(path),
            ReferenceTable::Exons(path) => exons_table = Some(path),
        }
    }
    let (splice_sites, exons) = match (splice_sites_table, exons_table) {
        (Some(ss), Some(ex)) => (ss, ex),
        _ => {
            return Err(PipelineError::ReferenceBuild(ToolError::Upstream(
                "splice-site or exon table missing after extraction".to_string(),
            )));
        }
    };

    let build = hisat2::build(
        &reference.fasta,
        &splice_sites,
        &exons,
        &index_base,
        ctx.config.task_cpus(),
    );
    ctx.scheduler
        .execute(StageTask::new(Stage::ReferencePrep, None, build))
        .await
        .map_err(PipelineError::ReferenceBuild)?;
    if !hisat2::index_files_exist(&index_base) {
        return Err(PipelineError::ReferenceBuild(ToolError::MissingOutput {
            tool: HISAT2_BUILD_TAG.to_string(),
            path: index_base,
        }));
    }

    info!("HISAT2 index ready: {}", index_base.display());
    Ok(ReferenceIndex {
        index_base,
        splice_sites,
        exons,
    })
}
