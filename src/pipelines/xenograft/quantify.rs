// StringTie assembly/quantification, merge with the reference annotation, transcript sequences.
use std::path::PathBuf;

use crate::config::defs::PipelineError;
use crate::config::naming::quantification_name;
use crate::graph::{Stage, StageTask};
use crate::pipelines::xenograft::sort::SortedAlignment;
use crate::pipelines::xenograft::{stage_error, StageContext};
use crate::utils::command::{gffread, stringtie};

#[derive(Debug, Clone, PartialEq)]
pub struct Quantification {
    pub sample: String,
    /// Assembled transcripts, annotated against the reference GTF.
    pub transcripts: PathBuf,
    pub merged: PathBuf,
    pub gene_abundance: PathBuf,
    pub coverage_refs: PathBuf,
    pub transcript_fasta: PathBuf,
}

pub async fn quantify(ctx: &StageContext, sorted: &SortedAlignment) -> Result<Quantification, PipelineError> {
    let config = &ctx.config;
    let id = sorted.sample.as_str();
    let cpus = config.task_cpus();
    let err = stage_error(Stage::Quantify, id);

    let name = quantification_name(&sorted.bam);
    let transcripts_dir = ctx.layout.stringtie_transcripts_dir();
    let quant = Quantification {
        sample: id.to_string(),
        transcripts: transcripts_dir.join(format!("{}_transcripts.gtf", name)),
        merged: transcripts_dir.join(format!("{}_merged.gtf", name)),
        gene_abundance: transcripts_dir.join(format!("{}.gene_abund.txt", name)),
        coverage_refs: ctx.layout.stringtie_cov_refs_dir().join(format!("{}.cov_refs.gtf", name)),
        transcript_fasta: ctx.layout.stringtie_fasta_dir().join(format!("{}_transcripts.fa", name)),
    };

    let assemble = stringtie::assemble(&stringtie::AssembleRequest {
        bam: &sorted.bam,
        gtf: &config.reference.gtf,
        strand_flag: config.strandedness.stringtie_flag(),
        transcripts: &quant.transcripts,
        gene_abundance: &quant.gene_abundance,
        coverage_refs: &quant.coverage_refs,
        cpus,
    });
    ctx.scheduler
        .execute(StageTask::for_sample(Stage::Quantify, id, assemble))
        .await
        .map_err(&err)?;

    let merge = stringtie::merge(&config.reference.gtf, &quant.transcripts, &quant.merged, cpus);
    ctx.scheduler
        .execute(StageTask::for_sample(Stage::Quantify, id, merge))
        .await
        .map_err(&err)?;

    let fasta = gffread::transcript_fasta(&quant.merged, &config.reference.fasta, &quant.transcript_fasta);
    ctx.scheduler
        .execute(StageTask::for_sample(Stage::Quantify, id, fasta))
        .await
        .map_err(&err)?;

    Ok(quant)
}
