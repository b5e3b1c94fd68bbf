use std::path::{Path, PathBuf};

use crate::config::defs::{
    BAI_EXT, BAM_EXT, HISAT2_DIR, HISAT2_SORTED_DIR, HISAT2_UNALIGNED_DIR, PIPELINE_INFO_DIR,
    REFERENCE_DIR, STRINGTIE_COV_REFS_DIR, STRINGTIE_DIR, STRINGTIE_FASTA_DIR,
    STRINGTIE_TRANSCRIPTS_DIR, VIZ_DIR,
};
use crate::utils::file::with_suffix;

/// Published directory tree under `outdir`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: &Path) -> Self {
        OutputLayout { root: root.to_path_buf() }
    }

    pub fn sample_dir(&self, sample: &str) -> PathBuf {
        self.root.join(sample)
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.root.join(REFERENCE_DIR)
    }

    pub fn hisat2_dir(&self) -> PathBuf {
        self.root.join(HISAT2_DIR)
    }

    pub fn sorted_dir(&self) -> PathBuf {
        self.hisat2_dir().join(HISAT2_SORTED_DIR)
    }

    pub fn unaligned_dir(&self) -> PathBuf {
        self.hisat2_dir().join(HISAT2_UNALIGNED_DIR)
    }

    pub fn stringtie_transcripts_dir(&self) -> PathBuf {
        self.root.join(STRINGTIE_DIR).join(STRINGTIE_TRANSCRIPTS_DIR)
    }

    pub fn stringtie_cov_refs_dir(&self) -> PathBuf {
        self.root.join(STRINGTIE_DIR).join(STRINGTIE_COV_REFS_DIR)
    }

    pub fn stringtie_fasta_dir(&self) -> PathBuf {
        self.root.join(STRINGTIE_DIR).join(STRINGTIE_FASTA_DIR)
    }

    pub fn viz_dir(&self, sample: &str) -> PathBuf {
        self.root.join(VIZ_DIR).join(sample)
    }

    pub fn pipeline_info_dir(&self) -> PathBuf {
        self.root.join(PIPELINE_INFO_DIR)
    }

    /// Every directory shared by all samples, created before the graph starts.
    pub fn shared_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.hisat2_dir(),
            self.sorted_dir(),
            self.stringtie_transcripts_dir(),
            self.stringtie_cov_refs_dir(),
            self.stringtie_fasta_dir(),
            self.pipeline_info_dir(),
        ]
    }
}

/// `<bam>.bai`, the companion index name samtools writes by default.
pub fn bam_index_path(bam: &Path) -> PathBuf {
    with_suffix(bam, &format!(".{}", BAI_EXT))
}

/// Finds an existing index next to `bam`: `<bam>.bai` or `<stem>.bai`.
pub fn existing_bam_index(bam: &Path) -> Option<PathBuf> {
    let appended = bam_index_path(bam);
    if appended.exists() {
        return Some(appended);
    }
    let is_bam = bam.extension().map(|e| e.eq_ignore_ascii_case(BAM_EXT)).unwrap_or(false);
    if is_bam {
        let replaced = bam.with_extension(BAI_EXT);
        if replaced.exists() {
            return Some(replaced);
        }
    }
    None
}
