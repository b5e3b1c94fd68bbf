//! Filename-derived identifiers.
//!
//! Each stage that recovers a sample name from a filename has its own suffix table.
//! The tables differ on purpose: input files arrive under many upstream naming
//! conventions, while stage outputs follow the names this pipeline writes itself.

use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;

/// Bump when `SAMPLE_ID_SUFFIXES` changes; recorded in the run report.
pub const SAMPLE_SUFFIX_TABLE_VERSION: u32 = 1;

/// Stripped in order, each at most once, from the end of an input filename.
pub const SAMPLE_ID_SUFFIXES: &[&str] = &[
    r"\.(gz|bz2)$",
    r"\.(bam|sam|cram|fastq|fq)$",
    r"\.Aligned\.sortedByCoord\.out$",
    r"\.sorted$",
    r"_val_1$",
    r"_trimmed$",
    r"_R1$",
];

/// Aligner output prefix, taken from the mate-1 FASTQ name.
pub const ALIGNMENT_PREFIX_SUFFIX: &str = r"(_R1)?(_trimmed)?(_val_1)?(\.fq)?(\.fastq)?(\.gz)?$";

/// Quantifier output name, taken from the sorted BAM name.
pub const QUANTIFICATION_NAME_SUFFIX: &str = r"(\.sorted)?(\.bam)?$";

lazy_static! {
    static ref SAMPLE_ID_PATTERNS: Vec<Regex> = SAMPLE_ID_SUFFIXES
        .iter()
        .map(|p| Regex::new(p).expect("static sample suffix pattern"))
        .collect();
    static ref ALIGNMENT_PREFIX_PATTERN: Regex =
        Regex::new(ALIGNMENT_PREFIX_SUFFIX).expect("static alignment prefix pattern");
    static ref QUANTIFICATION_NAME_PATTERN: Regex =
        Regex::new(QUANTIFICATION_NAME_SUFFIX).expect("static quantification pattern");
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Recovers the biological sample id from an input filename.
/// Directory components are ignored.
///
/// # Arguments
///
/// * `filename` - file name or path of an input alignment.
///
/// # Returns
/// The sample id; the bare filename if every suffix would be stripped away.
pub fn derive_sample_id(filename: &str) -> String {
    let name = file_name_of(Path::new(filename));
    let mut id = name.clone();
    for pattern in SAMPLE_ID_PATTERNS.iter() {
        id = pattern.replace(&id, "").into_owned();
    }
    if id.is_empty() { name } else { id }
}

pub fn alignment_prefix(mate1: &Path) -> String {
    let name = file_name_of(mate1);
    ALIGNMENT_PREFIX_PATTERN.replace(&name, "").into_owned()
}

pub fn quantification_name(sorted_bam: &Path) -> String {
    let name = file_name_of(sorted_bam);
    QUANTIFICATION_NAME_PATTERN.replace(&name, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_derive_sample_id_is_suffix_invariant() {
        for name in [
            "S1_R1.bam",
            "S1.Aligned.sortedByCoord.out.bam",
            "S1_val_1.bam",
            "S1.bam",
            "S1_R1_trimmed.fq.gz",
            "S1_R1_val_1.fq.gz",
            "S1.sorted.bam",
            "/data/run7/S1.Aligned.sortedByCoord.out.bam",
        ] {
            assert_eq!(derive_sample_id(name), "S1", "failed for {}", name);
        }
    }

    #[test]
    fn test_derive_sample_id_keeps_inner_markers() {
        assert_eq!(derive_sample_id("PDX_R1_lung.bam"), "PDX_R1_lung");
        assert_eq!(derive_sample_id("mouse.trimmed.bam"), "mouse.trimmed");
    }

    #[test]
    fn test_derive_sample_id_never_empty() {
        assert_eq!(derive_sample_id(".bam"), ".bam");
    }

    #[test]
    fn test_alignment_prefix() {
        assert_eq!(alignment_prefix(&PathBuf::from("out/S1/S1_R1.fastq.gz")), "S1");
        assert_eq!(alignment_prefix(&PathBuf::from("S2_R1_val_1.fq.gz")), "S2");
        assert_eq!(alignment_prefix(&PathBuf::from("S4_trimmed.fq")), "S4");
        assert_eq!(alignment_prefix(&PathBuf::from("S3.fastq")), "S3");
    }

    #[test]
    fn test_quantification_name() {
        assert_eq!(quantification_name(&PathBuf::from("HISAT2/aligned_sorted/S1.sorted.bam")), "S1");
        assert_eq!(quantification_name(&PathBuf::from("S2.bam")), "S2");
    }
}
