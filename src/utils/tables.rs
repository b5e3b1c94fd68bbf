// Parsers for the tabular files the visualizer reads: gffread --table output and mosdepth region beds.
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;

use crate::utils::file::is_gzipped;

/// One assembled transcript from `gffread --table` over the StringTie GTF.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRow {
    pub chr: String,
    pub start: u64,
    pub end: u64,
    pub strand: char,
    pub exons: u32,
    pub reference_id: Option<String>,
    pub ref_gene_id: Option<String>,
    pub ref_gene_name: Option<String>,
    pub fpkm: Option<f64>,
}

/// One annotated transcript from `gffread --table` over the reference GTF.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRow {
    pub chr: String,
    pub start: u64,
    pub end: u64,
    pub strand: char,
    pub exons: u32,
    pub gene_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageInterval {
    pub chr: String,
    pub start: u64,
    pub end: u64,
    pub depth: f64,
}

/// gffread writes `.` for absent attributes.
fn optional(field: &str) -> Option<String> {
    match field.trim() {
        "" | "." => None,
        value => Some(value.to_string()),
    }
}

fn strand(field: &str) -> Result<char> {
    match field.trim() {
        "+" => Ok('+'),
        "-" => Ok('-'),
        "." | "" => Ok('.'),
        other => Err(anyhow!("invalid strand '{}'", other)),
    }
}

impl TranscriptRow {
    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        macro_rules! next {
            () => {
                fields.next().ok_or_else(|| anyhow!("missing field"))?
            };
        }
        Ok(Self {
            chr: next!().to_string(),
            start: next!().trim().parse()?,
            end: next!().trim().parse()?,
            strand: strand(next!())?,
            exons: next!().trim().parse()?,
            reference_id: optional(next!()),
            ref_gene_id: optional(next!()),
            ref_gene_name: optional(next!()),
            fpkm: optional(next!()).map(|v| v.parse()).transpose()?,
        })
    }

    /// Label for the plot: reference gene name, else reference id, else "novel".
    pub fn label(&self) -> &str {
        self.ref_gene_name
            .as_deref()
            .or(self.reference_id.as_deref())
            .unwrap_or("novel")
    }
}

impl ReferenceRow {
    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        macro_rules! next {
            () => {
                fields.next().ok_or_else(|| anyhow!("missing field"))?
            };
        }
        Ok(Self {
            chr: next!().to_string(),
            start: next!().trim().parse()?,
            end: next!().trim().parse()?,
            strand: strand(next!())?,
            exons: next!().trim().parse()?,
            gene_name: optional(next!()),
        })
    }
}

impl CoverageInterval {
    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        macro_rules! next {
            () => {
                fields.next().ok_or_else(|| anyhow!("missing field"))?
            };
        }
        Ok(Self {
            chr: next!().to_string(),
            start: next!().trim().parse()?,
            end: next!().trim().parse()?,
            depth: next!().trim().parse()?,
        })
    }
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader: Box<dyn Read> = if is_gzipped(path)? {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

fn read_rows<T>(path: &Path, parse: fn(&str) -> Result<T>) -> Result<Vec<T>> {
    let reader = open_maybe_gz(path)?;
    let mut rows = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let row = parse(&line).with_context(|| format!("{}:{}: malformed row", path.display(), i + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_transcript_table(path: &Path) -> Result<Vec<TranscriptRow>> {
    read_rows(path, TranscriptRow::parse_line)
}

pub fn read_reference_table(path: &Path) -> Result<Vec<ReferenceRow>> {
    read_rows(path, ReferenceRow::parse_line)
}

/// mosdepth `*.regions.bed.gz`: chrom, start, end, mean depth. Rows on other
/// chromosomes are dropped while reading, so memory scales with `contigs` only.
pub fn read_coverage_bed(path: &Path, contigs: &[String]) -> Result<Vec<CoverageInterval>> {
    let reader = open_maybe_gz(path)?;
    let mut rows = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let chr = line.split('\t').next().unwrap_or_default();
        if !contigs.iter().any(|c| c == chr) {
            continue;
        }
        let row = CoverageInterval::parse_line(&line)
            .with_context(|| format!("{}:{}: malformed row", path.display(), i + 1))?;
        rows.push(row);
    }
    Ok(rows)
}
