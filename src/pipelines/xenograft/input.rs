// Input resolution: sample table or glob -> (sample_id, alignment file) pairs.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use glob::glob;
use log::{debug, info, warn};

use crate::config::defs::{InputSpec, PipelineError, ReferenceBundle, RunConfig};
use crate::config::naming::derive_sample_id;
use crate::utils::file::resolve_path;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: String,
    pub alignment: PathBuf,
}

pub fn validate_reference(reference: &ReferenceBundle) -> Result<(), PipelineError> {
    for path in [&reference.fasta, &reference.gtf] {
        if !path.is_file() {
            return Err(PipelineError::MissingReference(path.clone()));
        }
    }
    Ok(())
}

/// Sample ids become file and directory names under the output root, so they
/// must stay a single path component.
pub fn validate_sample_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.starts_with('.') || id.contains("..") || id.contains(&['/', '\\'][..]) {
        return Err(format!(
            "invalid sample id '{}': must be a plain name without '/', '\\', '..' or a leading '.'",
            id
        ));
    }
    Ok(())
}

fn is_header(record: &csv::StringRecord) -> bool {
    record.len() == 2
        && record[0].eq_ignore_ascii_case("sample")
        && record[1].eq_ignore_ascii_case("path")
}

/// Reads a `sample,path` table (`.tsv`/`.txt` are tab-separated). The header row is optional.
/// Relative paths resolve against the table's directory.
pub fn read_sample_table(table: &Path) -> Result<Vec<Sample>, PipelineError> {
    let delimiter = match table.extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(table)
        .map_err(|e| PipelineError::Configuration(format!("Cannot read sample table {}: {}", table.display(), e)))?;
    let base = table.parent().unwrap_or_else(|| Path::new("."));

    let mut samples: BTreeMap<String, Sample> = BTreeMap::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PipelineError::Configuration(format!("{}: {}", table.display(), e)))?;
        let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 1);
        if i == 0 && is_header(&record) {
            continue;
        }
        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.len() != 2 || record[0].is_empty() || record[1].is_empty() {
            return Err(PipelineError::Configuration(format!(
                "{}:{}: expected two columns 'sample,path'",
                table.display(),
                line
            )));
        }
        validate_sample_id(&record[0])
            .map_err(|e| PipelineError::Configuration(format!("{}:{}: {}", table.display(), line, e)))?;
        let sample = Sample {
            id: record[0].to_string(),
            alignment: resolve_path(Path::new(&record[1]), base),
        };
        if samples.contains_key(&sample.id) {
            return Err(PipelineError::Configuration(format!(
                "Sample '{}' appears more than once in {}",
                sample.id,
                table.display()
            )));
        }
        samples.insert(sample.id.clone(), sample);
    }

    if samples.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "Sample table {} lists no samples",
            table.display()
        )));
    }
    check_inputs_exist(samples.into_values().collect())
}

/// Expands `pattern` (relative to `cwd`) to one sample per matching file.
pub fn glob_samples(pattern: &str, cwd: &Path) -> Result<Vec<Sample>, PipelineError> {
    let full_pattern = resolve_path(Path::new(pattern), cwd);
    let full_pattern = full_pattern.to_string_lossy();
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in glob(&full_pattern)
        .map_err(|e| PipelineError::Configuration(format!("Invalid glob pattern '{}': {}", pattern, e)))?
    {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable match for '{}': {}", pattern, e),
        }
    }

    if paths.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "No input files matched '{}'",
            pattern
        )));
    }

    let mut samples: BTreeMap<String, Sample> = BTreeMap::new();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    for path in paths {
        let id = derive_sample_id(&path.to_string_lossy());
        validate_sample_id(&id)
            .map_err(|e| PipelineError::Configuration(format!("{}: {}", path.display(), e)))?;
        if let Some(previous) = seen.insert(id.clone(), path.clone()) {
            return Err(PipelineError::Configuration(format!(
                "{} and {} both map to sample id '{}'",
                previous.display(),
                path.display(),
                id
            )));
        }
        debug!("Matched {} as sample {}", path.display(), id);
        samples.insert(id.clone(), Sample { id, alignment: path });
    }
    Ok(samples.into_values().collect())
}

fn check_inputs_exist(samples: Vec<Sample>) -> Result<Vec<Sample>, PipelineError> {
    if let Some(missing) = samples.iter().find(|s| !s.alignment.is_file()) {
        return Err(PipelineError::Configuration(format!(
            "Input file for sample '{}' not found: {}",
            missing.id,
            missing.alignment.display()
        )));
    }
    Ok(samples)
}

/// Validates the reference and resolves the sample list. Touches nothing on disk.
pub fn resolve_inputs(config: &RunConfig) -> Result<Vec<Sample>, PipelineError> {
    validate_reference(&config.reference)?;
    let samples = match &config.input {
        InputSpec::Table(table) => read_sample_table(table)?,
        InputSpec::Glob(pattern) => glob_samples(pattern, &config.cwd)?,
    };
    info!(
        "Resolved {} samples: {}",
        samples.len(),
        samples.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(samples)
}
