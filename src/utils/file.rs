use std::fs::{self, File};
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Absolute paths pass through; relative ones are joined onto `base`.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        debug!("Creating directory {}", dir.display());
    }
    fs::create_dir_all(dir)
}

/// Deletes intermediates of a finished task. Failures only warn; the published outputs are untouched.
pub fn remove_intermediates(paths: &[PathBuf]) {
    for path in paths {
        let result = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
        match result {
            Ok(()) => debug!("Removed intermediate {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove intermediate {}: {}", path.display(), e),
        }
    }
}

/// Appends `suffix` to the file name, keeping the directory. `a/S1.bam` + `.bai` -> `a/S1.bam.bai`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/runs/r1");
        assert_eq!(resolve_path(Path::new("ref/g.fa"), base), PathBuf::from("/runs/r1/ref/g.fa"));
        assert_eq!(resolve_path(Path::new("/data/g.fa"), base), PathBuf::from("/data/g.fa"));
    }

    #[test]
    fn test_is_gzipped() -> io::Result<()> {
        let dir = tempdir()?;
        let plain = dir.path().join("plain.fq");
        fs::write(&plain, b"@r1\nACGT\n+\nIIII\n")?;
        let gz = dir.path().join("reads.fq.gz");
        let mut encoder = GzEncoder::new(File::create(&gz)?, Compression::default());
        encoder.write_all(b"@r1\nACGT\n+\nIIII\n")?;
        encoder.finish()?;
        let empty = dir.path().join("empty.fq");
        File::create(&empty)?;

        assert!(!is_gzipped(&plain)?);
        assert!(is_gzipped(&gz)?);
        assert!(!is_gzipped(&empty)?);
        Ok(())
    }

    #[test]
    fn test_remove_intermediates() -> io::Result<()> {
        let dir = tempdir()?;
        let subset = dir.path().join("S1.xeno.bam");
        let nested = dir.path().join("scratch");
        fs::create_dir(&nested)?;
        fs::write(nested.join("x"), b"x")?;
        File::create(&subset)?;
        remove_intermediates(&[subset.clone(), nested.clone(), dir.path().join("never_written")]);
        assert!(!subset.exists());
        assert!(!nested.exists());
        Ok(())
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix(Path::new("a/S1.bam"), ".bai"), PathBuf::from("a/S1.bam.bai"));
    }
}
