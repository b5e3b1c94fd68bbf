use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Result};
use flate2::read::MultiGzDecoder;
use seq_io::fastq::Reader;

use crate::utils::file::is_gzipped;

pub enum FastqReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<File>),
}

impl Read for FastqReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FastqReader::Uncompressed(r) => r.read(buf),
            FastqReader::Gzipped(r) => r.read(buf),
        }
    }
}

pub fn fastq_reader(path: &Path) -> io::Result<Reader<FastqReader>> {
    let file = File::open(path)?;
    let reader = if is_gzipped(path)? {
        Reader::new(FastqReader::Gzipped(MultiGzDecoder::new(file)))
    } else {
        Reader::new(FastqReader::Uncompressed(BufReader::new(file)))
    };
    Ok(reader)
}

/// Number of records in a plain or gzipped FASTQ file.
pub fn count_fastq_records(path: &Path) -> Result<u64> {
    let mut reader = fastq_reader(path)?;
    let mut count = 0u64;
    while let Some(record) = reader.next() {
        record.map_err(|e| anyhow!("Malformed FASTQ record in {}: {}", path.display(), e))?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    const RECORDS: &[u8] = b"@r1/1\nACGTACGT\n+\nIIIIIIII\n@r2/1\nTTGCA\n+\nIIIII\n@r3/1\nGG\n+\nII\n";

    #[test]
    fn test_count_plain_and_gzipped() -> Result<()> {
        let dir = tempdir()?;
        let plain = dir.path().join("S1_R1.fastq");
        std::fs::write(&plain, RECORDS)?;
        assert_eq!(count_fastq_records(&plain)?, 3);

        let gz = dir.path().join("S1_R1.fastq.gz");
        let mut encoder = GzEncoder::new(File::create(&gz)?, Compression::default());
        encoder.write_all(RECORDS)?;
        encoder.finish()?;
        assert_eq!(count_fastq_records(&gz)?, 3);
        Ok(())
    }

    #[test]
    fn test_count_empty_file() -> Result<()> {
        let dir = tempdir()?;
        let empty = dir.path().join("S1_R2.fastq.gz");
        File::create(&empty)?;
        assert_eq!(count_fastq_records(&empty)?, 0);
        Ok(())
    }

    #[test]
    fn test_malformed_record_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let bad = dir.path().join("bad.fastq");
        std::fs::write(&bad, b">not_fastq\nACGT\n")?;
        assert!(count_fastq_records(&bad).is_err());
        Ok(())
    }
}
