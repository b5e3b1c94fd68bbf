// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncRead, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::process::Child;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Drains one piped stream of a child into lines and waits for the child to exit.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to read.
///
/// # Returns
/// All lines of the stream, in order.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let lines = match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout was not piped"))?;
            collect_lines(out).await?
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr was not piped"))?;
            collect_lines(err).await?
        }
    };
    child.wait().await?;
    Ok(lines)
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<String>> {
    let mut stream = LinesStream::new(BufReader::new(reader).lines());
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await {
        lines.push(line?);
    }
    Ok(lines)
}

/// Last `n` non-empty lines of captured output, joined with newlines.
pub fn tail_lines(bytes: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
