//! Step output capture.
//!
//! A [`LineWriter`] is created per executing step. Each write becomes one
//! [`Line`] with secrets masked, is kept in an in-memory history and is
//! forwarded to a remote [`Peer`].

use async_trait::async_trait;
use bytes::Bytes;
use drover_core::{Line, LineKind, LogFile};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Replacement written in place of every secret occurrence.
pub const MASK: &str = "********";

/// Remote sink for step output.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Forwards one line of the work item `id`.
    async fn log(&self, id: &str, line: Line) -> Result<()>;

    /// Uploads a file produced by the work item `id`.
    async fn upload(&self, id: &str, file: LogFile) -> Result<()>;
}

/// Captures one step's output as ordered, masked lines.
pub struct LineWriter {
    peer: Arc<dyn Peer>,
    id: String,
    name: String,
    secrets: Vec<String>,
    start: Instant,
    pos: u64,
    lines: Vec<Line>,
}

impl LineWriter {
    /// Creates a writer for step `name` of work item `id`.
    ///
    /// Empty secrets are ignored. Longer secrets are masked first so a
    /// secret containing another is hidden entirely.
    pub fn new<I, S>(peer: Arc<dyn Peer>, id: impl Into<String>, name: impl Into<String>, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));

        Self {
            peer,
            id: id.into(),
            name: name.into(),
            secrets,
            start: Instant::now(),
            pos: 0,
            lines: Vec::new(),
        }
    }

    /// Writes `data` as one stdout line. Always reports the full input as
    /// consumed; forwarding failures are logged, not returned.
    pub async fn write(&mut self, data: &[u8]) -> usize {
        self.write_kind(LineKind::Stdout, data).await
    }

    /// Writes `data` as one line of the given kind.
    pub async fn write_kind(&mut self, kind: LineKind, data: &[u8]) -> usize {
        let line = Line {
            proc: self.name.clone(),
            time: self.start.elapsed().as_secs() as i64,
            kind,
            pos: self.pos,
            out: self.redact(&String::from_utf8_lossy(data)),
        };
        self.pos += 1;
        self.lines.push(line.clone());

        if let Err(e) = self.peer.log(&self.id, line).await {
            warn!(item = %self.id, proc = %self.name, error = %e, "failed to forward log line");
        }

        data.len()
    }

    /// Copies a byte stream into the writer, one line per newline-terminated
    /// chunk. A trailing partial line is flushed when the stream ends.
    ///
    /// Returns the number of bytes consumed, or the first stream error.
    pub async fn copy_stream<S, E>(&mut self, mut stream: S) -> std::result::Result<u64, E>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut total = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            pending.extend_from_slice(&chunk);

            while let Some(idx) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=idx).collect();
                self.write(&line).await;
            }
        }

        if !pending.is_empty() {
            self.write(&pending).await;
        }

        debug!(item = %self.id, proc = %self.name, bytes = total, "log stream drained");
        Ok(total)
    }

    /// Returns the accumulated history.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Drops the history; positions keep counting from where they were.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns the position the next line will get.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns the step display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}

/// Log sink that writes step output to the process log.
#[derive(Debug, Default, Clone)]
pub struct TracingPeer;

#[async_trait]
impl Peer for TracingPeer {
    async fn log(&self, id: &str, line: Line) -> Result<()> {
        info!(
            target: "drover::step",
            item = %id,
            proc = %line.proc,
            pos = line.pos,
            "{}",
            line.out.trim_end()
        );
        Ok(())
    }

    async fn upload(&self, id: &str, file: LogFile) -> Result<()> {
        info!(
            item = %id,
            proc = %file.proc,
            name = %file.name,
            size = file.size,
            "step log uploaded"
        );
        Ok(())
    }
}

/// Log sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct RecordingPeer {
    lines: Mutex<Vec<(String, Line)>>,
    files: Mutex<Vec<(String, LogFile)>>,
    fail: bool,
}

impl RecordingPeer {
    /// Creates a sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that records but reports every call as failed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Returns the received lines with their work item ids.
    pub async fn lines(&self) -> Vec<(String, Line)> {
        self.lines.lock().await.clone()
    }

    /// Returns the received lines of one step.
    pub async fn lines_for(&self, proc: &str) -> Vec<Line> {
        self.lines
            .lock()
            .await
            .iter()
            .filter(|(_, line)| line.proc == proc)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Returns the uploaded files with their work item ids.
    pub async fn files(&self) -> Vec<(String, LogFile)> {
        self.files.lock().await.clone()
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    async fn log(&self, id: &str, line: Line) -> Result<()> {
        self.lines.lock().await.push((id.to_string(), line));
        if self.fail {
            return Err(TransportError::sink("log rejected"));
        }
        Ok(())
    }

    async fn upload(&self, id: &str, file: LogFile) -> Result<()> {
        self.files.lock().await.push((id.to_string(), file));
        if self.fail {
            return Err(TransportError::sink("upload rejected"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn writer(peer: Arc<RecordingPeer>, secrets: &[&str]) -> LineWriter {
        LineWriter::new(peer, "42", "build", secrets.iter().copied())
    }

    #[tokio::test]
    async fn masks_configured_secret() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer.clone(), &["s3cr3t"]);

        let n = w.write(b"token=s3cr3t").await;

        assert_eq!(n, "token=s3cr3t".len());
        assert_eq!(w.lines()[0].out, "token=********");
        let forwarded = peer.lines().await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, "42");
        assert!(!forwarded[0].1.out.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn masking_is_case_sensitive_and_ignores_empty_secrets() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &["", "Secret"]);

        w.write(b"secret Secret").await;

        assert_eq!(w.lines()[0].out, "secret ********");
    }

    #[tokio::test]
    async fn longer_secret_is_masked_before_its_prefix() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &["abc", "abcdef"]);

        w.write(b"x=abcdef").await;

        assert_eq!(w.lines()[0].out, "x=********");
    }

    #[tokio::test]
    async fn positions_increase_and_survive_clear() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &[]);

        w.write(b"one").await;
        w.write(b"two").await;
        assert_eq!(w.lines().iter().map(|l| l.pos).collect::<Vec<_>>(), vec![0, 1]);

        w.clear();
        assert!(w.lines().is_empty());

        w.write(b"three").await;
        assert_eq!(w.lines().len(), 1);
        assert_eq!(w.lines()[0].pos, 2);
        assert_eq!(w.lines()[0].proc, "build");
    }

    #[tokio::test]
    async fn forwarding_failure_is_not_a_write_failure() {
        let peer = Arc::new(RecordingPeer::failing());
        let mut w = writer(peer.clone(), &[]);

        assert_eq!(w.write(b"hello").await, 5);
        assert_eq!(w.lines().len(), 1);
        assert_eq!(peer.lines().await.len(), 1);
    }

    #[tokio::test]
    async fn copy_stream_splits_lines_across_chunks() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &["hunter2"]);

        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"first\nsec")),
            Ok(Bytes::from_static(b"ond pass=hunt")),
            Ok(Bytes::from_static(b"er2\ntrailing")),
        ];

        let copied = w.copy_stream(stream::iter(chunks)).await.unwrap();

        assert_eq!(copied, 34);
        let outs: Vec<&str> = w.lines().iter().map(|l| l.out.as_str()).collect();
        assert_eq!(outs, vec!["first\n", "second pass=********\n", "trailing"]);
    }

    #[tokio::test]
    async fn copy_stream_returns_stream_error() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &[]);

        let chunks: Vec<std::result::Result<Bytes, &'static str>> =
            vec![Ok(Bytes::from_static(b"ok\n")), Err("connection reset")];

        let err = w.copy_stream(stream::iter(chunks)).await.unwrap_err();
        assert_eq!(err, "connection reset");
        assert_eq!(w.lines().len(), 1);
    }

    #[tokio::test]
    async fn exit_code_line_kind() {
        let peer = Arc::new(RecordingPeer::new());
        let mut w = writer(peer, &[]);

        w.write_kind(LineKind::ExitCode, b"1").await;

        assert_eq!(w.lines()[0].kind, LineKind::ExitCode);
    }
}
