//! Structured step output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound for an uploaded log document, in bytes.
pub const MAX_LOG_UPLOAD: usize = 5_000_000;

/// Mime type of uploaded line histories.
pub const LOG_MIME: &str = "application/json+logs";

/// Kind of a [`Line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Step exit code.
    ExitCode,
    /// Out-of-band metadata.
    Metadata,
    /// Progress report.
    Progress,
}

/// One unit of step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Step display name.
    pub proc: String,

    /// Seconds elapsed since the step started.
    pub time: i64,

    /// Line kind.
    #[serde(rename = "type")]
    pub kind: LineKind,

    /// Position within the step, strictly increasing from zero.
    pub pos: u64,

    /// Output text, with secrets masked.
    pub out: String,
}

/// A file uploaded to the log sink once a step ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Step display name.
    pub proc: String,

    /// File name.
    pub name: String,

    /// Mime type.
    pub mime: String,

    /// File contents.
    pub data: Vec<u8>,

    /// Size of `data` in bytes.
    pub size: usize,

    /// Upload time (Unix seconds).
    pub time: i64,

    /// Extra headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl LogFile {
    /// Builds the `logs.json` upload for a step from its line history,
    /// keeping the end of the log within `max_bytes`.
    pub fn from_lines(proc: impl Into<String>, lines: &[Line], max_bytes: usize) -> serde_json::Result<Self> {
        let data = encode_tail(lines, max_bytes)?;
        Ok(Self {
            proc: proc.into(),
            name: "logs.json".to_string(),
            mime: LOG_MIME.to_string(),
            size: data.len(),
            data,
            time: chrono::Utc::now().timestamp(),
            meta: BTreeMap::new(),
        })
    }
}

/// Encodes `lines` as a JSON array, dropping lines from the front until the
/// document fits in `max_bytes`.
///
/// The most recent output is the useful part of a failing build, so the tail
/// is kept. An empty array is returned if not even the last line fits.
pub fn encode_tail(lines: &[Line], max_bytes: usize) -> serde_json::Result<Vec<u8>> {
    // "[" + "]" plus one comma between consecutive entries
    let mut total = 2usize;
    let mut first = lines.len();

    for (idx, line) in lines.iter().enumerate().rev() {
        let encoded = serde_json::to_vec(line)?.len();
        let separator = usize::from(first != lines.len());
        if total + encoded + separator > max_bytes {
            break;
        }
        total += encoded + separator;
        first = idx;
    }

    serde_json::to_vec(&lines[first..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(pos: u64, out: &str) -> Line {
        Line {
            proc: "build".to_string(),
            time: 0,
            kind: LineKind::Stdout,
            pos,
            out: out.to_string(),
        }
    }

    #[test]
    fn test_line_wire_shape() {
        let json = serde_json::to_value(line(3, "hello")).unwrap();
        assert_eq!(json["proc"], "build");
        assert_eq!(json["type"], "stdout");
        assert_eq!(json["pos"], 3);
        assert_eq!(json["out"], "hello");

        let kind = serde_json::to_value(LineKind::ExitCode).unwrap();
        assert_eq!(kind, "exit-code");
    }

    #[test]
    fn test_encode_tail_keeps_everything_when_small() {
        let lines = vec![line(0, "a"), line(1, "b")];
        let data = encode_tail(&lines, MAX_LOG_UPLOAD).unwrap();
        assert_eq!(data, serde_json::to_vec(&lines).unwrap());
    }

    #[test]
    fn test_encode_tail_drops_oldest_lines() {
        let lines: Vec<Line> = (0..100).map(|i| line(i, "0123456789")).collect();
        let single = serde_json::to_vec(&lines[0]).unwrap().len();
        let limit = 2 + single * 10 + 9;

        let data = encode_tail(&lines, limit).unwrap();
        assert!(data.len() <= limit);

        let kept: Vec<Line> = serde_json::from_slice(&data).unwrap();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept.first().unwrap().pos, 90);
        assert_eq!(kept.last().unwrap().pos, 99);
    }

    #[test]
    fn test_encode_tail_with_tiny_limit() {
        let lines = vec![line(0, "a very long line that cannot fit")];
        let data = encode_tail(&lines, 8).unwrap();
        assert_eq!(data, b"[]");
    }

    #[test]
    fn test_log_file_from_lines() {
        let lines = vec![line(0, "a")];
        let file = LogFile::from_lines("build", &lines, MAX_LOG_UPLOAD).unwrap();
        assert_eq!(file.name, "logs.json");
        assert_eq!(file.mime, LOG_MIME);
        assert_eq!(file.size, file.data.len());
    }
}
