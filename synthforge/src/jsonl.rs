//! Newline-delimited JSON files — the only persisted state.
//!
//! Records flow append-only through the pipeline: each stage reads a JSONL
//! input, writes a JSONL output, and never mutates upstream files. The
//! writer flushes after every line so a killed run leaves a readable prefix
//! for checkpoint-resume.

use std::io::Write as _;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Read every non-blank line of a JSONL file as a [`Value`].
///
/// A missing file reads as empty (the resume path relies on this). Lines
/// that fail to parse are skipped with a warning, matching the tolerant
/// readers upstream stages expect.
pub fn read_values(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let mut values = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => values.push(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed JSONL line");
            }
        }
    }
    Ok(values)
}

/// Read and deserialize every line into `T`, skipping malformed lines.
pub fn read_records<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let values = read_values(path.as_ref())?;
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<T>(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.as_ref().display(), error = %e, "skipping undeserializable record");
            }
        }
    }
    Ok(records)
}

/// Append-mode line writer that flushes after every record.
#[derive(Debug)]
pub struct JsonlWriter {
    file: std::fs::File,
}

impl JsonlWriter {
    /// Open `path` for appending, creating it (and parent directories) as
    /// needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Open `path` for writing from scratch.
    pub fn truncate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self { file })
    }

    /// Serialize `record` as one line and flush it to disk.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let values = read_values(dir.path().join("absent.jsonl")).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.jsonl");
        std::fs::write(&path, "{\"a\":1}\nnot json\n\n{\"a\":2}\n").unwrap();
        let values = read_values(&path).unwrap();
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn writer_appends_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        {
            let mut w = JsonlWriter::append(&path).unwrap();
            w.write(&json!({"n": 1})).unwrap();
        }
        {
            let mut w = JsonlWriter::append(&path).unwrap();
            w.write(&json!({"n": 2})).unwrap();
        }
        let values = read_values(&path).unwrap();
        assert_eq!(values.len(), 2);
    }
}
