//! The stage executor: bounded-concurrency map from inputs to outputs with
//! checkpoint-resume over newline-JSON files.
//!
//! Every pipeline stage is the same shape: read a JSONL input, run an async
//! operation per record under a concurrency cap, append one JSON line per
//! result, and on restart skip everything the output file already covers.
//! Resume is a correctness property — a record is never silently dropped
//! when resuming and never double-written within one run.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt as _;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::jsonl::{JsonlWriter, read_values};

/// Identity function from a record to its resume key.
///
/// Applied to inputs (to decide what still needs running) and to lines of an
/// existing output file (to learn what already ran). Records without a key
/// always run and never count as processed.
pub type Keyer = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// What a stage operation produced for one input.
#[derive(Debug)]
pub enum StageOutcome {
    /// A record to commit.
    Emit(Value),
    /// Several records to commit (e.g. one per augmentation variation).
    EmitAll(Vec<Value>),
    /// Deliberately write nothing (permanent data error; logged by the op).
    Drop,
}

/// Execution options for one stage run.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Maximum records in flight.
    pub concurrency: usize,
    /// Append to the output file (resume) instead of truncating.
    pub append: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            append: true,
        }
    }
}

/// Summary counts for a completed stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Inputs handed to workers this run.
    pub processed: usize,
    /// Operations that emitted at least one record.
    pub succeeded: usize,
    /// Operations that errored (committed with an in-band `error` field).
    pub failed: usize,
    /// Inputs skipped because the output file already covered them.
    pub skipped: usize,
    /// Operations that deliberately dropped their record.
    pub dropped: usize,
}

/// Resume key extractor reading `metadata.prompt_id`, the usual default.
#[must_use]
pub fn prompt_id_keyer() -> Keyer {
    Arc::new(|value| {
        value
            .pointer("/metadata/prompt_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
    })
}

/// Resume key extractor reading a top-level string field.
#[must_use]
pub fn field_keyer(field: &'static str) -> Keyer {
    Arc::new(move |value| value.get(field).and_then(Value::as_str).map(str::to_owned))
}

fn attach_error(input: Value, message: &str) -> Value {
    match input {
        Value::Object(mut map) => {
            map.insert("error".to_owned(), Value::String(message.to_owned()));
            Value::Object(map)
        }
        other => serde_json::json!({ "input": other, "error": message }),
    }
}

/// Run `op` over `inputs` with bounded concurrency, committing results to
/// `out_path` in completion order.
///
/// An `op` error is committed as the input plus an `error` field, so the
/// record counts as processed on resume; callers that want to re-run
/// failures must filter `error` records out of the output themselves.
pub async fn run_stage<F, Fut>(
    inputs: Vec<Value>,
    keyer: &Keyer,
    out_path: impl AsRef<Path>,
    opts: &StageOptions,
    op: F,
) -> Result<StageReport>
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = Result<StageOutcome>>,
{
    let out_path = out_path.as_ref();
    let mut report = StageReport::default();

    let processed_keys: HashSet<String> = if opts.append {
        read_values(out_path)?
            .iter()
            .filter_map(|line| keyer(line))
            .collect()
    } else {
        HashSet::new()
    };
    if !processed_keys.is_empty() {
        info!(
            count = processed_keys.len(),
            path = %out_path.display(),
            "resuming: found already-processed records",
        );
    }

    let total = inputs.len();
    let remaining: Vec<Value> = inputs
        .into_iter()
        .filter(|input| match keyer(input) {
            Some(key) => !processed_keys.contains(&key),
            None => true,
        })
        .collect();
    report.skipped = total - remaining.len();
    report.processed = remaining.len();

    let mut writer = if opts.append {
        JsonlWriter::append(out_path)?
    } else {
        JsonlWriter::truncate(out_path)?
    };

    let concurrency = opts.concurrency.max(1);
    let op = &op;
    let mut results = futures::stream::iter(remaining.into_iter().map(|input| async move {
        let fallback = input.clone();
        match op(input).await {
            Ok(outcome) => (fallback, Ok(outcome)),
            Err(e) => (fallback, Err(e)),
        }
    }))
    .buffer_unordered(concurrency);

    while let Some((input, result)) = results.next().await {
        match result {
            Ok(StageOutcome::Emit(record)) => {
                writer.write(&record)?;
                report.succeeded += 1;
            }
            Ok(StageOutcome::EmitAll(records)) => {
                for record in &records {
                    writer.write(record)?;
                }
                report.succeeded += 1;
            }
            Ok(StageOutcome::Drop) => {
                report.dropped += 1;
            }
            Err(e) => {
                warn!(error = %e, "stage operation failed; committing error record");
                writer.write(&attach_error(input, &e.to_string()))?;
                report.failed += 1;
            }
        }
    }

    info!(
        processed = report.processed,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        dropped = report.dropped,
        path = %out_path.display(),
        "stage completed",
    );
    if report.failed > 0 {
        error!(failed = report.failed, "stage finished with in-band failures");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"key": format!("k{i}"), "n": i})).collect()
    }

    #[tokio::test]
    async fn commits_every_input_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let keyer = field_keyer("key");

        let report = run_stage(inputs(20), &keyer, &out, &StageOptions::default(), |input| async move {
            Ok(StageOutcome::Emit(input))
        })
        .await
        .unwrap();

        assert_eq!(report.processed, 20);
        assert_eq!(report.succeeded, 20);
        let lines = read_values(&out).unwrap();
        assert_eq!(lines.len(), 20);
        let keys: HashSet<_> = lines.iter().map(|v| v["key"].as_str().unwrap().to_owned()).collect();
        assert_eq!(keys.len(), 20);
    }

    #[tokio::test]
    async fn resume_skips_processed_and_reaches_full_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let keyer = field_keyer("key");

        // First run covers a prefix, as if the process was killed.
        let first: Vec<Value> = inputs(10).into_iter().take(4).collect();
        run_stage(first, &keyer, &out, &StageOptions::default(), |input| async move {
            Ok(StageOutcome::Emit(input))
        })
        .await
        .unwrap();

        // Second run gets the full input list.
        let report = run_stage(inputs(10), &keyer, &out, &StageOptions::default(), |input| async move {
            Ok(StageOutcome::Emit(input))
        })
        .await
        .unwrap();

        assert_eq!(report.skipped, 4);
        assert_eq!(report.processed, 6);
        let lines = read_values(&out).unwrap();
        assert_eq!(lines.len(), 10);
        let keys: HashSet<_> = lines.iter().map(|v| v["key"].as_str().unwrap().to_owned()).collect();
        assert_eq!(keys.len(), 10, "no duplicates after resume");
    }

    #[tokio::test]
    async fn errors_are_committed_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let keyer = field_keyer("key");

        let report = run_stage(inputs(3), &keyer, &out, &StageOptions::default(), |input| async move {
            if input["n"] == 1 {
                Err(crate::error::Error::internal("boom"))
            } else {
                Ok(StageOutcome::Emit(input))
            }
        })
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 2);
        let lines = read_values(&out).unwrap();
        assert_eq!(lines.len(), 3);
        let errored: Vec<_> = lines.iter().filter(|l| l.get("error").is_some()).collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0]["key"], "k1");

        // The errored record counts as processed on resume.
        let report = run_stage(inputs(3), &keyer, &out, &StageOptions::default(), |input| async move {
            Ok(StageOutcome::Emit(input))
        })
        .await
        .unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn dropped_records_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.jsonl");
        let keyer = field_keyer("key");

        let report = run_stage(inputs(2), &keyer, &out, &StageOptions::default(), |input| async move {
            if input["n"] == 0 {
                Ok(StageOutcome::Drop)
            } else {
                Ok(StageOutcome::Emit(input))
            }
        })
        .await
        .unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(read_values(&out).unwrap().len(), 1);
    }
}
