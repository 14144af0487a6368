//! The scored-judge substrate.
//!
//! Every quality signal in both pipelines is an LLM judge returning a
//! [`Scored`]: a numeric score plus a free-form `extra_info` payload. The
//! ensemble rule is uniform — judges run in parallel under a named
//! semaphore, any failure is replaced by the component's safe default, and
//! a safe-defaulted score is flagged with `is_safe_score: 1` so downstream
//! filtering can re-weight or exclude it. A broken judge must never fail a
//! good record: the corpus is the product.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::error::Result;

/// A judge verdict: score plus diagnostic payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scored {
    /// The numeric score.
    pub score: f64,
    /// Per-judge diagnostics (sub-scores, reasoning, raw text, safe flag).
    #[serde(default)]
    pub extra_info: Value,
}

impl Scored {
    /// A verdict with an empty payload.
    #[must_use]
    pub fn new(score: f64) -> Self {
        Self {
            score,
            extra_info: json!({}),
        }
    }

    /// A verdict with a payload.
    #[must_use]
    pub const fn with_info(score: f64, extra_info: Value) -> Self {
        Self { score, extra_info }
    }

    /// The safe-default verdict for a failed judge.
    #[must_use]
    pub fn safe(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score,
            extra_info: json!({
                "error": reason.into(),
                "is_safe_score": 1,
            }),
        }
    }

    /// Whether this verdict is a safe default.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        self.extra_info.get("is_safe_score").and_then(Value::as_i64) == Some(1)
    }

    /// Merge a key into the payload, promoting non-object payloads to
    /// objects first.
    pub fn annotate(&mut self, key: &str, value: Value) {
        if !self.extra_info.is_object() {
            self.extra_info = json!({});
        }
        if let Some(map) = self.extra_info.as_object_mut() {
            map.insert(key.to_owned(), value);
        }
    }
}

/// Run judge futures in parallel under `semaphore`, replacing each failure
/// with the safe default for the workload.
///
/// Results come back in task order (not completion order) so callers can
/// zip them against their inputs.
pub async fn gather_scored<Fut>(
    semaphore: Arc<Semaphore>,
    label: &str,
    safe_score: f64,
    tasks: Vec<Fut>,
) -> Vec<Scored>
where
    Fut: Future<Output = Result<Scored>>,
{
    let handles = tasks.into_iter().map(|task| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            // A closed semaphore cannot happen here; treat it as a failure
            // like any other so the safe default applies.
            match semaphore.acquire_owned().await {
                Ok(_permit) => task.await,
                Err(e) => Err(crate::error::Error::internal(e.to_string())),
            }
        }
    });

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(scored) => scored,
            Err(e) => {
                tracing::error!(judge = label, error = %e, safe_score, "judge failed; using safe default");
                Scored::safe(safe_score, e.to_string())
            }
        })
        .collect()
}

/// Arithmetic mean; `None` on an empty slice.
#[must_use]
pub fn mean_scores(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Strict-majority boolean vote: true wins only with more true than false
/// votes.
#[must_use]
pub fn majority_vote(votes: &[bool]) -> bool {
    let trues = votes.iter().filter(|v| **v).count();
    trues > votes.len() - trues
}

/// Back-translation agreement: two chains match iff equal length and equal
/// tool-for-tool.
#[must_use]
pub fn chains_match(expected: &[String], produced: &[String]) -> bool {
    expected.len() == produced.len() && expected.iter().zip(produced).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn failures_become_safe_defaults_in_order() {
        let semaphore = Arc::new(Semaphore::new(2));
        let tasks: Vec<_> = (0..4)
            .map(|i| async move {
                if i == 2 {
                    Err(Error::internal("judge crashed"))
                } else {
                    Ok(Scored::new(f64::from(i)))
                }
            })
            .collect();

        let scores = gather_scored(semaphore, "test", 1.0, tasks).await;
        assert_eq!(scores.len(), 4);
        assert_eq!(scores[0].score, 0.0);
        assert_eq!(scores[1].score, 1.0);
        assert!(scores[2].is_safe());
        assert_eq!(scores[2].score, 1.0);
        assert_eq!(scores[3].score, 3.0);
    }

    #[test]
    fn mean_and_majority() {
        assert_eq!(mean_scores(&[1.0, 0.0, 1.0, 1.0]), Some(0.75));
        assert_eq!(mean_scores(&[]), None);
        assert!(majority_vote(&[true, true, false]));
        assert!(!majority_vote(&[true, false]));
        assert!(!majority_vote(&[]));
    }

    #[test]
    fn chain_match_is_positional() {
        let a = vec!["search".to_owned(), "fetch".to_owned()];
        let b = vec!["search".to_owned(), "fetch".to_owned()];
        let c = vec!["fetch".to_owned(), "search".to_owned()];
        assert!(chains_match(&a, &b));
        assert!(!chains_match(&a, &c));
        assert!(!chains_match(&a, &a[..1].to_vec()));
    }
}
