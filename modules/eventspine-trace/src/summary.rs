//! Aggregate latency metrics over completed spans. Recomputed on every call.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::span::Span;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySummary {
    pub total_spans: usize,
    pub success_spans: usize,
    pub error_spans: usize,
    pub avg_duration_ms: f64,
    /// Element at sorted index `floor(n * 0.95)`.
    pub p95_duration_ms: i64,
    /// Completed span count per operation name.
    pub operations: BTreeMap<String, usize>,
}

impl TelemetrySummary {
    pub fn from_spans(spans: &[Span]) -> Self {
        let mut durations: Vec<i64> = spans.iter().filter_map(Span::duration_ms).collect();
        durations.sort_unstable();

        let mut operations = BTreeMap::new();
        for span in spans {
            *operations.entry(span.name.clone()).or_insert(0) += 1;
        }

        let error_spans = spans.iter().filter(|s| s.is_error()).count();

        Self {
            total_spans: spans.len(),
            success_spans: spans.len() - error_spans,
            error_spans,
            avg_duration_ms: mean(&durations),
            p95_duration_ms: p95(&durations),
            operations,
        }
    }
}

fn mean(durations: &[i64]) -> f64 {
    if durations.is_empty() {
        return 0.0;
    }
    durations.iter().sum::<i64>() as f64 / durations.len() as f64
}

/// `sorted` must be ascending.
fn p95(sorted: &[i64]) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
