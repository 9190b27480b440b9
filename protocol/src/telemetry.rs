//! Per-phase model-call telemetry.
//!
//! The orchestrator owns a [`TelemetryAccumulator`] and forwards every model
//! call to a [`TelemetrySink`]. Two sinks ship with the crate:
//! - [`NoOpTelemetrySink`]: drops everything
//! - [`JsonlTelemetrySink`]: append-only `.jsonl` log, one call per line

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::escalation::ModelTier;
use crate::phase::ProtocolPhase;

/// Metrics for a single model call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCallMetrics {
    pub tier: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration_ms: u64,
}

/// Aggregated counters for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTelemetry {
    pub model_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model_ms: u64,
    #[serde(default)]
    pub calls_by_tier: BTreeMap<ModelTier, u32>,
    pub failures: u32,
    pub escalations: u32,
    pub circuit_breaks: u32,
}

/// Point-in-time copy of the accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub phases: BTreeMap<ProtocolPhase, PhaseTelemetry>,
    pub elapsed_ms: u64,
}

impl TelemetrySnapshot {
    pub fn total_model_calls(&self) -> u32 {
        self.phases.values().map(|p| p.model_calls).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.phases
            .values()
            .map(|p| p.prompt_tokens + p.completion_tokens)
            .sum()
    }
}

/// Accumulates telemetry for the lifetime of one orchestrator.
#[derive(Debug)]
pub struct TelemetryAccumulator {
    phases: BTreeMap<ProtocolPhase, PhaseTelemetry>,
    started: Instant,
}

impl Default for TelemetryAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryAccumulator {
    pub fn new() -> Self {
        Self {
            phases: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    fn phase_mut(&mut self, phase: ProtocolPhase) -> &mut PhaseTelemetry {
        self.phases.entry(phase).or_default()
    }

    pub fn record_model_call(&mut self, phase: ProtocolPhase, metrics: &ModelCallMetrics) {
        let entry = self.phase_mut(phase);
        entry.model_calls += 1;
        entry.prompt_tokens += u64::from(metrics.prompt_tokens);
        entry.completion_tokens += u64::from(metrics.completion_tokens);
        entry.model_ms += metrics.duration_ms;
        *entry.calls_by_tier.entry(metrics.tier).or_insert(0) += 1;
    }

    pub fn record_failure(&mut self, phase: ProtocolPhase) {
        self.phase_mut(phase).failures += 1;
    }

    pub fn record_escalation(&mut self, phase: ProtocolPhase) {
        self.phase_mut(phase).escalations += 1;
    }

    pub fn record_circuit_break(&mut self, phase: ProtocolPhase) {
        self.phase_mut(phase).circuit_breaks += 1;
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            phases: self.phases.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn reset(&mut self) {
        self.phases.clear();
        self.started = Instant::now();
    }
}

/// Destination for per-call telemetry.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, phase: ProtocolPhase, metrics: &ModelCallMetrics);
}

/// Sink that discards everything.
pub struct NoOpTelemetrySink;

impl TelemetrySink for NoOpTelemetrySink {
    fn record(&self, _phase: ProtocolPhase, _metrics: &ModelCallMetrics) {}
}

#[derive(Serialize)]
struct TelemetryLine<'a> {
    timestamp: String,
    phase: ProtocolPhase,
    #[serde(flatten)]
    metrics: &'a ModelCallMetrics,
}

/// Appends one JSON object per model call to a file.
///
/// Write failures are logged and otherwise ignored.
pub struct JsonlTelemetrySink {
    path: PathBuf,
}

impl JsonlTelemetrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlTelemetrySink {
    fn record(&self, phase: ProtocolPhase, metrics: &ModelCallMetrics) {
        let line = TelemetryLine {
            timestamp: chrono::Utc::now().to_rfc3339(),
            phase,
            metrics,
        };
        match serde_json::to_string(&line) {
            Ok(json) => {
                use std::io::Write;
                match std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                {
                    Ok(mut file) => {
                        if let Err(e) = writeln!(file, "{json}") {
                            warn!("Failed to append telemetry: {e}");
                        } else {
                            debug!(path = %self.path.display(), %phase, "Appended model call telemetry");
                        }
                    }
                    Err(e) => warn!("Failed to open telemetry file: {e}"),
                }
            }
            Err(e) => warn!("Failed to serialize telemetry: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(tier: ModelTier, prompt: u32, completion: u32) -> ModelCallMetrics {
        ModelCallMetrics {
            tier,
            model: None,
            prompt_tokens: prompt,
            completion_tokens: completion,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_accumulates_per_phase() {
        let mut acc = TelemetryAccumulator::new();
        acc.record_model_call(ProtocolPhase::Ignition, &call(ModelTier::Worker, 100, 50));
        acc.record_model_call(ProtocolPhase::Ignition, &call(ModelTier::Fallback, 10, 5));
        acc.record_model_call(ProtocolPhase::Lattice, &call(ModelTier::Worker, 1, 1));
        acc.record_failure(ProtocolPhase::Lattice);
        acc.record_escalation(ProtocolPhase::Lattice);

        let snap = acc.snapshot();
        let ignition = &snap.phases[&ProtocolPhase::Ignition];
        assert_eq!(ignition.model_calls, 2);
        assert_eq!(ignition.prompt_tokens, 110);
        assert_eq!(ignition.calls_by_tier[&ModelTier::Fallback], 1);
        assert_eq!(snap.phases[&ProtocolPhase::Lattice].failures, 1);
        assert_eq!(snap.total_model_calls(), 3);
        assert_eq!(snap.total_tokens(), 167);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut acc = TelemetryAccumulator::new();
        acc.record_circuit_break(ProtocolPhase::Injection);
        acc.reset();
        assert!(acc.snapshot().phases.is_empty());
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlTelemetrySink::new(dir.path().join("telemetry.jsonl"));
        sink.record(ProtocolPhase::Ignition, &call(ModelTier::Worker, 3, 4));
        sink.record(ProtocolPhase::Lattice, &call(ModelTier::Architect, 5, 6));

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["phase"], "lattice");
        assert_eq!(second["tier"], "architect");
        assert_eq!(second["completion_tokens"], 6);
    }
}
