//! Recovery counters. Every internally recovered fault is counted here and
//! mirrored to the `metrics` facade, so whichever recorder the host process
//! installs can export it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// Malformed numeric input replaced with a safe default.
    InvalidInput,
    /// Singular/non-finite model state reset to its prior.
    NumericInstability,
}

impl RecoveryKind {
    pub fn metric_name(self) -> &'static str {
        match self {
            RecoveryKind::InvalidInput => "optimizer.recovery.invalid_input",
            RecoveryKind::NumericInstability => "optimizer.recovery.numeric_instability",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub invalid_input: u64,
    pub numeric_instability: u64,
}

impl RecoverySnapshot {
    pub fn total(&self) -> u64 {
        self.invalid_input + self.numeric_instability
    }
}

#[derive(Debug, Default)]
pub struct RecoveryTelemetry {
    invalid_input: AtomicU64,
    numeric_instability: AtomicU64,
}

impl RecoveryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: RecoveryKind) {
        self.record_n(kind, 1);
    }

    pub fn record_n(&self, kind: RecoveryKind, count: u64) {
        if count == 0 {
            return;
        }
        let counter = match kind {
            RecoveryKind::InvalidInput => &self.invalid_input,
            RecoveryKind::NumericInstability => &self.numeric_instability,
        };
        counter.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(kind.metric_name()).increment(count);
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            invalid_input: self.invalid_input.load(Ordering::Relaxed),
            numeric_instability: self.numeric_instability.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_kind() {
        let telemetry = RecoveryTelemetry::new();
        telemetry.record(RecoveryKind::InvalidInput);
        telemetry.record_n(RecoveryKind::InvalidInput, 2);
        telemetry.record(RecoveryKind::NumericInstability);
        telemetry.record_n(RecoveryKind::NumericInstability, 0);

        let snap = telemetry.snapshot();
        assert_eq!(snap.invalid_input, 3);
        assert_eq!(snap.numeric_instability, 1);
        assert_eq!(snap.total(), 4);
    }
}
