#![forbid(unsafe_code)]

use dq_core::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Dispatch,
    Backward,
    Policy,
    /// Lanes that took a normalize fallback during one launch.
    Degeneracy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only record of bridge-level decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count_kind(&self, kind: EvidenceKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    #[must_use]
    pub fn last_of_kind(&self, kind: EvidenceKind) -> Option<&EvidenceEntry> {
        self.entries.iter().rev().find(|entry| entry.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    /// Records a fallback count; launches without fallback lanes leave no
    /// entry.
    pub fn record_degenerate_lanes(&mut self, op: &str, pass: &str, lanes: usize) {
        if lanes == 0 {
            return;
        }
        self.ledger.record(
            EvidenceKind::Degeneracy,
            format!("op={op} pass={pass} degenerate_lanes={lanes} fallback=identity"),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use dq_core::ExecutionMode;

    use super::{EvidenceKind, RuntimeContext};

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Dispatch, "dispatch decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Dispatch);
        assert_eq!(ctx.ledger().count_kind(EvidenceKind::Policy), 1);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
        let last = ctx
            .ledger()
            .last_of_kind(EvidenceKind::Policy)
            .expect("policy entry should exist");
        assert!(last.summary.contains("Hardened"));
    }

    #[test]
    fn degenerate_lanes_are_recorded_only_when_present() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record_degenerate_lanes("quat_normalize", "forward", 0);
        assert_eq!(ctx.ledger().count_kind(EvidenceKind::Degeneracy), 0);

        ctx.record_degenerate_lanes("dual_normalize", "backward", 3);
        let entry = ctx
            .ledger()
            .last_of_kind(EvidenceKind::Degeneracy)
            .expect("degeneracy entry should exist");
        assert!(entry.summary.contains("op=dual_normalize"));
        assert!(entry.summary.contains("degenerate_lanes=3"));
    }
}
