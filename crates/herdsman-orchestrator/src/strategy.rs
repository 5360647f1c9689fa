//! Recovery strategy selection.

use std::collections::{BTreeMap, HashMap};

use herdsman_core::{ErrorKind, RecoveryStep};

/// Named, ordered list of recovery steps for one error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStrategy {
    pub name: String,
    pub kind: ErrorKind,
    pub steps: Vec<RecoveryStep>,
}

/// Built-in steps for each kind.
pub fn default_steps(kind: ErrorKind) -> Vec<RecoveryStep> {
    use RecoveryStep::*;
    match kind {
        ErrorKind::ResourceExhaustion => vec![Cleanup, RestartWorker],
        ErrorKind::ConnectivityFailure => vec![Reconnect, RestartWorker],
        ErrorKind::DeadlineExceeded => vec![CancelOperations, Backoff, RestartWorker],
        ErrorKind::AccessDenied => vec![NotifyOperator, Reconnect],
        ErrorKind::MalformedOperation => vec![VerifyIntegrity, RestartWorker],
        ErrorKind::Unclassified => vec![Backoff, RestartWorker],
    }
}

fn strategy_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::ResourceExhaustion => "resource-recovery",
        ErrorKind::ConnectivityFailure => "connectivity-recovery",
        ErrorKind::DeadlineExceeded => "deadline-recovery",
        ErrorKind::AccessDenied => "access-recovery",
        ErrorKind::MalformedOperation => "operation-recovery",
        ErrorKind::Unclassified => "generic-fallback",
    }
}

/// Maps every error kind to a non-empty strategy.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    table: HashMap<ErrorKind, RecoveryStrategy>,
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::with_overrides(&BTreeMap::new())
    }
}

impl StrategySelector {
    /// Built-in table with some kinds' steps replaced. Empty overrides are
    /// ignored so no kind is ever left without steps.
    pub fn with_overrides(overrides: &BTreeMap<ErrorKind, Vec<RecoveryStep>>) -> Self {
        let table = ErrorKind::ALL
            .into_iter()
            .map(|kind| {
                let steps = overrides
                    .get(&kind)
                    .filter(|steps| !steps.is_empty())
                    .cloned()
                    .unwrap_or_else(|| default_steps(kind));
                let strategy = RecoveryStrategy {
                    name: strategy_name(kind).to_string(),
                    kind,
                    steps,
                };
                (kind, strategy)
            })
            .collect();
        Self { table }
    }

    /// Strategy for `kind`, falling back to the `Unclassified` strategy.
    pub fn select(&self, kind: ErrorKind) -> RecoveryStrategy {
        self.table
            .get(&kind)
            .or_else(|| self.table.get(&ErrorKind::Unclassified))
            .cloned()
            .unwrap_or_else(|| RecoveryStrategy {
                name: strategy_name(ErrorKind::Unclassified).to_string(),
                kind,
                steps: default_steps(ErrorKind::Unclassified),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_steps() {
        let selector = StrategySelector::default();
        for kind in ErrorKind::ALL {
            let strategy = selector.select(kind);
            assert_eq!(strategy.kind, kind);
            assert!(!strategy.steps.is_empty(), "{kind} has no steps");
        }
    }

    #[test]
    fn test_default_table() {
        let selector = StrategySelector::default();
        assert_eq!(
            selector.select(ErrorKind::ResourceExhaustion).steps,
            vec![RecoveryStep::Cleanup, RecoveryStep::RestartWorker]
        );
        assert_eq!(
            selector.select(ErrorKind::MalformedOperation).steps,
            vec![RecoveryStep::VerifyIntegrity, RecoveryStep::RestartWorker]
        );
        assert_eq!(selector.select(ErrorKind::Unclassified).name, "generic-fallback");
    }

    #[test]
    fn test_overrides_replace_steps() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ErrorKind::AccessDenied, vec![RecoveryStep::Backoff]);
        overrides.insert(ErrorKind::DeadlineExceeded, Vec::new());
        let selector = StrategySelector::with_overrides(&overrides);

        assert_eq!(
            selector.select(ErrorKind::AccessDenied).steps,
            vec![RecoveryStep::Backoff]
        );
        assert_eq!(
            selector.select(ErrorKind::DeadlineExceeded).steps,
            default_steps(ErrorKind::DeadlineExceeded)
        );
    }
}
