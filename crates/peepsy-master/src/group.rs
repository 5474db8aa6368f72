//! Load-balancing groups.
//!
//! A group is an ordered list of targets sharing a strategy and an
//! optional group-wide concurrency cap. Strategy names are never
//! validated at configuration time; an unrecognized one is kept and only
//! fails when a dispatch first asks it to pick a target, so a later
//! `configure_group` can repair the group.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;

use peepsy_proto::PeepsyError;

use crate::master::SendResult;

/// Target selection strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Cycle through targets in order. The cursor persists across
    /// membership changes and wraps on the current length.
    RoundRobin,
    /// Uniform random member.
    Random,
    /// Fewest active requests wins; ties break by list position.
    LeastBusy,
    /// Preserved verbatim; fails at selection time.
    Unknown(String),
}

impl Strategy {
    pub fn parse(name: &str) -> Self {
        match name {
            "round-robin" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            "least-busy" => Strategy::LeastBusy,
            other => Strategy::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
            Strategy::LeastBusy => "least-busy",
            Strategy::Unknown(name) => name,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Partial group configuration; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub strategy: Option<Strategy>,
    pub max_concurrency: Option<usize>,
    pub disable_auto_restart: Option<bool>,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_disable_auto_restart(mut self, disable: bool) -> Self {
        self.disable_auto_restart = Some(disable);
        self
    }
}

/// Resolved settings a group runs with.
#[derive(Debug, Clone)]
pub(crate) struct GroupSettings {
    pub strategy: Strategy,
    pub max_concurrency: Option<usize>,
    pub disable_auto_restart: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            max_concurrency: None,
            disable_auto_restart: false,
        }
    }
}

/// A send parked because the group was at its concurrency cap.
pub(crate) struct PendingSend {
    pub action: String,
    pub data: Option<Value>,
    pub timeout: Duration,
    pub resolver: oneshot::Sender<Result<SendResult, PeepsyError>>,
    pub enqueued_at: Instant,
}

pub(crate) struct Group {
    pub targets: Vec<String>,
    cursor: usize,
    pub settings: GroupSettings,
    pub pending: VecDeque<PendingSend>,
}

impl Group {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            cursor: 0,
            settings: GroupSettings::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn apply(&mut self, config: &GroupConfig) {
        if let Some(strategy) = &config.strategy {
            self.settings.strategy = strategy.clone();
        }
        if let Some(max) = config.max_concurrency {
            self.settings.max_concurrency = Some(max);
        }
        if let Some(disable) = config.disable_auto_restart {
            self.settings.disable_auto_restart = disable;
        }
    }

    pub fn add_target(&mut self, target: &str) {
        if !self.targets.iter().any(|t| t == target) {
            self.targets.push(target.to_string());
        }
    }

    /// Remove a target from the member list; returns whether the group is
    /// now empty (and should be deleted).
    pub fn remove_target(&mut self, target: &str) -> bool {
        self.targets.retain(|t| t != target);
        self.targets.is_empty()
    }

    /// Pick a target per the configured strategy. `active_of` reports a
    /// member's current in-flight count for least-busy.
    pub fn select(&mut self, active_of: &dyn Fn(&str) -> u64) -> Result<String, PeepsyError> {
        if self.targets.is_empty() {
            return Err(PeepsyError::not_found("Group has no targets"));
        }
        let n = self.targets.len();
        match &self.settings.strategy {
            Strategy::RoundRobin => {
                let idx = self.cursor % n;
                self.cursor = self.cursor.wrapping_add(1);
                Ok(self.targets[idx].clone())
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..n);
                Ok(self.targets[idx].clone())
            }
            Strategy::LeastBusy => {
                let mut best = &self.targets[0];
                let mut best_active = active_of(best);
                for target in &self.targets[1..] {
                    let active = active_of(target);
                    if active < best_active {
                        best = target;
                        best_active = active;
                    }
                }
                Ok(best.clone())
            }
            Strategy::Unknown(name) => Err(PeepsyError::new(format!(
                "Unknown load balancing strategy: {}",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(targets: &[&str]) -> Group {
        let mut group = Group::new();
        for t in targets {
            group.add_target(t);
        }
        group
    }

    #[test]
    fn round_robin_cycles_and_wraps() {
        let mut group = group_with(&["a", "b", "c"]);
        let picks: Vec<String> = (0..6).map(|_| group.select(&|_| 0).unwrap()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_cursor_survives_membership_change() {
        let mut group = group_with(&["a", "b", "c"]);
        group.select(&|_| 0).unwrap();
        group.select(&|_| 0).unwrap();
        group.remove_target("c");
        // Cursor is at 2; on the shrunk list it wraps instead of resetting.
        assert_eq!(group.select(&|_| 0).unwrap(), "a");
        assert_eq!(group.select(&|_| 0).unwrap(), "b");
    }

    #[test]
    fn least_busy_prefers_idle_then_list_order() {
        let mut group = group_with(&["a", "b"]);
        let pick = group.select(&|t| if t == "a" { 2 } else { 0 }).unwrap();
        assert_eq!(pick, "b");
        // Tie goes to the earlier list position.
        let pick = group.select(&|_| 1).unwrap();
        assert_eq!(pick, "a");
    }

    #[test]
    fn random_stays_in_bounds() {
        let mut group = group_with(&["a", "b"]);
        group.settings.strategy = Strategy::Random;
        for _ in 0..50 {
            let pick = group.select(&|_| 0).unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[test]
    fn unknown_strategy_fails_only_at_selection() {
        let mut group = group_with(&["a"]);
        group.apply(&GroupConfig::new().with_strategy(Strategy::parse("weighted")));
        let err = group.select(&|_| 0).expect_err("selection must fail");
        assert!(err.message().contains("Unknown load balancing strategy: weighted"));
    }

    #[test]
    fn empty_group_is_not_found() {
        let mut group = Group::new();
        assert!(group.select(&|_| 0).unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut group = group_with(&["a"]);
        group.add_target("a");
        assert_eq!(group.targets.len(), 1);
        assert!(group.remove_target("a"));
    }
}
