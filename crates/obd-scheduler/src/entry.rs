//! Polling entries and priority tiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority tier; the period is the number of cycles between polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Every cycle
    High,
    /// Every 3rd cycle
    Medium,
    /// Every 10th cycle
    Low,
}

impl Tier {
    pub fn period(&self) -> u64 {
        match self {
            Tier::High => 1,
            Tier::Medium => 3,
            Tier::Low => 10,
        }
    }

    /// Whether a PID in this tier is polled on `cycle` (1-based)
    pub fn is_due(&self, cycle: u64) -> bool {
        cycle % self.period() == 0
    }
}

/// A registered PID and its polling state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingEntry {
    pub pid: u8,
    /// Configured tier
    pub tier: Tier,
    /// Temporary promotion, active while the cycle count is below `override_until`
    pub override_tier: Option<Tier>,
    pub override_until: u64,
    pub last_value: Option<f64>,
    pub last_polled: Option<DateTime<Utc>>,
}

impl PollingEntry {
    pub fn new(pid: u8, tier: Tier) -> Self {
        Self {
            pid,
            tier,
            override_tier: None,
            override_until: 0,
            last_value: None,
            last_polled: None,
        }
    }

    /// Tier in force on `cycle`
    pub fn effective_tier(&self, cycle: u64) -> Tier {
        match self.override_tier {
            Some(tier) if cycle < self.override_until => tier,
            _ => self.tier,
        }
    }

    pub fn is_due(&self, cycle: u64) -> bool {
        self.effective_tier(cycle).is_due(cycle)
    }

    /// Promote to `tier` for the cycles before `until`
    pub fn promote(&mut self, tier: Tier, until: u64) {
        self.override_tier = Some(tier);
        self.override_until = until;
    }

    pub fn clear_override(&mut self) {
        self.override_tier = None;
        self.override_until = 0;
    }
}

/// Per-PID poll statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PollStats {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    /// Rolling mean over successful polls
    pub average_latency_ms: f64,
}

impl PollStats {
    pub(crate) fn record_success(&mut self, latency_ms: f64) {
        self.total_polls += 1;
        self.successful_polls += 1;
        let n = self.successful_polls as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_polls += 1;
        self.failed_polls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polls(tier: Tier, cycles: u64) -> usize {
        let entry = PollingEntry::new(0x0C, tier);
        (1..=cycles).filter(|&c| entry.is_due(c)).count()
    }

    #[test]
    fn test_tier_periods() {
        assert_eq!(polls(Tier::High, 7), 7);
        assert_eq!(polls(Tier::Medium, 9), 3);
        assert_eq!(polls(Tier::Low, 20), 2);
    }

    #[test]
    fn test_override_expires_by_cycle() {
        let mut entry = PollingEntry::new(0x0C, Tier::Low);
        entry.promote(Tier::High, 15);
        assert_eq!(entry.effective_tier(14), Tier::High);
        assert_eq!(entry.effective_tier(15), Tier::Low);
        assert!(entry.is_due(11));
        assert!(!entry.is_due(16));

        entry.clear_override();
        assert_eq!(entry.effective_tier(1), Tier::Low);
    }

    #[test]
    fn test_tier_ordering() {
        let mut tiers = vec![Tier::Low, Tier::High, Tier::Medium];
        tiers.sort();
        assert_eq!(tiers, vec![Tier::High, Tier::Medium, Tier::Low]);
    }
}
