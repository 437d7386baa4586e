//! Driver command metrics

use crate::error::ObdError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cumulative command statistics. Callers only ever see copies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverMetrics {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub timeouts: u64,
    /// Rolling mean over successful commands
    pub average_latency_ms: f64,
    pub last_command: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Negotiated protocol identifier, `auto` after fallback
    pub protocol_used: Option<String>,
}

impl DriverMetrics {
    pub(crate) fn record_success(&mut self, command: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.total_commands += 1;
        self.successful_commands += 1;
        let n = self.successful_commands as f64;
        self.average_latency_ms += (ms as f64 - self.average_latency_ms) / n;
        self.last_error = None;
        self.touch(command, ms);
    }

    pub(crate) fn record_failure(&mut self, command: &str, elapsed: Duration, error: &ObdError) {
        self.total_commands += 1;
        self.failed_commands += 1;
        if matches!(error, ObdError::Timeout { .. }) {
            self.timeouts += 1;
        }
        self.last_error = Some(error.to_string());
        self.touch(command, elapsed.as_millis() as u64);
    }

    pub(crate) fn record_link_error(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        self.last_updated_at = Some(Utc::now());
    }

    fn touch(&mut self, command: &str, ms: u64) {
        self.last_command = Some(command.to_string());
        self.last_duration_ms = Some(ms);
        self.last_updated_at = Some(Utc::now());
    }
}
