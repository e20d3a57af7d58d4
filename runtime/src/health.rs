//! Health reporting for the pipeline.
//!
//! [`check_queue`] turns the queue's row counts into a [`HealthCheck`]:
//! abandoned leases mean a worker died or is stuck, and a backlog above the
//! configured threshold means the workers are not keeping up.

use crate::queue::EventQueue;
use chrono::{DateTime, Utc};
use std::fmt;

/// Health check status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but needs attention
    Degraded,
    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,
    /// Current health status
    pub status: HealthStatus,
    /// Optional message providing details
    pub message: Option<String>,
    /// Counters backing the status
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn new(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }
}

/// Aggregated health report.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status of all checks
    pub status: HealthStatus,
    /// Individual component checks
    pub checks: Vec<HealthCheck>,
    /// When the report was generated
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Combine checks into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp,
        }
    }
}

/// Check the queue.
///
/// Unhealthy if the store cannot be reached, degraded if any lease is
/// abandoned or more than `backlog_threshold` events are waiting.
pub async fn check_queue(queue: &EventQueue, backlog_threshold: u64) -> HealthCheck {
    match queue.stats().await {
        Ok(stats) => {
            let (status, message) = if stats.abandoned > 0 {
                (
                    HealthStatus::Degraded,
                    Some(format!("{} abandoned lease(s)", stats.abandoned)),
                )
            } else if stats.pending > backlog_threshold {
                (
                    HealthStatus::Degraded,
                    Some(format!("{} events waiting", stats.pending)),
                )
            } else {
                (HealthStatus::Healthy, None)
            };
            HealthCheck::new("event_queue", status, message)
                .with_metadata("pending", stats.pending)
                .with_metadata("processing", stats.processing)
                .with_metadata("abandoned", stats.abandoned)
                .with_metadata("archived", stats.archived)
        }
        Err(e) => HealthCheck::new("event_queue", HealthStatus::Unhealthy, Some(e.to_string())),
    }
}
