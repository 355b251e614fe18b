//! Liveness and readiness evaluation.
//!
//! Being leaderless is a normal transient state during elections, so it only degrades
//! readiness. Liveness fails only when the node actor is gone.

use std::fmt;

use serde::Serialize;

use crate::node::{NodeStatus, RoleKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Running, but not currently able to serve writes.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of one check, as served over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
}

pub fn liveness(running: bool) -> HealthReport {
    if running {
        HealthReport {
            status: HealthStatus::Healthy,
            message: "node is running".into(),
        }
    } else {
        HealthReport {
            status: HealthStatus::Unhealthy,
            message: "node is not running".into(),
        }
    }
}

/// Ready when this node leads or knows who does.
pub fn readiness(status: &NodeStatus) -> HealthReport {
    match (&status.role, &status.leader_id) {
        (RoleKind::Leader, _) => HealthReport {
            status: HealthStatus::Healthy,
            message: format!("leader for term {}", status.term),
        },
        (_, Some(leader)) => HealthReport {
            status: HealthStatus::Healthy,
            message: format!("following {leader} in term {}", status.term),
        },
        (role, None) => HealthReport {
            status: HealthStatus::Degraded,
            message: format!("{role} with no known leader in term {}", status.term),
        },
    }
}
