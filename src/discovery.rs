//! Discovery feed types.
//!
//! The discovery process reports robots as `{ name, ip, health }` records.
//! A robot is reachable when its health report is present and ok; anything
//! else triggers teardown of the corresponding connection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Health status reported by the discovery process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthStatus {
    Ok,
    NotOk,
    #[default]
    Unreachable,
}

impl HealthStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::NotOk => "notOk",
            HealthStatus::Unreachable => "unreachable",
        }
    }

    /// Parses a status from a string; anything unrecognized counts as
    /// unreachable.
    pub fn from_str(s: &str) -> Self {
        match s {
            "ok" => HealthStatus::Ok,
            "notOk" => HealthStatus::NotOk,
            _ => HealthStatus::Unreachable,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HealthStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HealthStatus::from_str(&s))
    }
}

/// Health report attached to a discovered robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Health {
    pub status: HealthStatus,
}

/// One entry of the discovery feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRobot {
    /// Logical robot identity; several IPs may report the same name.
    pub name: String,
    /// Network address at which the robot's broker is reachable.
    pub ip: String,
    /// Latest health report, if any.
    #[serde(default)]
    pub health: Option<Health>,
}

impl DiscoveredRobot {
    pub fn new(name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            health: None,
        }
    }

    /// Mark this robot as healthy.
    pub fn healthy(mut self) -> Self {
        self.health = Some(Health {
            status: HealthStatus::Ok,
        });
        self
    }

    /// A robot is reachable when a health report is present and ok.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self.health,
            Some(Health {
                status: HealthStatus::Ok
            })
        )
    }
}

/// The set of robot names currently reported reachable.
pub fn reachable_names(robots: &[DiscoveredRobot]) -> HashSet<&str> {
    robots
        .iter()
        .filter(|r| r.is_reachable())
        .map(|r| r.name.as_str())
        .collect()
}
