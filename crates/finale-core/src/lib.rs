//! Core domain model for the Finale trail status sync.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "finale-core";

/// Open/closed state of a trail as published by the status source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrailStatus {
    Open,
    Closed,
}

impl TrailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for TrailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown trail status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for TrailStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("open") {
            Ok(Self::Open)
        } else if trimmed.eq_ignore_ascii_case("closed") {
            Ok(Self::Closed)
        } else {
            Err(UnknownStatus(trimmed.to_string()))
        }
    }
}

/// One status/title pair scraped from the listing, keyed by the display name
/// exactly as it appeared in the markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedStatusEntry {
    pub name: String,
    pub status: TrailStatus,
}

/// Read-only projection of a trail record from the trail store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTrail {
    pub id: String,
    pub name: String,
    pub full_name: Option<String>,
    /// `None` when the trail has no status history yet.
    pub current_status: Option<TrailStatus>,
}

impl CanonicalTrail {
    /// Display name as used for matching: surrounding whitespace ignored,
    /// the same as [`CanonicalTrail::full_name`].
    pub fn name_key(&self) -> &str {
        self.name.trim()
    }

    /// Full name, ignoring absent or blank values.
    pub fn full_name(&self) -> Option<&str> {
        self.full_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Status-history row for one trail on one calendar day.
/// `(trail_id, as_of_date)` is the natural key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRecord {
    pub trail_id: String,
    pub new_status: TrailStatus,
    pub as_of_date: NaiveDate,
    pub note: String,
}

/// Operator-facing description of a status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub trail_name: String,
    pub previous_status: Option<TrailStatus>,
    pub new_status: TrailStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Open".parse::<TrailStatus>().unwrap(), TrailStatus::Open);
        assert_eq!(" closed ".parse::<TrailStatus>().unwrap(), TrailStatus::Closed);
        assert_eq!("OPEN".parse::<TrailStatus>().unwrap(), TrailStatus::Open);
        assert!("Maybe".parse::<TrailStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_store_text() {
        assert_eq!(serde_json::to_string(&TrailStatus::Closed).unwrap(), "\"Closed\"");
        assert_eq!(TrailStatus::Open.to_string(), "Open");
    }

    #[test]
    fn blank_full_name_is_treated_as_absent() {
        let mut trail = CanonicalTrail {
            id: "t1".into(),
            name: "Lupo".into(),
            full_name: Some("   ".into()),
            current_status: None,
        };
        assert_eq!(trail.full_name(), None);
        trail.full_name = Some("12 / Lupo Enduro".into());
        assert_eq!(trail.full_name(), Some("12 / Lupo Enduro"));
    }

    #[test]
    fn name_and_full_name_ignore_surrounding_whitespace() {
        let trail = CanonicalTrail {
            id: "t1".into(),
            name: " Lupo\t".into(),
            full_name: Some("  12 / Lupo Enduro ".into()),
            current_status: None,
        };
        assert_eq!(trail.name_key(), "Lupo");
        assert_eq!(trail.full_name(), Some("12 / Lupo Enduro"));
    }
}
