//! Roster document model.
//!
//! The synchronized unit is a single [`Document`]: the attendance roster plus
//! the public-view settings. Both halves travel either as plain JSON or as an
//! opaque sealed string (see [`Payload`]); which one depends on the
//! deployment's [`PayloadMode`].

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Columns of an [`AttendanceRecord`] that a public view may render.
pub const COLUMNS: &[&str] = &[
    "employeeId",
    "name",
    "kana",
    "group",
    "nationality",
    "attending",
    "checkedAt",
];

/// One person on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    /// Primary key, 1..=100 chars. Uniqueness is only checked client-side.
    pub employee_id: String,
    /// Display name, 1..=200 chars.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kana: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nationality: Option<String>,
    pub attending: bool,
    /// ISO-8601 timestamp of the last transition to attending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
}

impl AttendanceRecord {
    pub fn new(employee_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            employee_id: employee_id.into(),
            name: name.into(),
            kana: None,
            group: None,
            nationality: None,
            attending: false,
            checked_at: None,
        }
    }

    /// Mark the record attending or not.
    ///
    /// `checked_at` is stamped on the transition to attending and cleared on
    /// the transition away from it. Setting the current value again is a no-op.
    pub fn set_attending(&mut self, attending: bool, now: DateTime<Utc>) {
        if self.attending == attending {
            return;
        }
        self.attending = attending;
        self.checked_at = if attending {
            Some(now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        } else {
            None
        };
    }

    /// Whether the record checked in after `cutoff`, judged in `offset` local time.
    pub fn is_late(&self, cutoff: NaiveTime, offset: FixedOffset) -> bool {
        if !self.attending {
            return false;
        }
        let Some(raw) = self.checked_at.as_deref() else {
            return false;
        };
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => ts.with_timezone(&offset).time() > cutoff,
            Err(_) => false,
        }
    }
}

/// Ordered roster. Order is display order only.
pub type Roster = Vec<AttendanceRecord>;

/// True when no two records share an `employee_id`.
///
/// The hub accepts duplicates; editors call this before saving.
pub fn roster_has_unique_ids(roster: &[AttendanceRecord]) -> bool {
    let mut seen = HashSet::with_capacity(roster.len());
    roster.iter().all(|r| seen.insert(r.employee_id.as_str()))
}

/// Headline counts shown on the admin and public pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterStats {
    pub total: usize,
    pub attending: usize,
    pub not_attending: usize,
    pub late: usize,
}

impl RosterStats {
    pub fn compute(roster: &[AttendanceRecord], cutoff: NaiveTime, offset: FixedOffset) -> Self {
        let attending = roster.iter().filter(|r| r.attending).count();
        Self {
            total: roster.len(),
            attending,
            not_attending: roster.len() - attending,
            late: roster.iter().filter(|r| r.is_late(cutoff, offset)).count(),
        }
    }
}

/// Settings for the public-facing roster view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSettings {
    pub show_list: bool,
    #[serde(default)]
    pub public_columns: BTreeMap<String, bool>,
}

impl Default for PublicSettings {
    fn default() -> Self {
        let public_columns = COLUMNS
            .iter()
            .map(|c| (c.to_string(), matches!(*c, "name" | "group" | "attending")))
            .collect();
        Self {
            show_list: false,
            public_columns,
        }
    }
}

impl PublicSettings {
    /// Columns missing from the mapping are hidden.
    pub fn is_column_public(&self, column: &str) -> bool {
        self.public_columns.get(column).copied().unwrap_or(false)
    }
}

/// Whether document halves travel as plain JSON or as sealed strings.
///
/// Fixed per deployment; the two are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadMode {
    #[default]
    Plain,
    Sealed,
}

/// Either a plain value or an opaque encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload<T> {
    Sealed(String),
    Plain(T),
}

impl<T> Payload<T> {
    pub fn mode(&self) -> PayloadMode {
        match self {
            Payload::Plain(_) => PayloadMode::Plain,
            Payload::Sealed(_) => PayloadMode::Sealed,
        }
    }

    pub fn as_plain(&self) -> Option<&T> {
        match self {
            Payload::Plain(v) => Some(v),
            Payload::Sealed(_) => None,
        }
    }
}

/// The persisted unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub roster: Payload<Roster>,
    pub settings: Payload<PublicSettings>,
}

impl Document {
    /// The document as it exists before the first write.
    ///
    /// In sealed mode the halves are empty sealed strings, which clients read
    /// as "no value yet".
    pub fn empty(mode: PayloadMode) -> Self {
        match mode {
            PayloadMode::Plain => Self {
                roster: Payload::Plain(Vec::new()),
                settings: Payload::Plain(PublicSettings::default()),
            },
            PayloadMode::Sealed => Self {
                roster: Payload::Sealed(String::new()),
                settings: Payload::Sealed(String::new()),
            },
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty(PayloadMode::Plain)
    }
}
