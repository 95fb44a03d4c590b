use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::errors::TallyError;

/// Identifier of a record. Temporary ids are handed out before the first
/// save; permanent ids are SQLite row ids assigned by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordId {
    Temp(u64),
    Permanent(i64),
}

impl RecordId {
    pub fn is_temp(&self) -> bool {
        matches!(self, RecordId::Temp(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, RecordId::Permanent(_))
    }

    /// Row id for persisted records, `None` for staged ones.
    pub fn permanent(&self) -> Option<i64> {
        match self {
            RecordId::Permanent(id) => Some(*id),
            RecordId::Temp(_) => None,
        }
    }

    /// Both namespaces start at 1; zero or negative values never come out of
    /// the engine or the store.
    pub fn is_valid(&self) -> bool {
        match self {
            RecordId::Temp(id) => *id > 0,
            RecordId::Permanent(id) => *id > 0,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Temp(id) => write!(f, "tmp-{}", id),
            RecordId::Permanent(id) => write!(f, "p-{}", id),
        }
    }
}

impl FromStr for RecordId {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TallyError::InvalidId(s.to_string());
        if let Some(raw) = s.strip_prefix("tmp-") {
            raw.parse().map(RecordId::Temp).map_err(|_| invalid())
        } else if let Some(raw) = s.strip_prefix("p-") {
            raw.parse().map(RecordId::Permanent).map_err(|_| invalid())
        } else {
            Err(invalid())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Active,
    Archived,
}

/// Domain fields of an inventory record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub name: String,
    pub barcode: String,
    pub image: String,
    pub location: String,
    pub qty: i64,
    pub notes: String,
    pub status: RecordStatus,
}

impl RecordFields {
    /// Overwrite every field present in `patch`.
    pub fn apply(&mut self, patch: &RecordPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(barcode) = &patch.barcode {
            self.barcode = barcode.clone();
        }
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(location) = &patch.location {
            self.location = location.clone();
        }
        if let Some(qty) = patch.qty {
            self.qty = qty;
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }

    pub fn merged(mut self, patch: &RecordPatch) -> Self {
        self.apply(patch);
        self
    }
}

/// Partial update of a record: `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.barcode.is_none()
            && self.image.is_none()
            && self.location.is_none()
            && self.qty.is_none()
            && self.notes.is_none()
            && self.status.is_none()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn qty(mut self, qty: i64) -> Self {
        self.qty = Some(qty);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl From<RecordFields> for RecordPatch {
    fn from(fields: RecordFields) -> Self {
        Self {
            name: Some(fields.name),
            barcode: Some(fields.barcode),
            image: Some(fields.image),
            location: Some(fields.location),
            qty: Some(fields.qty),
            notes: Some(fields.notes),
            status: Some(fields.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: RecordFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// A blank record staged under a temporary id.
    pub fn pending(temp_id: u64) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::Temp(temp_id),
            fields: RecordFields::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: &RecordPatch) {
        self.fields.apply(patch);
        self.updated_at = Utc::now();
    }

    pub fn display_name(&self) -> &str {
        if self.fields.name.is_empty() {
            "Untitled"
        } else {
            &self.fields.name
        }
    }
}

/// Kind of local change waiting in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub seq: i64,
    pub record_id: i64,
    pub operation: SyncOperation,
    pub queued_at: DateTime<Utc>,
    /// Creation time of the record, stamped on deletions.
    pub record_created_at: Option<DateTime<Utc>>,
}
