//! Wire types exchanged with the backend.
//!
//! Field names follow the backend's camelCase JSON. Money arrives either as
//! a number or as a numeric string and is normalised to `f64`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Accept `12.5`, `"12.50"`, `null` or a missing field.
fn de_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// `null` decodes like a missing field.
fn de_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept `12`, `"12"` or `"T12"`.
fn de_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

/// Round to cents. Negative zero (an empty `sum()`) comes back as `0.0`.
pub fn round_cents(amount: f64) -> f64 {
    let rounded = (amount * 100.0).round() / 100.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Render an amount with two decimals.
pub fn format_amount(amount: f64) -> String {
    format!("{:.2}", round_cents(amount))
}

/// A reference that the backend sends either as a bare id or as an embedded
/// (populated) document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(String),
    Embedded(EmbeddedRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedRef {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<Value>,
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Embedded(doc) => &doc.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReservationStatus {
    #[default]
    #[serde(rename = "en attente")]
    Pending,
    #[serde(rename = "ouverte")]
    Open,
    #[serde(rename = "terminée")]
    Finished,
    #[serde(rename = "annulée")]
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "en attente",
            Self::Open => "ouverte",
            Self::Finished => "terminée",
            Self::Cancelled => "annulée",
            Self::Unknown => "unknown",
        }
    }

    /// Finished and cancelled reservations can never be active.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// UI-facing status derived from (`status`, `isPresent`). Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DisplayStatus {
    Pending,
    Present,
    Open,
    Closed,
    Cancelled,
}

impl DisplayStatus {
    pub const ALL: [DisplayStatus; 5] = [
        Self::Pending,
        Self::Present,
        Self::Open,
        Self::Closed,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Present => "present",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_or_default")]
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "de_or_default")]
    pub number_of_guests: u32,
    /// `YYYY-MM-DD`, possibly followed by an ISO time part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_date: Option<String>,
    /// `HH:MM`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allergies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_notes: Option<String>,
    #[serde(default, rename = "tableId", skip_serializing_if = "Option::is_none")]
    pub table: Option<EntityRef>,
    #[serde(default, rename = "serverId", skip_serializing_if = "Option::is_none")]
    pub server: Option<EntityRef>,
    #[serde(default, deserialize_with = "de_amount")]
    pub total_amount: f64,
    #[serde(default, deserialize_with = "de_amount")]
    pub paid_amount: f64,
    #[serde(default, deserialize_with = "de_or_default")]
    pub status: ReservationStatus,
    #[serde(default, deserialize_with = "de_or_default")]
    pub is_present: bool,
}

impl Reservation {
    pub fn display_status(&self) -> DisplayStatus {
        match self.status {
            ReservationStatus::Cancelled => DisplayStatus::Cancelled,
            ReservationStatus::Finished => DisplayStatus::Closed,
            ReservationStatus::Open => DisplayStatus::Open,
            ReservationStatus::Pending | ReservationStatus::Unknown => {
                if self.is_present {
                    DisplayStatus::Present
                } else {
                    DisplayStatus::Pending
                }
            }
        }
    }

    /// Combined reservation date and time. A missing time means midnight;
    /// an unparsable date yields `None`.
    pub fn scheduled_at(&self) -> Option<NaiveDateTime> {
        let raw_date = self.reservation_date.as_deref()?.trim();
        let date = NaiveDate::parse_from_str(raw_date.get(..10)?, "%Y-%m-%d").ok()?;
        let time = self
            .reservation_time
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .and_then(|t| {
                NaiveTime::parse_from_str(t, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
                    .ok()
            })
            .unwrap_or_default();
        Some(date.and_time(time))
    }

    pub fn table_id(&self) -> Option<&str> {
        self.table.as_ref().map(EntityRef::id)
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server.as_ref().map(EntityRef::id)
    }

    /// Balance still due, never negative.
    pub fn outstanding(&self) -> f64 {
        round_cents((self.total_amount - self.paid_amount).max(0.0))
    }
}

/// Free-text fields staff can edit on the active reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditableField {
    Notes,
    Allergies,
    Restrictions,
    StaffNotes,
}

impl EditableField {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::Allergies => "allergies",
            Self::Restrictions => "restrictions",
            Self::StaffNotes => "staffNotes",
        }
    }

    pub fn get(self, reservation: &Reservation) -> Option<&str> {
        match self {
            Self::Notes => reservation.notes.as_deref(),
            Self::Allergies => reservation.allergies.as_deref(),
            Self::Restrictions => reservation.restrictions.as_deref(),
            Self::StaffNotes => reservation.staff_notes.as_deref(),
        }
    }

    pub fn set(self, reservation: &mut Reservation, value: String) {
        let slot = match self {
            Self::Notes => &mut reservation.notes,
            Self::Allergies => &mut reservation.allergies,
            Self::Restrictions => &mut reservation.restrictions,
            Self::StaffNotes => &mut reservation.staff_notes,
        };
        *slot = Some(value);
    }
}

/// Payload for `POST /reservations`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReservation {
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub number_of_guests: u32,
    pub reservation_date: String,
    pub reservation_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allergies: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(rename = "productId")]
    pub product: EntityRef,
    #[serde(default, deserialize_with = "de_or_default")]
    pub name: String,
    #[serde(default, deserialize_with = "de_amount")]
    pub price: f64,
    #[serde(default, deserialize_with = "de_or_default")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl OrderItem {
    pub fn product_id(&self) -> &str {
        self.product.id()
    }

    pub fn line_total(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<EntityRef>,
    #[serde(default, deserialize_with = "de_or_default")]
    pub items: Vec<OrderItem>,
    #[serde(default, deserialize_with = "de_amount")]
    pub total: f64,
    #[serde(default, deserialize_with = "de_or_default")]
    pub status: String,
    #[serde(default, deserialize_with = "de_or_default")]
    pub is_paid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Tables and catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_label")]
    pub number: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "de_amount")]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_true")]
    pub is_available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allergen {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

fn default_true() -> bool {
    true
}
