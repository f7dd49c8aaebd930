//! Dashboard: filter preference and activity summary.

use std::collections::BTreeMap;
use tracing::warn;

use crate::error::StoreError;
use crate::local_state::LocalState;
use crate::models::{round_cents, DisplayStatus, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DashboardFilter {
    #[default]
    All,
    Status(DisplayStatus),
}

impl DashboardFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Status(status) => status.as_str(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "all" => Some(Self::All),
            other => DisplayStatus::parse(other).map(Self::Status),
        }
    }

    pub fn matches(self, reservation: &Reservation) -> bool {
        match self {
            Self::All => true,
            Self::Status(status) => reservation.display_status() == status,
        }
    }
}

/// Stored filter; unknown values fall back to `All`.
pub fn load_filter(local: &LocalState) -> DashboardFilter {
    match local.dashboard_filter() {
        None => DashboardFilter::All,
        Some(raw) => DashboardFilter::parse(&raw).unwrap_or_else(|| {
            warn!(value = %raw, "unknown dashboard filter, using all");
            DashboardFilter::All
        }),
    }
}

pub fn save_filter(local: &LocalState, filter: DashboardFilter) -> Result<(), StoreError> {
    local.set_dashboard_filter(filter.as_str())
}

/// Reservations matching `filter`, earliest first. Undated ones go last.
pub fn filter_reservations(reservations: &[Reservation], filter: DashboardFilter) -> Vec<&Reservation> {
    let mut matching: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| filter.matches(r))
        .collect();
    matching.sort_by_key(|r| {
        let at = r.scheduled_at();
        (at.is_none(), at)
    });
    matching
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivitySummary {
    pub counts: BTreeMap<DisplayStatus, usize>,
    /// Party sizes of guests still to be seated (pending or present).
    pub expected_guests: u32,
    /// Balance still due on open reservations.
    pub outstanding: f64,
}

impl ActivitySummary {
    pub fn count(&self, status: DisplayStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

pub fn activity_summary(reservations: &[Reservation]) -> ActivitySummary {
    let mut summary = ActivitySummary::default();
    for status in DisplayStatus::ALL {
        summary.counts.insert(status, 0);
    }
    for r in reservations {
        let status = r.display_status();
        *summary.counts.entry(status).or_insert(0) += 1;
        match status {
            DisplayStatus::Pending | DisplayStatus::Present => {
                summary.expected_guests += r.number_of_guests;
            }
            DisplayStatus::Open => summary.outstanding += r.outstanding(),
            DisplayStatus::Closed | DisplayStatus::Cancelled => {}
        }
    }
    summary.outstanding = round_cents(summary.outstanding);
    summary
}
