//! Dining tables: listing and assignment to reservations.

use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::error::ReservationError;
use crate::gateway::{CallOptions, Gateway};
use crate::local_state::LocalState;
use crate::models::{EntityRef, Reservation, Table};
use crate::reservations::ReservationCoordinator;

/// Tables the reservation may be seated at: every available table, plus the
/// one it already holds.
pub fn selectable_tables<'a>(tables: &'a [Table], reservation: &Reservation) -> Vec<&'a Table> {
    let current = reservation.table_id();
    tables
        .iter()
        .filter(|t| t.is_available || current == Some(t.id.as_str()))
        .collect()
}

pub struct TableService {
    gateway: Arc<Gateway>,
    local: Arc<LocalState>,
    coordinator: Arc<ReservationCoordinator>,
}

impl TableService {
    pub fn new(
        gateway: Arc<Gateway>,
        local: Arc<LocalState>,
        coordinator: Arc<ReservationCoordinator>,
    ) -> Self {
        Self {
            gateway,
            local,
            coordinator,
        }
    }

    pub async fn fetch_tables(&self) -> Result<Vec<Table>, ReservationError> {
        let restaurant_id = self
            .local
            .restaurant_id()
            .ok_or(ReservationError::NoRestaurant)?;
        let tables = self
            .gateway
            .fetch_list(&format!("/tables/restaurant/{restaurant_id}"))
            .await?;
        Ok(tables)
    }

    /// Seat a reservation at a table from `tables` (as last fetched).
    pub async fn assign_table(
        &self,
        reservation_id: &str,
        table_id: &str,
        tables: &[Table],
    ) -> Result<Reservation, ReservationError> {
        let current = self
            .coordinator
            .reservation(reservation_id)
            .ok_or_else(|| ReservationError::UnknownReservation(reservation_id.to_string()))?;
        if current.table_id() == Some(table_id) {
            return Ok(current);
        }
        if !selectable_tables(tables, &current)
            .iter()
            .any(|t| t.id == table_id)
        {
            return Err(ReservationError::TableUnavailable(table_id.to_string()));
        }

        let table = table_id.to_string();
        let record = self
            .coordinator
            .mutate(
                &current,
                &format!("/reservations/{reservation_id}"),
                CallOptions::put(json!({ "tableId": table_id })),
                move |r| r.table = Some(EntityRef::Id(table)),
            )
            .await?;
        info!(reservation_id, table_id, "table assigned");
        Ok(record)
    }
}
