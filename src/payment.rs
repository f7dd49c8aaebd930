//! Payment staging and the paid-items ledger.
//!
//! Orders of a reservation are flattened into payable lines. Each line is
//! identified by a fingerprint `productId-name-price-quantity`; two distinct
//! lines with the same product, name, price and quantity share a
//! fingerprint and are paid together. The ledger of paid fingerprints is
//! persisted per reservation through `LocalState`.
//!
//! `pay` stages the ledger update and commits it only once the backend has
//! accepted the new paid amount; on failure the ledger is left untouched.
//! Accepted payments are merged back into the coordinator, so the next
//! session starts from the amount the backend now holds.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StagingError;
use crate::gateway::{CallOptions, Gateway};
use crate::local_state::LocalState;
use crate::models::{round_cents, Order, OrderItem, Reservation, ReservationStatus};
use crate::reservations::ReservationCoordinator;

/// Amounts below half a cent count as settled.
const EPSILON: f64 = 0.005;

pub fn fingerprint(item: &OrderItem) -> String {
    format!(
        "{}-{}-{}-{}",
        item.product_id(),
        item.name,
        item.price,
        item.quantity
    )
}

/// Refuse to close a reservation that still owes money. A zero total also
/// needs an explicit override, since it usually means nothing was ordered.
pub fn ensure_settled(
    reservation: &Reservation,
    allow_zero_override: bool,
) -> Result<(), StagingError> {
    let outstanding = reservation.outstanding();
    if outstanding > EPSILON {
        return Err(StagingError::PaymentIncomplete { outstanding });
    }
    if reservation.total_amount.abs() < EPSILON && !allow_zero_override {
        return Err(StagingError::PaymentIncomplete { outstanding: 0.0 });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Set of paid fingerprints for one reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaidLedger {
    entries: BTreeSet<String>,
}

impl PaidLedger {
    pub fn load(local: &LocalState, reservation_id: &str) -> Self {
        Self {
            entries: local.paid_items(reservation_id),
        }
    }

    pub fn save(&self, local: &LocalState, reservation_id: &str) -> Result<(), StagingError> {
        local.save_paid_items(reservation_id, &self.entries)?;
        Ok(())
    }

    /// Returns whether the fingerprint was new.
    pub fn mark(&mut self, fingerprint: &str) -> bool {
        self.entries.insert(fingerprint.to_string())
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One order line, tagged with the order it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PayableItem {
    pub order_id: String,
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    pub fingerprint: String,
}

impl PayableItem {
    pub fn amount(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentOutcome {
    pub amount: f64,
    pub is_full_payment: bool,
    pub remaining_amount: f64,
}

pub struct PaymentSession {
    gateway: Arc<Gateway>,
    local: Arc<LocalState>,
    coordinator: Arc<ReservationCoordinator>,
    reservation_id: String,
    /// Cumulative amount paid, used when the coordinator no longer holds
    /// the reservation.
    paid_amount: f64,
    items: Vec<PayableItem>,
    ledger: PaidLedger,
    selection: BTreeSet<String>,
}

impl PaymentSession {
    pub fn new(
        gateway: Arc<Gateway>,
        local: Arc<LocalState>,
        coordinator: Arc<ReservationCoordinator>,
        reservation: &Reservation,
        orders: &[Order],
    ) -> Self {
        let ledger = PaidLedger::load(&local, &reservation.id);
        let mut session = Self {
            gateway,
            local,
            coordinator,
            reservation_id: reservation.id.clone(),
            paid_amount: reservation.paid_amount,
            items: Vec::new(),
            ledger,
            selection: BTreeSet::new(),
        };
        session.set_orders(orders);
        session
    }

    /// Replace the order list; the selection goes back to every unpaid line.
    pub fn set_orders(&mut self, orders: &[Order]) {
        self.items = orders
            .iter()
            .flat_map(|order| {
                order.items.iter().map(move |item| PayableItem {
                    order_id: order.id.clone(),
                    product_id: item.product_id().to_string(),
                    name: item.name.clone(),
                    price: item.price,
                    quantity: item.quantity,
                    fingerprint: fingerprint(item),
                })
            })
            .collect();
        self.reset_selection();
    }

    pub fn items(&self) -> &[PayableItem] {
        &self.items
    }

    pub fn ledger(&self) -> &PaidLedger {
        &self.ledger
    }

    pub fn is_paid(&self, fingerprint: &str) -> bool {
        self.ledger.contains(fingerprint)
    }

    pub fn unpaid_items(&self) -> impl Iterator<Item = &PayableItem> {
        self.items.iter().filter(|i| !self.ledger.contains(&i.fingerprint))
    }

    pub fn selection(&self) -> &BTreeSet<String> {
        &self.selection
    }

    pub fn reset_selection(&mut self) {
        self.selection = self
            .unpaid_items()
            .map(|i| i.fingerprint.clone())
            .collect();
    }

    /// Flip one unpaid line in or out of the selection. Paid or unknown
    /// fingerprints are ignored; returns whether the line is now selected.
    pub fn toggle_item(&mut self, fingerprint: &str) -> bool {
        if !self.unpaid_items().any(|i| i.fingerprint == fingerprint) {
            return false;
        }
        if self.selection.remove(fingerprint) {
            false
        } else {
            self.selection.insert(fingerprint.to_string());
            true
        }
    }

    /// Select every unpaid line, or clear the selection when all of them are
    /// already selected.
    pub fn toggle_all(&mut self) {
        let unpaid: BTreeSet<String> = self
            .unpaid_items()
            .map(|i| i.fingerprint.clone())
            .collect();
        if !unpaid.is_empty() && unpaid.is_subset(&self.selection) {
            self.selection.clear();
        } else {
            self.selection = unpaid;
        }
    }

    pub fn selected_amount(&self) -> f64 {
        round_cents(
            self.items
                .iter()
                .filter(|i| self.selection.contains(&i.fingerprint))
                .map(PayableItem::amount)
                .sum(),
        )
    }

    pub fn remaining_amount(&self) -> f64 {
        round_cents(self.unpaid_items().map(PayableItem::amount).sum())
    }

    /// Pay the selected lines.
    pub async fn pay(&mut self) -> Result<PaymentOutcome, StagingError> {
        if self.selection.is_empty() {
            return Err(StagingError::EmptySelection);
        }
        let amount = self.selected_amount();

        let mut staged = self.ledger.clone();
        for fp in &self.selection {
            staged.mark(fp);
        }
        let remaining_amount = round_cents(
            self.items
                .iter()
                .filter(|i| !staged.contains(&i.fingerprint))
                .map(PayableItem::amount)
                .sum(),
        );
        let is_full_payment = self.items.iter().all(|i| staged.contains(&i.fingerprint));

        let mut order_ids: Vec<&str> = Vec::new();
        for item in self
            .items
            .iter()
            .filter(|i| self.selection.contains(&i.fingerprint))
        {
            if !order_ids.contains(&item.order_id.as_str()) {
                order_ids.push(&item.order_id);
            }
        }
        for order_id in order_ids {
            let path = format!("/orders/{order_id}/mark-as-paid");
            match self.gateway.call(&path, CallOptions::post(json!({}))).await {
                Ok(_) => debug!(order_id, "order marked as paid"),
                Err(e) => warn!(order_id, error = %e, "failed to mark order as paid"),
            }
        }

        let already_paid = self
            .coordinator
            .reservation(&self.reservation_id)
            .map_or(self.paid_amount, |r| r.paid_amount);
        let paid_amount = round_cents(already_paid + amount);
        let status = if is_full_payment {
            ReservationStatus::Finished
        } else {
            ReservationStatus::Open
        };
        let path = format!("/reservations/{}/payment", self.reservation_id);
        let response = match self
            .gateway
            .call(
                &path,
                CallOptions::put(json!({ "paidAmount": paid_amount, "status": status.as_str() })),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    reservation_id = %self.reservation_id,
                    error = %e,
                    "payment update rejected, ledger left unchanged"
                );
                return Err(e.into());
            }
        };

        if is_full_payment {
            self.local.clear_paid_items(&self.reservation_id)?;
        } else {
            staged.save(&self.local, &self.reservation_id)?;
        }
        self.ledger = staged;
        self.paid_amount = paid_amount;
        self.selection.clear();
        self.coordinator
            .record_payment(&self.reservation_id, paid_amount, status, response)
            .await;

        info!(
            reservation_id = %self.reservation_id,
            amount,
            paid_amount,
            is_full_payment,
            "payment recorded"
        );
        Ok(PaymentOutcome {
            amount,
            is_full_payment,
            remaining_amount,
        })
    }
}
