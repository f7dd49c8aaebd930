//! Reservation Lifecycle Coordinator.
//!
//! Keeps the working set the UI renders: every known reservation, the
//! reservations pinned as tabs (`opened`), and the single active one with its
//! unsaved local edits, draft order and fetched orders.
//!
//! Full-list refreshes go through `reconcile`; single records (WebSocket
//! pushes, re-fetches, status transitions) go through `apply_snapshot`. Both
//! replace the stored record wholesale, so the last applied write wins.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RequestFailed, ReservationError};
use crate::gateway::{CallOptions, Gateway};
use crate::local_state::LocalState;
use crate::models::{
    format_amount, round_cents, EditableField, NewReservation, Order, Reservation,
    ReservationStatus,
};
use crate::orders::DraftOrder;

/// Clears its flag on drop; acquiring fails while another holder exists.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// New value for an editable field: a literal, or a function of the
/// current value.
pub enum FieldEdit {
    Set(String),
    Update(Box<dyn FnOnce(&str) -> String + Send>),
}

impl FieldEdit {
    pub fn update(f: impl FnOnce(&str) -> String + Send + 'static) -> Self {
        Self::Update(Box::new(f))
    }

    fn apply(self, previous: &str) -> String {
        match self {
            Self::Set(value) => value,
            Self::Update(f) => f(previous),
        }
    }
}

/// Local state tied to one active reservation id. Dropped as soon as the
/// active id changes.
#[derive(Debug, Clone, Default)]
struct ActiveView {
    id: String,
    edits: HashMap<EditableField, String>,
    draft: DraftOrder,
    orders: Vec<Order>,
    /// Total derived from `orders`, once fetched.
    total: Option<f64>,
}

impl ActiveView {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct WorkingSet {
    reservations: Vec<Reservation>,
    /// Ids, in backend order.
    opened: Vec<String>,
    active: Option<ActiveView>,
}

impl WorkingSet {
    fn find(&self, id: &str) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|view| view.id.as_str())
    }
}

/// Sum of `price × quantity` over every line of every order, in cents.
pub fn orders_total(orders: &[Order]) -> f64 {
    round_cents(
        orders
            .iter()
            .flat_map(|order| order.items.iter())
            .map(|item| item.line_total())
            .sum(),
    )
}

/// `orders_total` rendered with two decimals.
pub fn order_total(orders: &[Order]) -> String {
    format_amount(orders_total(orders))
}

/// Earliest present, pending reservation that is not already opened. Ties
/// keep input order; undated reservations come last.
pub fn next_arrival<'a>(reservations: &'a [Reservation], opened: &[String]) -> Option<&'a Reservation> {
    reservations
        .iter()
        .filter(|r| r.is_present && r.status == ReservationStatus::Pending)
        .filter(|r| !opened.contains(&r.id))
        .min_by_key(|r| {
            let at = r.scheduled_at();
            (at.is_none(), at)
        })
}

/// Extract a reservation record from a mutation response. Some endpoints
/// answer with the record, some wrap it, some send nothing.
fn record_from_response(value: Value) -> Result<Option<Reservation>, RequestFailed> {
    let candidate = match value {
        Value::Null => return Ok(None),
        Value::Object(mut map) => {
            if map.contains_key("_id") {
                Value::Object(map)
            } else if let Some(inner) = ["reservation", "data"]
                .iter()
                .find_map(|key| map.remove(*key).filter(|v| v.get("_id").is_some()))
            {
                inner
            } else {
                return Ok(None);
            }
        }
        other => {
            return Err(RequestFailed::UnexpectedShape(format!(
                "expected a reservation record, got {other}"
            )))
        }
    };
    serde_json::from_value(candidate)
        .map(Some)
        .map_err(|e| RequestFailed::Malformed(e.to_string()))
}

pub struct ReservationCoordinator {
    gateway: Arc<Gateway>,
    local: Arc<LocalState>,
    state: Mutex<WorkingSet>,
    /// One-shot: set once an active reservation has been picked (or given
    /// up) for this coordinator.
    auto_selected: AtomicBool,
    opening: AtomicBool,
}

impl ReservationCoordinator {
    pub fn new(gateway: Arc<Gateway>, local: Arc<LocalState>) -> Self {
        Self {
            gateway,
            local,
            state: Mutex::new(WorkingSet::default()),
            auto_selected: AtomicBool::new(false),
            opening: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorkingSet> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_active(&self, id: Option<&str>) {
        let result = match id {
            Some(id) => self.local.set_active_reservation_id(id),
            None => self.local.clear_active_reservation_id(),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist active reservation");
        }
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub fn reservations(&self) -> Vec<Reservation> {
        self.state().reservations.clone()
    }

    pub fn reservation(&self, id: &str) -> Option<Reservation> {
        self.state().find(id).cloned()
    }

    /// Reservations pinned as tabs.
    pub fn opened(&self) -> Vec<Reservation> {
        let state = self.state();
        state
            .opened
            .iter()
            .filter_map(|id| state.find(id).cloned())
            .collect()
    }

    pub fn active_id(&self) -> Option<String> {
        self.state().active_id().map(str::to_string)
    }

    /// The active reservation with local edits and the order-derived total
    /// applied on top of the backend record.
    pub fn active_reservation(&self) -> Option<Reservation> {
        let state = self.state();
        let view = state.active.as_ref()?;
        let mut record = state.find(&view.id)?.clone();
        for (field, value) in &view.edits {
            field.set(&mut record, value.clone());
        }
        if let Some(total) = view.total {
            record.total_amount = total;
        }
        Some(record)
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.state()
            .active
            .as_ref()
            .map(|view| view.orders.clone())
            .unwrap_or_default()
    }

    /// Order-derived total of the active reservation, e.g. `"25.00"`.
    pub fn active_total(&self) -> Option<String> {
        self.state()
            .active
            .as_ref()
            .and_then(|view| view.total)
            .map(format_amount)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Replace the working set with a fresh backend list.
    pub fn reconcile(&self, list: Vec<Reservation>) {
        let mut persist: Option<Option<String>> = None;
        {
            let mut state = self.state();
            state.opened = list
                .iter()
                .filter(|r| r.status == ReservationStatus::Open)
                .map(|r| r.id.clone())
                .collect();
            state.reservations = list;

            if let Some(active_id) = state.active_id().map(str::to_string) {
                let usable = state
                    .find(&active_id)
                    .is_some_and(|r| !r.status.is_terminal());
                if !usable {
                    info!(reservation_id = %active_id, "active reservation gone or closed, clearing");
                    state.active = None;
                    self.auto_selected.store(true, Ordering::SeqCst);
                    persist = Some(None);
                }
            } else if !self.auto_selected.load(Ordering::SeqCst) {
                if let Some(first) = state.opened.first().cloned() {
                    info!(reservation_id = %first, "auto-selecting open reservation");
                    self.auto_selected.store(true, Ordering::SeqCst);
                    state.active = Some(ActiveView::new(&first));
                    persist = Some(Some(first));
                }
            }
            debug!(
                total = state.reservations.len(),
                opened = state.opened.len(),
                "reservations reconciled"
            );
        }
        if let Some(id) = persist {
            self.persist_active(id.as_deref());
        }
        self.prune_ledgers();
    }

    /// Drop paid-items ledgers of reservations that are gone or closed,
    /// including ones closed from another device.
    fn prune_ledgers(&self) {
        let ledgers = self.local.paid_item_reservations();
        if ledgers.is_empty() {
            return;
        }
        let stale: Vec<String> = {
            let state = self.state();
            ledgers
                .into_iter()
                .filter(|id| state.find(id).map_or(true, |r| r.status.is_terminal()))
                .collect()
        };
        for id in stale {
            match self.local.clear_paid_items(&id) {
                Ok(()) => debug!(reservation_id = %id, "pruned paid-items ledger"),
                Err(e) => warn!(reservation_id = %id, error = %e, "failed to prune paid-items ledger"),
            }
        }
    }

    /// Merge one backend record into the working set.
    pub fn apply_snapshot(&self, record: Reservation) {
        let cleared = {
            let mut state = self.state();
            let id = record.id.clone();
            let is_open = record.status == ReservationStatus::Open;
            let terminal = record.status.is_terminal();

            match state.reservations.iter_mut().find(|r| r.id == id) {
                Some(slot) => *slot = record,
                None => state.reservations.push(record),
            }

            let pinned = state.opened.contains(&id);
            if is_open && !pinned {
                state.opened.push(id.clone());
            } else if !is_open && pinned {
                state.opened.retain(|o| *o != id);
            }

            if terminal && state.active_id() == Some(id.as_str()) {
                info!(reservation_id = %id, "active reservation closed");
                state.active = None;
                self.auto_selected.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        if cleared {
            self.persist_active(None);
        }
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    /// Restore the persisted active reservation, then load everything.
    pub async fn bootstrap(&self) -> Result<(), ReservationError> {
        if let Some(id) = self.local.active_reservation_id() {
            debug!(reservation_id = %id, "restoring active reservation");
            self.auto_selected.store(true, Ordering::SeqCst);
            self.state().active = Some(ActiveView::new(&id));
        }
        self.refresh_all().await?;
        if self.active_id().is_some() {
            self.refresh_orders().await?;
        }
        Ok(())
    }

    pub async fn refresh_all(&self) -> Result<(), ReservationError> {
        let restaurant_id = self
            .local
            .restaurant_id()
            .ok_or(ReservationError::NoRestaurant)?;
        let list = self
            .gateway
            .fetch_list::<Reservation>(&format!("/reservations/restaurant/{restaurant_id}"))
            .await?;
        self.reconcile(list);
        Ok(())
    }

    /// Re-fetch one reservation after a side effect changed server-computed
    /// fields.
    pub async fn refresh_reservation(&self, id: &str) -> Result<Reservation, ReservationError> {
        let record: Reservation = self
            .gateway
            .fetch_record(&format!("/reservations/{id}"), CallOptions::get())
            .await?;
        self.apply_snapshot(record.clone());
        Ok(record)
    }

    /// Fetch the active reservation's orders and recompute its total.
    pub async fn refresh_orders(&self) -> Result<Vec<Order>, ReservationError> {
        let id = self
            .active_id()
            .ok_or(ReservationError::NoActiveReservation)?;
        let orders = self
            .gateway
            .fetch_list::<Order>(&format!("/orders/reservation/{id}"))
            .await?;

        let mut state = self.state();
        match state.active.as_mut() {
            Some(view) if view.id == id => {
                view.total = Some(orders_total(&orders));
                view.orders = orders.clone();
            }
            _ => debug!(reservation_id = %id, "active reservation changed while fetching orders"),
        }
        Ok(orders)
    }

    // -----------------------------------------------------------------------
    // Tabs
    // -----------------------------------------------------------------------

    /// Open the next waiting guest's reservation and make it active.
    pub async fn open_next_reservation(&self) -> Result<Reservation, ReservationError> {
        let _guard = InFlight::acquire(&self.opening).ok_or(ReservationError::Busy)?;

        let candidate = {
            let state = self.state();
            let next = next_arrival(&state.reservations, &state.opened).cloned();
            next.ok_or(ReservationError::NoPendingArrival)?
        };

        let opened = self.transition(&candidate, ReservationStatus::Open).await?;
        self.activate(&opened.id);
        info!(reservation_id = %opened.id, client = %opened.client_name, "reservation opened");
        Ok(opened)
    }

    /// Make an opened (or at least non-terminal) reservation the active one.
    pub fn select(&self, id: &str) -> Result<(), ReservationError> {
        {
            let state = self.state();
            match state.find(id) {
                Some(r) if !r.status.is_terminal() => {}
                _ => return Err(ReservationError::UnknownReservation(id.to_string())),
            }
            if state.active_id() == Some(id) {
                return Ok(());
            }
        }
        self.activate(id);
        Ok(())
    }

    fn activate(&self, id: &str) {
        {
            let mut state = self.state();
            if state.active_id() != Some(id) {
                state.active = Some(ActiveView::new(id));
            }
        }
        self.persist_active(Some(id));
    }

    /// Unpin a tab. The next full refresh pins it again if it is still open.
    pub fn close_tab(&self, id: &str) {
        let was_active = {
            let mut state = self.state();
            state.opened.retain(|o| o != id);
            if state.active_id() == Some(id) {
                state.active = None;
                true
            } else {
                false
            }
        };
        if was_active {
            self.auto_selected.store(true, Ordering::SeqCst);
            self.persist_active(None);
        }
    }

    // -----------------------------------------------------------------------
    // Local edits
    // -----------------------------------------------------------------------

    /// Edit a free-text field of the active reservation. With `persist`, the
    /// field is also sent to the backend in the background; failures are
    /// logged and the local value is kept.
    pub fn edit_field(
        &self,
        field: EditableField,
        edit: FieldEdit,
        persist: bool,
    ) -> Result<Option<JoinHandle<()>>, ReservationError> {
        let (id, value) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let view = state
                .active
                .as_mut()
                .ok_or(ReservationError::NoActiveReservation)?;
            let previous = view
                .edits
                .get(&field)
                .cloned()
                .or_else(|| {
                    state
                        .reservations
                        .iter()
                        .find(|r| r.id == view.id)
                        .and_then(|r| field.get(r))
                        .map(str::to_string)
                })
                .unwrap_or_default();
            let value = edit.apply(&previous);
            view.edits.insert(field, value.clone());
            (view.id.clone(), value)
        };

        if !persist {
            return Ok(None);
        }

        let gateway = Arc::clone(&self.gateway);
        let handle = tokio::spawn(async move {
            let mut body = Map::new();
            body.insert(field.wire_name().to_string(), Value::String(value));
            let path = format!("/reservations/{id}");
            match gateway.call(&path, CallOptions::put(Value::Object(body))).await {
                Ok(_) => debug!(reservation_id = %id, field = field.wire_name(), "field saved"),
                Err(e) => warn!(
                    reservation_id = %id,
                    field = field.wire_name(),
                    error = %e,
                    "failed to save field"
                ),
            }
        });
        Ok(Some(handle))
    }

    fn with_draft<T>(&self, f: impl FnOnce(&mut DraftOrder) -> T) -> Result<T, ReservationError> {
        let mut state = self.state();
        let view = state
            .active
            .as_mut()
            .ok_or(ReservationError::NoActiveReservation)?;
        Ok(f(&mut view.draft))
    }

    pub fn set_draft_quantity(&self, product_id: &str, quantity: u32) -> Result<u32, ReservationError> {
        self.with_draft(|draft| draft.set(product_id, quantity))
    }

    pub fn adjust_draft(&self, product_id: &str, delta: i32) -> Result<u32, ReservationError> {
        self.with_draft(|draft| draft.adjust(product_id, delta))
    }

    /// Display label for a draft line, e.g. the name with its options.
    pub fn set_draft_label(&self, product_id: &str, label: &str) -> Result<(), ReservationError> {
        self.with_draft(|draft| draft.set_label(product_id, label))
    }

    pub fn draft(&self) -> Option<DraftOrder> {
        self.state().active.as_ref().map(|view| view.draft.clone())
    }

    pub fn reset_draft(&self) {
        if let Some(view) = self.state().active.as_mut() {
            view.draft.reset();
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn known(&self, id: &str) -> Result<Reservation, ReservationError> {
        self.reservation(id)
            .ok_or_else(|| ReservationError::UnknownReservation(id.to_string()))
    }

    /// PUT a mutation and merge the resulting record. When the backend
    /// answers without a record, `fallback` is applied to the local copy.
    pub(crate) async fn mutate(
        &self,
        current: &Reservation,
        path: &str,
        options: CallOptions,
        fallback: impl FnOnce(&mut Reservation),
    ) -> Result<Reservation, ReservationError> {
        let response = self.gateway.call(path, options).await?;
        let record = match record_from_response(response)? {
            Some(record) => record,
            None => {
                let mut record = current.clone();
                fallback(&mut record);
                record
            }
        };
        self.apply_snapshot(record.clone());
        Ok(record)
    }

    async fn transition(
        &self,
        current: &Reservation,
        status: ReservationStatus,
    ) -> Result<Reservation, ReservationError> {
        debug!(reservation_id = %current.id, to = status.as_str(), "status transition");
        self.mutate(
            current,
            &format!("/reservations/{}/status", current.id),
            CallOptions::put(json!({ "status": status.as_str() })),
            |r| r.status = status,
        )
        .await
    }

    /// Merge an accepted payment, then re-fetch the record for the fields
    /// the backend computes. A response without a record is applied to the
    /// local copy.
    pub(crate) async fn record_payment(
        &self,
        id: &str,
        paid_amount: f64,
        status: ReservationStatus,
        response: Value,
    ) {
        let record = match record_from_response(response) {
            Ok(Some(record)) => Some(record),
            Ok(None) => None,
            Err(e) => {
                warn!(reservation_id = %id, error = %e, "unreadable payment response");
                None
            }
        };
        let record = record.or_else(|| {
            self.reservation(id).map(|mut r| {
                r.paid_amount = paid_amount;
                r.status = status;
                r
            })
        });
        if let Some(record) = record {
            self.apply_snapshot(record);
        }
        if let Err(e) = self.refresh_reservation(id).await {
            warn!(reservation_id = %id, error = %e, "failed to re-fetch reservation after payment");
        }
    }

    /// Close a reservation. Whether the balance allows it is the caller's
    /// check (`payment::ensure_settled`). Its paid-items ledger is purged.
    pub async fn mark_finished(&self, id: &str) -> Result<Reservation, ReservationError> {
        let current = self.known(id)?;
        let record = self
            .transition(&current, ReservationStatus::Finished)
            .await?;
        self.local.clear_paid_items(id)?;
        info!(reservation_id = %id, "reservation finished");
        Ok(record)
    }

    /// Cancel a reservation and purge its paid-items ledger.
    pub async fn cancel(&self, id: &str) -> Result<Reservation, ReservationError> {
        let current = self.known(id)?;
        let record = self
            .transition(&current, ReservationStatus::Cancelled)
            .await?;
        self.local.clear_paid_items(id)?;
        Ok(record)
    }

    /// Bring a cancelled reservation back to pending. Other statuses are
    /// returned unchanged.
    pub async fn restore(&self, id: &str) -> Result<Reservation, ReservationError> {
        let current = self.known(id)?;
        if current.status != ReservationStatus::Cancelled {
            debug!(reservation_id = %id, status = current.status.as_str(), "not cancelled, nothing to restore");
            return Ok(current);
        }
        self.transition(&current, ReservationStatus::Pending).await
    }

    pub async fn toggle_present(&self, id: &str) -> Result<Reservation, ReservationError> {
        let current = self.known(id)?;
        self.mutate(
            &current,
            &format!("/reservations/{id}/togglePresent"),
            CallOptions::put(json!({})),
            |r| r.is_present = !r.is_present,
        )
        .await
    }

    pub async fn create(&self, mut new: NewReservation) -> Result<Reservation, ReservationError> {
        if new.restaurant_id.is_none() {
            new.restaurant_id = Some(
                self.local
                    .restaurant_id()
                    .ok_or(ReservationError::NoRestaurant)?,
            );
        }
        let body = serde_json::to_value(&new)
            .map_err(|e| RequestFailed::Malformed(e.to_string()))?;
        let record: Reservation = self
            .gateway
            .fetch_record("/reservations", CallOptions::post(body))
            .await?;
        info!(reservation_id = %record.id, "reservation created");
        self.apply_snapshot(record.clone());
        Ok(record)
    }
}
