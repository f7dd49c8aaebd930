//! Draft orders and their submission.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{StagingError, StoreError};
use crate::gateway::{CallOptions, Gateway};
use crate::local_state::LocalState;
use crate::models::{round_cents, Order, Product, Reservation};
use crate::reservations::{InFlight, ReservationCoordinator};

/// Per-line quantity ceiling.
pub const MAX_QUANTITY: u32 = 99;

/// Status sent with every new order.
const NEW_ORDER_STATUS: &str = "in_progress";

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// Quantities picked for the active reservation, keyed by product id.
/// Zero means "not selected". A line may carry a display label (e.g. the
/// product name with its chosen options) that replaces the catalog name on
/// the submitted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftOrder {
    quantities: BTreeMap<String, u32>,
    labels: BTreeMap<String, String>,
}

impl DraftOrder {
    pub fn quantity(&self, product_id: &str) -> u32 {
        self.quantities.get(product_id).copied().unwrap_or(0)
    }

    /// Set a quantity, clamped to `MAX_QUANTITY`. Returns the stored value.
    pub fn set(&mut self, product_id: &str, quantity: u32) -> u32 {
        let quantity = quantity.min(MAX_QUANTITY);
        self.quantities.insert(product_id.to_string(), quantity);
        quantity
    }

    /// Add `delta` (possibly negative) to a quantity, saturating at 0 and
    /// `MAX_QUANTITY`.
    pub fn adjust(&mut self, product_id: &str, delta: i32) -> u32 {
        let current = i64::from(self.quantity(product_id));
        let next = (current + i64::from(delta)).clamp(0, i64::from(MAX_QUANTITY));
        self.set(product_id, u32::try_from(next).unwrap_or(0))
    }

    pub fn label(&self, product_id: &str) -> Option<&str> {
        self.labels.get(product_id).map(String::as_str)
    }

    /// Label a line, e.g. `"Steak (saignant, frites)"`. Blank labels
    /// remove it.
    pub fn set_label(&mut self, product_id: &str, label: &str) {
        let label = label.trim();
        if label.is_empty() {
            self.labels.remove(product_id);
        } else {
            self.labels.insert(product_id.to_string(), label.to_string());
        }
    }

    /// Attach catalog names to picked products that have no label yet.
    pub fn enrich(&mut self, catalog: &[Product]) {
        for product in catalog {
            if self.quantities.contains_key(&product.id) {
                self.labels
                    .entry(product.id.clone())
                    .or_insert_with(|| product.name.clone());
            }
        }
    }

    /// Products with a non-zero quantity.
    pub fn selected(&self) -> impl Iterator<Item = (&str, u32)> {
        self.quantities
            .iter()
            .filter(|(_, qty)| **qty > 0)
            .map(|(id, qty)| (id.as_str(), *qty))
    }

    pub fn is_empty(&self) -> bool {
        self.selected().next().is_none()
    }

    /// Zero every quantity and drop the labels.
    pub fn reset(&mut self) {
        self.quantities.values_mut().for_each(|qty| *qty = 0);
        self.labels.clear();
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub reservation_id: String,
    pub table_id: Option<String>,
    pub items: Vec<NewOrderItem>,
    pub total: f64,
    pub status: String,
    pub restaurant_id: Option<String>,
    pub server_id: Option<String>,
}

/// Resolve the selected draft lines against the catalog. Products missing
/// from the catalog are dropped. Never touches the network.
pub fn build_order(
    draft: &DraftOrder,
    catalog: &[Product],
    reservation: &Reservation,
    restaurant_id: Option<String>,
    server_id: Option<String>,
) -> Result<NewOrder, StagingError> {
    let items: Vec<NewOrderItem> = draft
        .selected()
        .filter_map(|(product_id, quantity)| {
            let Some(product) = catalog.iter().find(|p| p.id == product_id) else {
                warn!(product_id, "draft item not in catalog, skipping");
                return None;
            };
            Some(NewOrderItem {
                product_id: product.id.clone(),
                name: draft.label(product_id).unwrap_or(&product.name).to_string(),
                price: product.price,
                quantity,
            })
        })
        .collect();

    if items.is_empty() {
        return Err(StagingError::EmptySelection);
    }

    let total = round_cents(
        items
            .iter()
            .map(|item| item.price * f64::from(item.quantity))
            .sum(),
    );

    Ok(NewOrder {
        reservation_id: reservation.id.clone(),
        table_id: reservation.table_id().map(str::to_string),
        items,
        total,
        status: NEW_ORDER_STATUS.to_string(),
        restaurant_id,
        // Fall back to the reservation's assigned server.
        server_id: server_id.or_else(|| reservation.server_id().map(str::to_string)),
    })
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

pub struct OrderStaging {
    gateway: Arc<Gateway>,
    local: Arc<LocalState>,
    coordinator: Arc<ReservationCoordinator>,
    submitting: AtomicBool,
}

impl OrderStaging {
    pub fn new(
        gateway: Arc<Gateway>,
        local: Arc<LocalState>,
        coordinator: Arc<ReservationCoordinator>,
    ) -> Self {
        Self {
            gateway,
            local,
            coordinator,
            submitting: AtomicBool::new(false),
        }
    }

    /// Submit the active reservation's draft. On success the draft is reset
    /// and both the order list and the reservation are re-fetched; failures
    /// of those follow-up fetches are logged only.
    pub async fn submit(&self, catalog: &[Product]) -> Result<Option<Order>, StagingError> {
        let reservation = self
            .coordinator
            .active_reservation()
            .ok_or(StagingError::NoActiveReservation)?;
        let draft = self
            .coordinator
            .draft()
            .ok_or(StagingError::NoActiveReservation)?;

        let order = build_order(
            &draft,
            catalog,
            &reservation,
            self.local.restaurant_id(),
            self.local.user_id(),
        )?;

        let _guard = InFlight::acquire(&self.submitting).ok_or(StagingError::Busy)?;
        let body = serde_json::to_value(&order).map_err(StoreError::from)?;
        let created = self.gateway.call("/orders", CallOptions::post(body)).await?;

        info!(
            reservation_id = %reservation.id,
            lines = order.items.len(),
            total = order.total,
            "order submitted"
        );

        self.coordinator.reset_draft();
        if let Err(e) = self.coordinator.refresh_orders().await {
            warn!(error = %e, "failed to refresh orders after submission");
        }
        if let Err(e) = self.coordinator.refresh_reservation(&reservation.id).await {
            warn!(error = %e, "failed to refresh reservation after submission");
        }

        Ok(serde_json::from_value(created).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness_logged_in, Harness};
    use crate::transport::testing::{path_of, ScriptedTransport};
    use crate::transport::HttpResponse;
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    fn product(id: &str, name: &str, price: f64) -> Product {
        serde_json::from_value(json!({ "_id": id, "name": name, "price": price }))
            .expect("product")
    }

    fn reservation() -> Reservation {
        serde_json::from_value(json!({
            "_id": "r1",
            "status": "ouverte",
            "isPresent": true,
            "tableId": { "_id": "t4", "number": 4 },
            "serverId": "u7"
        }))
        .expect("reservation")
    }

    #[test]
    fn quantity_is_clamped() {
        let mut draft = DraftOrder::default();
        assert_eq!(draft.set("p1", 150), MAX_QUANTITY);
        assert_eq!(draft.adjust("p1", 1), 99);
        assert_eq!(draft.set("p1", 0), 0);
        assert_eq!(draft.adjust("p1", -1), 0);
        assert_eq!(draft.adjust("p2", 3), 3);
        assert_eq!(draft.adjust("p2", -10), 0);
    }

    #[test]
    fn reset_keeps_products_but_zeroes_quantities() {
        let mut draft = DraftOrder::default();
        draft.set("p1", 2);
        draft.set("p2", 1);
        assert!(!draft.is_empty());
        draft.reset();
        assert!(draft.is_empty());
        assert_eq!(draft.quantity("p1"), 0);
    }

    #[test]
    fn enrich_labels_only_picked_products() {
        let mut draft = DraftOrder::default();
        draft.set("p1", 1);
        draft.enrich(&[product("p1", "Soupe", 4.5), product("p2", "Tarte", 6.0)]);
        assert_eq!(draft.label("p1"), Some("Soupe"));
        assert_eq!(draft.label("p2"), None);
    }

    #[test]
    fn build_order_resolves_catalog_and_totals() {
        let mut draft = DraftOrder::default();
        draft.set("p1", 2);
        draft.set("p2", 0);
        draft.set("p3", 1);
        let catalog = [
            product("p1", "Soupe", 4.5),
            product("p2", "Tarte", 6.0),
            product("p3", "Vin", 7.25),
        ];

        let order = build_order(&draft, &catalog, &reservation(), Some("rest-1".into()), None)
            .expect("order");
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.total, 16.25);
        assert_eq!(order.table_id.as_deref(), Some("t4"));
        assert_eq!(order.server_id.as_deref(), Some("u7"));

        let body = serde_json::to_value(&order).expect("json");
        assert_eq!(body["status"], "in_progress");
        assert_eq!(body["reservationId"], "r1");
        assert_eq!(body["restaurantId"], "rest-1");
        assert_eq!(body["items"][0]["productId"], "p1");
    }

    #[test]
    fn labels_override_catalog_names_on_the_order() {
        let mut draft = DraftOrder::default();
        draft.set("p1", 1);
        draft.set("p2", 1);
        draft.set_label("p1", " Soupe (sans crème) ");
        draft.enrich(&[product("p1", "Soupe", 4.5), product("p2", "Tarte", 6.0)]);
        assert_eq!(draft.label("p1"), Some("Soupe (sans crème)"));
        assert_eq!(draft.label("p2"), Some("Tarte"));

        let order = build_order(
            &draft,
            &[product("p1", "Soupe", 4.5), product("p2", "Tarte", 6.0)],
            &reservation(),
            None,
            None,
        )
        .expect("order");
        let names: Vec<_> = order.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["Soupe (sans crème)", "Tarte"]);

        draft.set_label("p1", "  ");
        assert_eq!(draft.label("p1"), None);
        draft.reset();
        assert_eq!(draft.label("p2"), None);
    }

    #[tokio::test]
    async fn labelled_draft_line_is_submitted_with_its_label() {
        let (h, coordinator, staging) = staging(backend()).await;
        coordinator.set_draft_quantity("p1", 1).expect("active");
        coordinator
            .set_draft_label("p1", "Soupe (grande)")
            .expect("label");

        staging
            .submit(&[product("p1", "Soupe", 4.5)])
            .await
            .expect("submit");
        let posted = h
            .transport
            .requests()
            .into_iter()
            .find(|r| r.method == Method::POST)
            .and_then(|r| r.body)
            .expect("post body");
        assert_eq!(posted["items"][0]["name"], "Soupe (grande)");
        assert_eq!(coordinator.draft().and_then(|d| d.label("p1").map(str::to_string)), None);
    }

    #[test]
    fn build_order_without_selection_is_empty_selection() {
        let mut draft = DraftOrder::default();
        draft.set("p1", 0);
        let err = build_order(&draft, &[product("p1", "Soupe", 4.5)], &reservation(), None, None)
            .expect_err("nothing picked");
        assert_eq!(err, StagingError::EmptySelection);
    }

    fn backend() -> ScriptedTransport {
        ScriptedTransport::new(|req| match (req.method.as_str(), path_of(req)) {
            ("GET", "/reservations/restaurant/rest-1") => Ok(HttpResponse::json(
                200,
                &json!([{ "_id": "r1", "status": "ouverte", "isPresent": true }]),
            )),
            ("GET", "/reservations/r1") => Ok(HttpResponse::json(
                200,
                &json!({ "_id": "r1", "status": "ouverte", "totalAmount": 9 }),
            )),
            ("GET", "/orders/reservation/r1") => Ok(HttpResponse::json(
                200,
                &json!([{ "_id": "o1", "items": [{ "productId": "p1", "name": "Soupe", "price": 4.5, "quantity": 2 }] }]),
            )),
            ("POST", "/orders") => Ok(HttpResponse::json(200, &json!({ "_id": "o1" }))),
            (method, path) => panic!("unexpected {method} {path}"),
        })
    }

    async fn staging(
        transport: ScriptedTransport,
    ) -> (Harness, Arc<ReservationCoordinator>, OrderStaging) {
        let h = harness_logged_in(transport);
        let coordinator = Arc::new(ReservationCoordinator::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.local),
        ));
        coordinator.refresh_all().await.expect("refresh");
        let staging = OrderStaging::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.local),
            Arc::clone(&coordinator),
        );
        (h, coordinator, staging)
    }

    #[tokio::test]
    async fn empty_draft_never_reaches_the_network() {
        let (h, coordinator, staging) = staging(backend()).await;
        coordinator.set_draft_quantity("p1", 0).expect("active");
        let before = h.transport.requests().len();

        let err = staging
            .submit(&[product("p1", "Soupe", 4.5)])
            .await
            .expect_err("empty");
        assert_eq!(err, StagingError::EmptySelection);
        assert_eq!(h.transport.requests().len(), before);
    }

    #[tokio::test]
    async fn submit_posts_resets_draft_and_refetches() {
        let (h, coordinator, staging) = staging(backend()).await;
        coordinator.set_draft_quantity("p1", 2).expect("active");

        let created = staging
            .submit(&[product("p1", "Soupe", 4.5)])
            .await
            .expect("submit");
        assert_eq!(created.map(|o| o.id).as_deref(), Some("o1"));

        let posted = h
            .transport
            .requests()
            .into_iter()
            .find(|r| r.method == Method::POST)
            .expect("post");
        let body = posted.body.expect("body");
        assert_eq!(body["total"], json!(9.0));
        assert_eq!(body["serverId"], "u1");

        assert!(coordinator.draft().expect("draft").is_empty());
        assert_eq!(h.transport.count(Method::GET, "/orders/reservation/r1"), 1);
        assert_eq!(h.transport.count(Method::GET, "/reservations/r1"), 1);
        assert_eq!(coordinator.active_total().as_deref(), Some("9.00"));
    }

    #[tokio::test]
    async fn double_submit_is_rejected_while_in_flight() {
        let (h, coordinator, staging) = staging(backend().with_delay(Duration::from_millis(20))).await;
        coordinator.set_draft_quantity("p1", 1).expect("active");
        let catalog = [product("p1", "Soupe", 4.5)];

        let (first, second) = tokio::join!(staging.submit(&catalog), staging.submit(&catalog));
        assert!(first.is_ok());
        assert_eq!(second.expect_err("busy"), StagingError::Busy);
        assert_eq!(h.transport.count(Method::POST, "/orders"), 1);
    }

    #[tokio::test]
    async fn submit_without_active_reservation_fails() {
        let h = harness_logged_in(backend());
        let coordinator = Arc::new(ReservationCoordinator::new(
            Arc::clone(&h.gateway),
            Arc::clone(&h.local),
        ));
        let staging = OrderStaging::new(Arc::clone(&h.gateway), Arc::clone(&h.local), coordinator);
        assert_eq!(
            staging.submit(&[]).await.expect_err("no active"),
            StagingError::NoActiveReservation
        );
    }
}
