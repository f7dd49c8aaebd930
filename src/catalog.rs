//! Product catalog and allergen lookups.
//!
//! The catalog screens tolerate failures by showing an empty list, so these
//! calls use the gateway's empty-array fallback instead of surfacing errors.

use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::gateway::{decode_entries, CallOptions, Gateway};
use crate::local_state::LocalState;
use crate::models::{Allergen, Product};

pub struct Catalog {
    gateway: Arc<Gateway>,
    local: Arc<LocalState>,
    products: Mutex<Vec<Product>>,
}

impl Catalog {
    pub fn new(gateway: Arc<Gateway>, local: Arc<LocalState>) -> Self {
        Self {
            gateway,
            local,
            products: Mutex::new(Vec::new()),
        }
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, path: &str) -> Vec<T> {
        match self.gateway.call_or_empty(path, CallOptions::get()).await {
            Value::Array(entries) => decode_entries(path, entries),
            other => {
                warn!(path, "expected a list, got {other}");
                Vec::new()
            }
        }
    }

    /// Fetch the restaurant's products and keep them as the current catalog.
    pub async fn fetch_products(&self) -> Vec<Product> {
        let Some(restaurant_id) = self.local.restaurant_id() else {
            warn!("no restaurant configured, catalog left empty");
            return Vec::new();
        };
        let products: Vec<Product> = self
            .list(&format!("/products/restaurant/{restaurant_id}"))
            .await;
        debug!(count = products.len(), "catalog loaded");
        *self.products.lock().unwrap_or_else(PoisonError::into_inner) = products.clone();
        products
    }

    /// Last fetched catalog.
    pub fn products(&self) -> Vec<Product> {
        self.products
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Products that can currently be ordered.
    pub fn available_products(&self) -> Vec<Product> {
        self.products()
            .into_iter()
            .filter(|p| p.is_available)
            .collect()
    }

    pub async fn fetch_allergens(&self) -> Vec<Allergen> {
        self.list("/allergens").await
    }

    pub async fn product_allergens(&self, product_id: &str) -> Vec<Allergen> {
        self.list(&format!("/products/{product_id}/allergens")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestFailed;
    use crate::testing::harness_logged_in;
    use crate::transport::testing::{path_of, ScriptedTransport};
    use crate::transport::HttpResponse;
    use serde_json::json;

    fn catalog(transport: ScriptedTransport) -> (crate::testing::Harness, Catalog) {
        let h = harness_logged_in(transport);
        let catalog = Catalog::new(Arc::clone(&h.gateway), Arc::clone(&h.local));
        (h, catalog)
    }

    #[tokio::test]
    async fn products_are_fetched_and_cached() {
        let (h, catalog) = catalog(ScriptedTransport::new(|req| {
            assert_eq!(path_of(req), "/products/restaurant/rest-1");
            Ok(HttpResponse::json(
                200,
                &json!([
                    { "_id": "p1", "name": "Soupe", "price": "4.50" },
                    { "_id": "p2", "name": "Tarte", "price": 6, "isAvailable": false }
                ]),
            ))
        }));
        let products = catalog.fetch_products().await;
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].price, 4.5);
        assert_eq!(catalog.products(), products);
        assert_eq!(catalog.available_products().len(), 1);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn failures_read_as_empty_lists() {
        let (_h, catalog) = catalog(ScriptedTransport::new(|_| Err(RequestFailed::Timeout)));
        assert!(catalog.fetch_products().await.is_empty());
        assert!(catalog.fetch_allergens().await.is_empty());
    }

    #[tokio::test]
    async fn allergens_by_product() {
        let (_h, catalog) = catalog(ScriptedTransport::new(|req| match path_of(req) {
            "/products/p1/allergens" => Ok(HttpResponse::json(
                200,
                &json!([{ "_id": "a1", "name": "Gluten", "icon": "wheat" }]),
            )),
            _ => Ok(HttpResponse::json(200, &json!({ "unexpected": true }))),
        }));
        let allergens = catalog.product_allergens("p1").await;
        assert_eq!(allergens.len(), 1);
        assert_eq!(allergens[0].name, "Gluten");
        assert!(catalog.fetch_allergens().await.is_empty());
    }
}
