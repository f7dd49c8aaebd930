//! OrderIt client core.
//!
//! Session and token handling, an authenticated gateway to the backend REST
//! API, the reservation working set, order and payment staging, and a live
//! update listener. `OrderItClient` wires the pieces together; each service
//! can also be built on its own from the shared `Arc`s.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod gateway;
pub mod local_state;
pub mod logging;
pub mod models;
pub mod orders;
pub mod payment;
pub mod realtime;
pub mod reservations;
pub mod session;
pub mod storage;
pub mod tables;
pub mod transport;

pub use config::ClientConfig;
pub use error::{InitError, RequestFailed, ReservationError, SessionError, StagingError, StoreError};
pub use gateway::{CallOptions, Gateway};
pub use local_state::LocalState;
pub use models::{DisplayStatus, Order, Product, Reservation, ReservationStatus, Table};
pub use reservations::{FieldEdit, ReservationCoordinator};
pub use session::{SessionEvent, SessionManager};

use catalog::Catalog;
use orders::OrderStaging;
use payment::PaymentSession;
use realtime::RealtimeListener;
use storage::{CredentialStore, KeyringStore};
use tables::TableService;
use transport::{ReqwestTransport, Transport};

pub struct OrderItClient {
    pub config: Arc<ClientConfig>,
    pub local: Arc<LocalState>,
    pub session: Arc<SessionManager>,
    pub gateway: Arc<Gateway>,
    pub reservations: Arc<ReservationCoordinator>,
    pub orders: OrderStaging,
    pub tables: TableService,
    pub catalog: Catalog,
}

impl OrderItClient {
    /// Production wiring: reqwest transport, OS keyring, SQLite database in
    /// the configured data directory.
    pub fn open(config: ClientConfig) -> Result<Self, InitError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| StoreError::Sqlite(format!("cannot create data dir: {e}")))?;
        let local = LocalState::new(db::init(&config.db_path())?);
        let transport = ReqwestTransport::new()?;
        info!(
            api_url = %config.api_url,
            db = %config.db_path().display(),
            "OrderIt client v{} ready",
            env!("CARGO_PKG_VERSION")
        );
        Ok(Self::from_parts(
            config,
            Arc::new(transport),
            Arc::new(KeyringStore),
            Arc::new(local),
        ))
    }

    pub fn from_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        local: Arc<LocalState>,
    ) -> Self {
        let config = Arc::new(config);
        let session = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&transport),
            credentials,
            Arc::clone(&local),
        ));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&config),
            transport,
            Arc::clone(&session),
        ));
        let reservations = Arc::new(ReservationCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&local),
        ));
        let orders = OrderStaging::new(
            Arc::clone(&gateway),
            Arc::clone(&local),
            Arc::clone(&reservations),
        );
        let tables = TableService::new(
            Arc::clone(&gateway),
            Arc::clone(&local),
            Arc::clone(&reservations),
        );
        let catalog = Catalog::new(Arc::clone(&gateway), Arc::clone(&local));

        Self {
            config,
            local,
            session,
            gateway,
            reservations,
            orders,
            tables,
            catalog,
        }
    }

    /// Payment staging for the active reservation and its fetched orders.
    pub fn payment(&self) -> Option<PaymentSession> {
        let reservation = self.reservations.active_reservation()?;
        Some(PaymentSession::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.local),
            Arc::clone(&self.reservations),
            &reservation,
            &self.reservations.active_orders(),
        ))
    }

    pub fn realtime(&self, shutdown: CancellationToken) -> RealtimeListener {
        RealtimeListener::new(
            Arc::clone(&self.config),
            Arc::clone(&self.session),
            Arc::clone(&self.reservations),
            shutdown,
        )
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{test_config, TEST_API_URL};
    use crate::transport::testing::{path_of, ScriptedTransport};
    use crate::transport::HttpResponse;
    use serde_json::json;
    use std::sync::Mutex;

    fn backend() -> ScriptedTransport {
        ScriptedTransport::new(|req| match path_of(req) {
            "/auth/login" => Ok(HttpResponse::json(
                200,
                &json!({
                    "accessToken": "access-0",
                    "refreshToken": "refresh-0",
                    "user": { "_id": "u1", "restaurantId": "rest-1" }
                }),
            )),
            "/reservations/restaurant/rest-1" => Ok(HttpResponse::json(
                200,
                &json!([{ "_id": "r1", "status": "ouverte", "totalAmount": 10 }]),
            )),
            "/orders/reservation/r1" => Ok(HttpResponse::json(
                200,
                &json!([{ "_id": "o1", "items": [{ "productId": "p1", "name": "Menu", "price": 10, "quantity": 1 }] }]),
            )),
            other => panic!("unexpected request {other}"),
        })
    }

    /// Backend holding one reservation whose paid amount follows the
    /// payment updates it receives.
    fn paying_backend() -> ScriptedTransport {
        let state = Arc::new(Mutex::new((0.0_f64, "ouverte".to_string())));
        ScriptedTransport::new(move |req| {
            let mut state = state.lock().expect("backend state");
            let record = |s: &(f64, String)| {
                json!({ "_id": "r1", "status": s.1, "totalAmount": 22, "paidAmount": s.0 })
            };
            match path_of(req) {
                "/auth/login" => Ok(HttpResponse::json(
                    200,
                    &json!({
                        "accessToken": "access-0",
                        "refreshToken": "refresh-0",
                        "user": { "_id": "u1", "restaurantId": "rest-1" }
                    }),
                )),
                "/reservations/restaurant/rest-1" => {
                    Ok(HttpResponse::json(200, &json!([record(&*state)])))
                }
                "/reservations/r1" => Ok(HttpResponse::json(200, &record(&*state))),
                "/reservations/r1/payment" => {
                    let body = req.body.clone().unwrap_or_default();
                    state.0 = body["paidAmount"].as_f64().unwrap_or_default();
                    state.1 = body["status"].as_str().unwrap_or_default().to_string();
                    Ok(HttpResponse::json(200, &json!({ "message": "payment saved" })))
                }
                "/orders/reservation/r1" => Ok(HttpResponse::json(
                    200,
                    &json!([
                        { "_id": "o1", "items": [
                            { "productId": "p1", "name": "Soupe", "price": 4.5, "quantity": 2 },
                            { "productId": "p2", "name": "Vin", "price": 7, "quantity": 1 }
                        ]},
                        { "_id": "o2", "items": [
                            { "productId": "p3", "name": "Tarte", "price": 6, "quantity": 1 }
                        ]}
                    ]),
                )),
                path if path.ends_with("/mark-as-paid") => {
                    Ok(HttpResponse::json(200, &json!({})))
                }
                other => panic!("unexpected request {other}"),
            }
        })
    }

    #[tokio::test]
    async fn consecutive_payment_sessions_accumulate_paid_amount() {
        let transport: Arc<ScriptedTransport> = Arc::new(paying_backend());
        let client = OrderItClient::from_parts(
            test_config(),
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(LocalState::in_memory().expect("local")),
        );
        client
            .session
            .login("chef@example.com", "secret")
            .await
            .expect("login");
        client.reservations.bootstrap().await.expect("bootstrap");

        let mut first = client.payment().expect("first payment");
        first.toggle_item("p3-Tarte-6-1");
        assert_eq!(first.pay().await.expect("partial").amount, 16.0);
        assert_eq!(
            client.reservations.reservation("r1").map(|r| r.paid_amount),
            Some(16.0)
        );

        let mut second = client.payment().expect("second payment");
        assert_eq!(second.remaining_amount(), 6.0);
        assert!(second.pay().await.expect("rest").is_full_payment);

        let bodies: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| path_of(r) == "/reservations/r1/payment")
            .filter_map(|r| r.body)
            .collect();
        assert_eq!(
            bodies,
            [
                json!({ "paidAmount": 16.0, "status": "ouverte" }),
                json!({ "paidAmount": 22.0, "status": "terminée" })
            ]
        );
        let r1 = client.reservations.reservation("r1").expect("r1");
        assert_eq!(r1.paid_amount, 22.0);
        assert_eq!(r1.status, ReservationStatus::Finished);
        assert_eq!(client.reservations.active_id(), None);
        client.session.logout();
    }

    #[tokio::test]
    async fn login_bootstrap_and_payment_view() {
        let transport: Arc<ScriptedTransport> = Arc::new(backend());
        let client = OrderItClient::from_parts(
            test_config(),
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(LocalState::in_memory().expect("local")),
        );
        assert_eq!(client.config.api_url, TEST_API_URL);
        assert!(client.payment().is_none());

        client
            .session
            .login("chef@example.com", "secret")
            .await
            .expect("login");
        client.reservations.bootstrap().await.expect("bootstrap");

        let payment = client.payment().expect("active reservation");
        assert_eq!(payment.items().len(), 1);
        assert_eq!(payment.remaining_amount(), 10.0);
        client.session.logout();
    }
}
