//! `orderit`: log in, load the reservation board and follow live updates
//! until Ctrl-C.

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orderit_client::dashboard::{activity_summary, filter_reservations, load_filter};
use orderit_client::models::DisplayStatus;
use orderit_client::{ClientConfig, OrderItClient, SessionEvent};

const ENV_EMAIL: &str = "ORDERIT_EMAIL";
const ENV_PASSWORD: &str = "ORDERIT_PASSWORD";

#[tokio::main]
async fn main() -> Result<()> {
    let config = ClientConfig::from_env();
    let _log_guard = orderit_client::logging::init(&config.log_dir);

    let client = OrderItClient::open(config).context("failed to open local state")?;

    if !client.session.is_authenticated() {
        let (Ok(email), Ok(password)) = (std::env::var(ENV_EMAIL), std::env::var(ENV_PASSWORD))
        else {
            bail!("not logged in: set {ENV_EMAIL} and {ENV_PASSWORD}");
        };
        client
            .session
            .login(&email, &password)
            .await
            .context("login failed")?;
    } else {
        client.session.schedule_proactive_refresh();
    }

    client
        .reservations
        .bootstrap()
        .await
        .context("failed to load reservations")?;

    let reservations = client.reservations.reservations();
    let summary = activity_summary(&reservations);
    info!(
        pending = summary.count(DisplayStatus::Pending),
        present = summary.count(DisplayStatus::Present),
        open = summary.count(DisplayStatus::Open),
        expected_guests = summary.expected_guests,
        outstanding = summary.outstanding,
        "reservation board loaded"
    );
    for r in filter_reservations(&reservations, load_filter(&client.local)) {
        info!(
            id = %r.id,
            client = %r.client_name,
            guests = r.number_of_guests,
            date = r.reservation_date.as_deref().unwrap_or("-"),
            time = r.reservation_time.as_deref().unwrap_or("-"),
            status = r.display_status().as_str(),
        );
    }
    if let Some(active) = client.reservations.active_reservation() {
        info!(
            id = %active.id,
            total = client.reservations.active_total().as_deref().unwrap_or("0.00"),
            "active reservation"
        );
    }

    let shutdown = CancellationToken::new();
    let listener = client.realtime(shutdown.clone()).spawn();
    let mut events = client.session.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::LoginRequired { reason }) => {
                    warn!(%reason, "session ended, log in again");
                    break;
                }
                Ok(other) => info!(event = ?other, "session event"),
                Err(RecvError::Closed) => break,
                Err(e) => warn!(error = %e, "session event stream interrupted"),
            }
        }
    }

    shutdown.cancel();
    listener.await.ok();
    Ok(())
}
