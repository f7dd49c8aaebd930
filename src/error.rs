//! Error types shared across the client core.

use thiserror::Error;

/// Failures of the Session/Token Manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No refresh credential is stored; the user must log in again.
    #[error("session lost: no refresh token available")]
    SessionLost,

    /// The backend rejected the refresh request.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The login request did not complete within the login timeout.
    #[error("login timed out")]
    LoginTimeout,

    /// The backend rejected the login (bad credentials, server error...).
    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("credential store error: {0}")]
    Store(String),
}

/// Why a gateway call produced no usable result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestFailed {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// Non-2xx status after the auth retry (if any).
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// 401/403 that survived a refresh, or a refresh that could not happen.
    #[error("not authenticated: {0}")]
    Unauthorized(String),

    #[error("unexpected content type: {0}")]
    NotJson(String),

    #[error("malformed JSON response: {0}")]
    Malformed(String),

    /// The body parsed but does not have the shape the caller expects
    /// (e.g. an array where a single record was required).
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}

impl RequestFailed {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Local validation and business preconditions of the staging area.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StagingError {
    #[error("no items selected")]
    EmptySelection,

    /// Closing a reservation that still has an outstanding balance.
    #[error("payment incomplete: {outstanding:.2} still due")]
    PaymentIncomplete { outstanding: f64 },

    #[error("no active reservation")]
    NoActiveReservation,

    /// The same action is already in flight.
    #[error("an order submission is already in progress")]
    Busy,

    #[error(transparent)]
    Request(#[from] RequestFailed),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the Reservation Lifecycle Coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    /// No reservation is both present and pending.
    #[error("no present guest is waiting for a table")]
    NoPendingArrival,

    #[error("no active reservation")]
    NoActiveReservation,

    #[error("reservation {0} is not known")]
    UnknownReservation(String),

    #[error("table {0} is already assigned elsewhere")]
    TableUnavailable(String),

    #[error("another reservation action is already in progress")]
    Busy,

    #[error("restaurant is not configured for this session")]
    NoRestaurant,

    #[error(transparent)]
    Request(#[from] RequestFailed),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Local persistence failures (SQLite or OS keyring).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(String),

    #[error("keyring: {0}")]
    Keyring(String),

    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

/// Failure to assemble an `OrderItClient`.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("local storage: {0}")]
    Store(#[from] StoreError),

    #[error("http client: {0}")]
    Transport(#[from] RequestFailed),
}
