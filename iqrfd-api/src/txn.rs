//! Outcome types for DPA transactions. One transaction is one
//! request sent through the radio plus the optional confirmation and
//! response frames collected before a deadline.

use crate::dpa::DpaRequest;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::time::Duration;

/// The outcome taxonomy of a transaction. Numeric codes are part of
/// the API contract: `0` is success, positive values up to 255 are
/// DPA response codes surfaced verbatim, negative values are
/// transaction-machine errors, and `1000` marks a driver failure
/// before or after the wire exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Ok,
    /// Non-zero DPA response code with the async bit clear.
    Rcode(u8),
    Timeout,
    NoResponse,
    Aborted,
    BadRequest,
    BadResponse,
    ExclusiveUnavailable,
    /// Driver-level failure surfaced with the engine's message.
    Fail,
}

impl TxnStatus {
    pub fn code(&self) -> i32 {
        match self {
            TxnStatus::Ok => 0,
            TxnStatus::Rcode(rc) => *rc as i32,
            TxnStatus::Timeout => -1,
            TxnStatus::NoResponse => -2,
            TxnStatus::Aborted => -3,
            TxnStatus::BadRequest => -6,
            TxnStatus::BadResponse => -7,
            TxnStatus::ExclusiveUnavailable => -8,
            TxnStatus::Fail => 1000,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == TxnStatus::Ok
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxnStatus::Ok => write!(f, "ok"),
            TxnStatus::Rcode(rc) => write!(f, "rcode {}", rc),
            TxnStatus::Timeout => write!(f, "timeout"),
            TxnStatus::NoResponse => write!(f, "no response"),
            TxnStatus::Aborted => write!(f, "aborted"),
            TxnStatus::BadRequest => write!(f, "bad request"),
            TxnStatus::BadResponse => write!(f, "bad response"),
            TxnStatus::ExclusiveUnavailable => {
                write!(f, "exclusive access unavailable")
            }
            TxnStatus::Fail => write!(f, "driver failure"),
        }
    }
}

/// Everything known about one finished transaction: the raw frames,
/// per-phase timestamps, and the outcome. The raw material feeds the
/// verbose `data.raw[]` trace arrays in API responses.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub request: Vec<u8>,
    pub confirmation: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
    pub request_ts: Option<DateTime<Local>>,
    pub confirmation_ts: Option<DateTime<Local>>,
    pub response_ts: Option<DateTime<Local>>,
    pub status: TxnStatus,
    pub error_str: String,
}

impl TransactionResult {
    /// A result carrying only the request and an error outcome. Used
    /// when the exchange failed before any frame came back, and for
    /// error envelopes fabricated by the dispatcher.
    pub fn failed(
        request: Vec<u8>,
        status: TxnStatus,
        error_str: impl Into<String>,
    ) -> Self {
        TransactionResult {
            request,
            confirmation: None,
            response: None,
            request_ts: Some(Local::now()),
            confirmation_ts: None,
            response_ts: None,
            status,
            error_str: error_str.into(),
        }
    }

    /// A result fabricated around a frame that was received without a
    /// matching request (async traffic).
    pub fn unsolicited(response: Vec<u8>) -> Self {
        TransactionResult {
            request: vec![],
            confirmation: None,
            response: Some(response),
            request_ts: None,
            confirmation_ts: None,
            response_ts: Some(Local::now()),
            status: TxnStatus::Ok,
            error_str: String::from("ok"),
        }
    }

    pub fn responded(&self) -> bool {
        self.response.is_some()
    }

    pub fn confirmed(&self) -> bool {
        self.confirmation.is_some()
    }

    pub fn set_status(&mut self, status: TxnStatus) {
        self.status = status;
        self.error_str = status.to_string();
    }
}

// Default deadlines by message scope. Coordinator-local requests
// never go on air; routed requests cross the mesh; FRC aggregates the
// whole network in one slot.

const LOCAL_TIMEOUT: Duration = Duration::from_millis(500);
const ROUTED_TIMEOUT: Duration = Duration::from_millis(5_000);
const FRC_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Picks the default deadline for a request when the caller supplied
/// none.
pub fn default_timeout(req: &DpaRequest) -> Duration {
    if req.is_frc() {
        FRC_TIMEOUT
    } else if req.is_local() {
        LOCAL_TIMEOUT
    } else {
        ROUTED_TIMEOUT
    }
}
