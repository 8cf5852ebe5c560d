//! Defines fundamental types used throughout the daemon codebase.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Enumerates all the errors that can be reported in the daemon.
/// Components should try to map their errors into one of these
/// values. If no current value is appropriate, a new one could be
/// added (requiring a new release of this crate) but make sure the
/// new error code is generic enough that it may be useful for other
/// components. For instance, don't add an error value that is
/// specific to SQLite. Add a more general value and use the
/// associated description string to explain the details.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// Returned whenever a resource cannot be found.
    NotFound,

    /// A resource is already in use.
    InUse,

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),

    /// An invalid value was provided.
    InvArgument(String),

    /// A general error returned by the persistence store. The string
    /// will have more information about the error.
    StoreError(String),

    /// Communication was disrupted due to one end not following a
    /// protocol.
    ProtocolError(String),

    /// An operation didn't complete in a timely fashion.
    TimeoutError,

    /// The requested operation couldn't complete. The description
    /// field will have more information for the user.
    OperationError(String),

    /// A bad parameter was given in a configuration or a
    /// configuration was missing a required parameter.
    ConfigError(String),

    /// There was a problem parsing a string. The associated string
    /// will describe how the parsing failed.
    ParseError(String),

    /// A driver function raised an error in the scripting engine. The
    /// engine's message is preserved so it can be surfaced to the API
    /// caller.
    DriverError(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::InUse => write!(f, "item is in use"),
            Error::MissingPeer(detail) => {
                write!(f, "{} is missing peer", detail)
            }
            Error::InvArgument(v) => write!(f, "{}", &v),
            Error::StoreError(v) => write!(f, "store error: {}", &v),
            Error::ProtocolError(v) => write!(f, "protocol error: {}", &v),
            Error::TimeoutError => write!(f, "timeout"),
            Error::OperationError(v) => {
                write!(f, "couldn't complete operation: {}", &v)
            }
            Error::ConfigError(v) => write!(f, "config error: {}", &v),
            Error::ParseError(v) => write!(f, "parse error: {}", &v),
            Error::DriverError(v) => write!(f, "driver error: {}", &v),
        }
    }
}

// Defining these trait implementations allows any code that sends
// requests over an `mpsc` channel and expects the reply in a
// `oneshot` to easily translate the channel errors into a daemon
// error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::ParseError(format!("{}", error))
    }
}
