//! Types and interfaces shared between the IQRF gateway daemon and
//! its external collaborators: the physical radio transport, the
//! JavaScript driver engine, and the repository driver cache. The
//! daemon only ever talks to these through the traits defined here,
//! which also makes every one of them replaceable by a test double.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::time::Duration;

pub mod bus;
pub mod dpa;
pub mod txn;
pub mod types;

pub use types::Error;

/// A `Result` type where the error value is a value from
/// `iqrfd_api::types::Error`.
pub type Result<T> = std::result::Result<T, types::Error>;

/// The physical transport to the coordinator radio (USB/UART/SPI).
/// Confirmation/response framing is already extracted by the
/// implementation; the daemon hands over one request frame and gets
/// back the raw material of the exchange.
///
/// Unsolicited (async) frames are delivered out of band: the
/// implementation is constructed with a channel sender supplied by
/// the exclusive-access coordinator and pushes every frame whose
/// response code carries the async bit onto it.
#[async_trait]
pub trait DpaTransport: Send + Sync {
    /// Runs one request/confirmation/response exchange. The deadline
    /// covers the whole exchange. Implementations report transport
    /// failures through `Err`; an exchange that merely received no
    /// response before the deadline is an `Ok` result with
    /// `response == None`.
    async fn execute(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<txn::TransactionResult>;
}

/// The JavaScript rendering engine holding driver execution
/// contexts. Context ids are 32-bit: non-negative ids are product ids
/// from the store, negative ids form a reserved space for the default
/// context and per-HWPID custom-driver contexts.
pub trait JsRender: Send + Sync {
    /// Loads (or replaces) the code of a context and remembers the
    /// set of standard-driver ids it was built from.
    fn load_context(
        &self,
        context_id: i32,
        code: &str,
        driver_ids: &BTreeSet<i64>,
    ) -> Result<()>;

    /// Routes calls for a node address to a context.
    fn map_address_to_context(&self, address: u8, context_id: i32);

    /// The driver-id set a context was loaded with; `None` when the
    /// context does not exist. Used for reload change detection.
    fn driver_id_set(&self, context_id: i32) -> Option<BTreeSet<i64>>;

    /// Calls a driver function. The context is resolved from the
    /// address mapping, falling back to a per-HWPID custom context
    /// and then to the default context. `params` and the return value
    /// are JSON texts.
    fn call(
        &self,
        address: u16,
        hwpid: u16,
        function: &str,
        params: &str,
    ) -> Result<String>;

    /// Drops every loaded context and address mapping.
    fn clear_contexts(&self);
}

/// One standard driver as published by the repository: JS source for
/// a `(peripheral, version)` pair. The hash is the authoritative
/// equality key when deciding whether a stored copy needs a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct StdDriver {
    pub peripheral: i16,
    pub version: f64,
    pub name: String,
    pub version_flags: i64,
    pub notes: String,
    pub code: String,
    pub hash: String,
}

/// A cache-side package: the exact driver set for a product identity
/// tuple, plus its handler and custom-driver payload.
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub package_id: i64,
    pub hwpid: u16,
    pub hwpid_version: u16,
    pub os_build: u16,
    pub dpa_version: u16,
    pub handler_url: Option<String>,
    pub handler_hash: Option<String>,
    pub notes: Option<String>,
    pub custom_driver: Option<String>,
    pub std_drivers: Vec<StdDriver>,
}

/// A quantity definition from the repository's sensor catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub kind: u8,
    pub name: String,
    pub short_name: String,
    pub unit: String,
    pub decimals: u8,
}

/// The repository cache holding the driver/product catalog. The
/// cache refreshes itself from the repository on its own schedule;
/// the daemon only reads.
pub trait DriverCache: Send + Sync {
    /// Exact package lookup for a product identity tuple.
    fn package(
        &self,
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        dpa_version: u16,
    ) -> Option<Package>;

    /// One standard driver by its identity.
    fn driver(&self, peripheral: i16, version: f64) -> Option<StdDriver>;

    /// The newest published version of one standard driver.
    fn latest_driver(&self, peripheral: i16) -> Option<StdDriver>;

    /// The latest version of every standard driver the repository
    /// publishes for the given OS build and DPA version.
    fn latest_drivers(&self, os_build: u16, dpa_version: u16)
        -> Vec<StdDriver>;

    /// Custom (per-HWPID) drivers published for the given OS build
    /// and DPA version.
    fn custom_drivers(&self, os_build: u16, dpa_version: u16)
        -> Vec<(u16, String)>;

    /// Sensor quantity catalog entry for a sensor type.
    fn quantity(&self, kind: u8) -> Option<Quantity>;
}
