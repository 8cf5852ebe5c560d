//! The single-writer gate over the physical radio and the DPA
//! transaction machine built on top of it.
//!
//! Every on-air exchange goes through one `DpaService`. One-shot
//! callers (the request handlers) use [`DpaService::execute`], which
//! serializes internally. Long-running consumers (the enumerator and
//! the sensor reader) take an [`ExclusiveAccess`] guard and must drop
//! it between independent units of work so on-demand API calls can
//! interleave.

use iqrfd_api::dpa::DpaRequest;
use iqrfd_api::txn::{default_timeout, TransactionResult, TxnStatus};
use iqrfd_api::{dpa, DpaTransport, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::time::Duration;
use tracing::{debug, warn};

const RESPONSE_TAP_SIZE: usize = 32;

struct Inner {
    transport: Arc<dyn DpaTransport>,
    gate: Arc<Mutex<()>>,
    exclusive_held: AtomicBool,
    aborted: watch::Sender<bool>,
    response_tap: broadcast::Sender<Vec<u8>>,
}

impl Inner {
    // Runs one transaction while the caller holds the gate. The
    // transport reports the raw exchange; this translates it into
    // the outcome taxonomy.

    async fn run(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
    ) -> TransactionResult {
        let frame = req.to_bytes();
        let timeout = timeout.unwrap_or_else(|| default_timeout(req));
        let mut aborted = self.aborted.subscribe();

        if *aborted.borrow() {
            return TransactionResult::failed(
                frame,
                TxnStatus::Aborted,
                "aborted",
            );
        }

        let outcome = tokio::select! {
            res = self.transport.execute(&frame, timeout) => res,
            _ = aborted.changed() => {
                // The on-air packet is not recalled; its response, if
                // any, is discarded by the transport.

                return TransactionResult::failed(
                    frame,
                    TxnStatus::Aborted,
                    "aborted",
                );
            }
        };

        match outcome {
            Err(Error::TimeoutError) => TransactionResult::failed(
                frame,
                TxnStatus::Timeout,
                "timeout",
            ),
            Err(e) => TransactionResult::failed(
                frame,
                TxnStatus::Fail,
                format!("{}", e),
            ),
            Ok(mut result) => {
                self.grade(req, &mut result);
                result
            }
        }
    }

    // Fills in the outcome of a completed exchange.

    fn grade(&self, req: &DpaRequest, result: &mut TransactionResult) {
        let Some(bytes) = result.response.clone() else {
            // The deadline elapsed without a response frame. Routed
            // traffic that at least confirmed is distinguishable from
            // a dead exchange.

            result.set_status(if result.confirmed() {
                TxnStatus::NoResponse
            } else {
                TxnStatus::Timeout
            });
            return;
        };

        match dpa::DpaResponse::parse(&bytes) {
            Ok(rsp) => {
                if let Err(e) = rsp.check_against(req) {
                    result.status = TxnStatus::BadResponse;
                    result.error_str = format!("{}", e);
                } else if rsp.rcode != 0 && !rsp.asynchronous {
                    result.status = TxnStatus::Rcode(rsp.rcode);
                    result.error_str = format!("rcode {}", rsp.rcode);
                } else {
                    result.set_status(TxnStatus::Ok);
                }

                // Observers (the enumerator watches for mutating
                // coordinator commands) see every graded response.

                let _ = self.response_tap.send(bytes);
            }
            Err(e) => {
                result.status = TxnStatus::BadResponse;
                result.error_str = format!("{}", e);
            }
        }
    }

    async fn run_repeat(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
        retries: u8,
    ) -> TransactionResult {
        // An FRC re-run would re-aggregate the network, so FRC
        // requests get exactly one attempt.

        let attempts = if req.is_frc() { 1 } else { retries.max(1) };
        let mut result =
            TransactionResult::failed(req.to_bytes(), TxnStatus::Aborted, "");

        for attempt in 0..attempts {
            result = self.run(req, timeout).await;

            if result.status.is_ok() || result.status == TxnStatus::Aborted {
                break;
            }

            if attempt + 1 < attempts {
                debug!(
                    "transaction failed ({}), retrying",
                    &result.error_str
                );
            }
        }
        result
    }
}

/// Handle to the transaction machine. Clones share the gate.
#[derive(Clone)]
pub struct DpaService {
    inner: Arc<Inner>,
}

impl DpaService {
    pub fn new(transport: Arc<dyn DpaTransport>) -> Self {
        let (aborted, _) = watch::channel(false);
        let (response_tap, _) = broadcast::channel(RESPONSE_TAP_SIZE);

        DpaService {
            inner: Arc::new(Inner {
                transport,
                gate: Arc::new(Mutex::new(())),
                exclusive_held: AtomicBool::new(false),
                aborted,
                response_tap,
            }),
        }
    }

    /// Runs one transaction, waiting for the gate. `timeout` of
    /// `None` picks the default for the request's scope.
    pub async fn execute(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
    ) -> TransactionResult {
        let _gate = self.inner.gate.lock().await;

        self.inner.run(req, timeout).await
    }

    /// Like [`execute`](Self::execute) but re-runs the whole
    /// exchange up to `retries` times on failure. FRC requests are
    /// never retried.
    pub async fn execute_repeat(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
        retries: u8,
    ) -> TransactionResult {
        let _gate = self.inner.gate.lock().await;

        self.inner.run_repeat(req, timeout, retries).await
    }

    /// Claims exclusive access, waiting at most `wait` for the
    /// current holder to release.
    pub async fn try_exclusive(
        &self,
        wait: Duration,
    ) -> Result<ExclusiveAccess> {
        match tokio::time::timeout(
            wait,
            self.inner.gate.clone().lock_owned(),
        )
        .await
        {
            Ok(guard) => {
                self.inner.exclusive_held.store(true, Ordering::SeqCst);
                debug!("exclusive access acquired");
                Ok(ExclusiveAccess {
                    inner: self.inner.clone(),
                    _guard: guard,
                })
            }
            Err(_) => Err(Error::InUse),
        }
    }

    /// Claims exclusive access, waiting as long as it takes.
    pub async fn exclusive(&self) -> ExclusiveAccess {
        let guard = self.inner.gate.clone().lock_owned();
        let guard = guard.await;

        self.inner.exclusive_held.store(true, Ordering::SeqCst);
        debug!("exclusive access acquired");
        ExclusiveAccess {
            inner: self.inner.clone(),
            _guard: guard,
        }
    }

    /// Whether some long-running consumer currently holds exclusive
    /// access.
    pub fn has_exclusive_access(&self) -> bool {
        self.inner.exclusive_held.load(Ordering::SeqCst)
    }

    /// Every graded response frame, in completion order. Lagging
    /// subscribers lose the oldest entries.
    pub fn subscribe_responses(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.response_tap.subscribe()
    }

    /// Transitions every pending and future transaction to
    /// `ABORTED`. Called on component teardown.
    pub fn abort_all(&self) {
        warn!("aborting pending transactions");

        let _ = self.inner.aborted.send(true);
    }
}

/// The opaque handle of the single logical owner of the radio.
/// Dropping it releases access.
pub struct ExclusiveAccess {
    inner: Arc<Inner>,
    _guard: OwnedMutexGuard<()>,
}

impl ExclusiveAccess {
    pub async fn execute(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
    ) -> TransactionResult {
        self.inner.run(req, timeout).await
    }

    pub async fn execute_repeat(
        &self,
        req: &DpaRequest,
        timeout: Option<Duration>,
        retries: u8,
    ) -> TransactionResult {
        self.inner.run_repeat(req, timeout, retries).await
    }
}

impl Drop for ExclusiveAccess {
    fn drop(&mut self) {
        self.inner.exclusive_held.store(false, Ordering::SeqCst);

        debug!("exclusive access released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use iqrfd_api::dpa::{pcmd, pnum};

    fn os_read_req() -> DpaRequest {
        DpaRequest::new(0, pnum::OS, pcmd::OS_READ)
    }

    fn os_read_rsp() -> Vec<u8> {
        vec![
            0x00, 0x00, 0x02, 0x80, 0xff, 0xff, 0x00, 0x00, 0x04, 0x03, 0x02,
            0x01, 0x43, 0x04, 0xd8, 0x08, 0x00, 0x30,
        ]
    }

    #[tokio::test]
    async fn test_successful_transaction() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_response(os_read_rsp());

        let dpa = DpaService::new(transport.clone());
        let result = dpa.execute(&os_read_req(), None).await;

        assert_eq!(result.status, TxnStatus::Ok);
        assert!(result.responded());
        assert_eq!(transport.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_and_rcode() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_no_response();
        transport.push_response(vec![
            0x00, 0x00, 0x02, 0x80, 0xff, 0xff, 0x04, 0x00,
        ]);

        let dpa = DpaService::new(transport.clone());

        let result = dpa.execute(&os_read_req(), None).await;

        assert_eq!(result.status, TxnStatus::Timeout);

        let result = dpa.execute(&os_read_req(), None).await;

        assert_eq!(result.status, TxnStatus::Rcode(4));
        assert_eq!(result.status.code(), 4);
    }

    #[tokio::test]
    async fn test_bad_response_addressing() {
        let transport = Arc::new(ScriptedTransport::new());

        // Response for a different node address.

        transport.push_response(vec![
            0x05, 0x00, 0x02, 0x80, 0xff, 0xff, 0x00, 0x00,
        ]);

        let dpa = DpaService::new(transport.clone());
        let result = dpa.execute(&os_read_req(), None).await;

        assert_eq!(result.status, TxnStatus::BadResponse);
    }

    #[tokio::test]
    async fn test_retries_rerun_whole_exchange() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_no_response();
        transport.push_response(os_read_rsp());

        let dpa = DpaService::new(transport.clone());
        let result = dpa.execute_repeat(&os_read_req(), None, 2).await;

        assert_eq!(result.status, TxnStatus::Ok);
        assert_eq!(transport.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_frc_never_retried() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_no_response();
        transport.push_no_response();

        let dpa = DpaService::new(transport.clone());
        let req = crate::dpa::embed::frc_ping();
        let result = dpa.execute_repeat(&req, None, 3).await;

        assert_ne!(result.status, TxnStatus::Ok);
        assert_eq!(transport.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_mutual_exclusion() {
        let transport = Arc::new(ScriptedTransport::new());

        for _ in 0..20 {
            transport.push_response_delayed(os_read_rsp(), 5);
        }

        let dpa = DpaService::new(transport.clone());
        let mut tasks = vec![];

        for _ in 0..4 {
            let dpa = dpa.clone();

            tasks.push(tokio::spawn(async move {
                let access = dpa.exclusive().await;

                for _ in 0..5 {
                    let result =
                        access.execute(&os_read_req(), None).await;

                    assert_eq!(result.status, TxnStatus::Ok);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        // No two holders' transactions may overlap on the radio.

        assert_eq!(transport.max_in_flight(), 1);
        assert_eq!(transport.executed().len(), 20);
    }

    #[tokio::test]
    async fn test_exclusive_unavailable() {
        let transport = Arc::new(ScriptedTransport::new());
        let dpa = DpaService::new(transport);
        let held = dpa.try_exclusive(Duration::from_millis(10)).await.unwrap();

        assert!(dpa.has_exclusive_access());
        assert!(dpa
            .try_exclusive(Duration::from_millis(10))
            .await
            .is_err());

        drop(held);
        assert!(!dpa.has_exclusive_access());
        assert!(dpa
            .try_exclusive(Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_abort() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_response_delayed(os_read_rsp(), 5_000);

        let dpa = DpaService::new(transport);
        let worker = {
            let dpa = dpa.clone();

            tokio::spawn(
                async move { dpa.execute(&os_read_req(), None).await },
            )
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        dpa.abort_all();

        let result = worker.await.unwrap();

        assert_eq!(result.status, TxnStatus::Aborted);
    }
}
