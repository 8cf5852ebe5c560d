//! The network enumerator: walks bonded → discovered → identity →
//! product resolution → standard enumeration, keeps the store in
//! step with the live network, and reloads driver contexts when the
//! bound driver sets change.
//!
//! One pass is an explicit state machine driven by `run_pass`:
//!
//! ```text
//! Start → NetworkCheck → Devices → Products → (Standards?) → Finish
//! ```
//!
//! The enumerator wakes on explicit invocation, on observing a
//! response to a network-altering coordinator command, or on the
//! retry timer after a failed pass.

use crate::config::EnumConfig;
use crate::exclusive::DpaService;
use crate::js::ContextRegistry;
use crate::store::SharedStore;
use iqrfd_api::bus::{BusMessage, BusTx};
use iqrfd_api::dpa::{pcmd, DpaResponse};
use iqrfd_api::{DriverCache, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

mod pass;
mod standards;

use pass::Pass;

/// Wait between retries of a failed pass.
const RETRY_PERIOD: Duration = Duration::from_secs(3);

/// Coordinator commands whose response means the network shape may
/// have changed.
const MUTATING_COMMANDS: &[u8] = &[
    pcmd::COORDINATOR_BOND_NODE,
    pcmd::COORDINATOR_CLEAR_ALL_BONDS,
    pcmd::COORDINATOR_DISCOVERY,
    pcmd::COORDINATOR_REMOVE_BOND,
    pcmd::COORDINATOR_RESTORE,
    pcmd::COORDINATOR_SET_MID,
    pcmd::COORDINATOR_SMART_CONNECT,
];

/// Parameters of one enumeration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumParams {
    /// Re-enumerate devices whose stored identity still matches.
    pub reenumerate: bool,
    /// Run the standards transition.
    pub standards: bool,
}

impl Default for EnumParams {
    fn default() -> Self {
        EnumParams {
            reenumerate: false,
            standards: true,
        }
    }
}

struct Shared {
    notify: Notify,
    params: StdMutex<EnumParams>,
    run: AtomicBool,
    repeat: AtomicBool,
    active: AtomicBool,
    thread_run: AtomicBool,
}

/// Handle other components use to trigger and observe the
/// enumerator.
#[derive(Clone)]
pub struct EnumeratorHandle {
    shared: Arc<Shared>,
}

impl EnumeratorHandle {
    /// Requests a pass. If one is already running, the parameters
    /// are updated in place and the running pass is followed by a
    /// fresh one.
    pub fn invoke(&self, params: EnumParams) {
        *self.shared.params.lock().unwrap() = params;
        self.shared.run.store(true, Ordering::SeqCst);
        self.shared.repeat.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stops the enumeration task; the current pass finishes first.
    pub fn stop(&self) {
        self.shared.thread_run.store(false, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

pub struct Enumerator {
    pub(crate) dpa: DpaService,
    pub(crate) store: SharedStore,
    pub(crate) cache: Arc<dyn DriverCache>,
    pub(crate) registry: ContextRegistry,
    bus_tx: BusTx,
    cfg: EnumConfig,
}

impl Enumerator {
    pub fn new(
        dpa: DpaService,
        store: SharedStore,
        cache: Arc<dyn DriverCache>,
        registry: ContextRegistry,
        bus_tx: BusTx,
        cfg: EnumConfig,
    ) -> Self {
        Enumerator {
            dpa,
            store,
            cache,
            registry,
            bus_tx,
            cfg,
        }
    }

    /// Spawns the enumeration task and the response watcher, and
    /// returns the control handle.
    pub fn start(self: Arc<Self>) -> (EnumeratorHandle, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            notify: Notify::new(),
            params: StdMutex::new(EnumParams {
                reenumerate: true,
                standards: true,
            }),
            run: AtomicBool::new(
                self.cfg.enumerate_on_launch
                    || self.cfg.auto_enumerate_before_invoked,
            ),
            repeat: AtomicBool::new(false),
            active: AtomicBool::new(false),
            thread_run: AtomicBool::new(true),
        });
        let handle = EnumeratorHandle {
            shared: shared.clone(),
        };

        tokio::spawn(watch_responses(
            shared.clone(),
            self.dpa.subscribe_responses(),
        ));

        let task = tokio::spawn(
            self.run(shared).instrument(info_span!("enum")),
        );

        (handle, task)
    }

    async fn run(self: Arc<Self>, shared: Arc<Shared>) {
        info!("starting");

        if let Err(e) = self.load_coordinator_drivers() {
            warn!("failed to load coordinator drivers: {}", e);
        }

        while shared.thread_run.load(Ordering::SeqCst) {
            if shared.run.load(Ordering::SeqCst) {
                let params = *shared.params.lock().unwrap();

                info!(
                    "running enumeration with: reenumerate {} standards {}",
                    params.reenumerate, params.standards
                );
                shared.active.store(true, Ordering::SeqCst);

                match self.run_pass(params).await {
                    Ok(()) => {
                        shared.repeat.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!("enumeration failed: {}", e);
                        shared.repeat.store(true, Ordering::SeqCst);
                    }
                }
                shared.active.store(false, Ordering::SeqCst);
            }

            if !shared.thread_run.load(Ordering::SeqCst) {
                break;
            }

            // Wait for the next invocation, or retry a failed pass
            // after a short pause.

            if shared.repeat.load(Ordering::SeqCst) {
                debug!("enumeration failed, repeating enumeration");

                let _ = tokio::time::timeout(
                    RETRY_PERIOD,
                    shared.notify.notified(),
                )
                .await;
            } else {
                debug!("waiting until next enumeration is invoked");
                shared.notify.notified().await;
            }
        }
    }

    /// Drives one pass through the state machine, claiming and
    /// releasing exclusive access around every phase so on-demand
    /// API traffic can interleave.
    pub(crate) async fn run_pass(&self, params: EnumParams) -> Result<()> {
        let mut pass = Pass::new(params.reenumerate);

        self.send_progress(0, "Enumeration started");
        {
            let access = self.dpa.exclusive().await;

            self.check_network(&access, &mut pass).await?;
        }
        self.send_progress(1, "Network check finished");

        {
            let access = self.dpa.exclusive().await;

            self.send_progress(2, "Device enumeration started");
            self.enumerate_devices(&access, &mut pass).await?;
        }
        self.send_progress(3, "Device enumeration finished");

        {
            let access = self.dpa.exclusive().await;

            self.send_progress(4, "Product enumeration started");
            self.product_enumeration(&access, &mut pass).await?;
        }
        self.update_database(&pass)?;
        self.load_product_drivers()?;
        self.send_progress(5, "Product enumeration finished");

        if params.standards || params.reenumerate {
            let access = self.dpa.exclusive().await;

            self.send_progress(6, "Standards enumeration started");
            self.standard_enumeration(&access, params.reenumerate)
                .await?;
            self.send_progress(7, "Standards enumeration finished");
        }
        self.send_progress(8, "Enumeration finished");
        Ok(())
    }

    /// Builds the default context from the catalog's latest drivers
    /// for the coordinator's OS/DPA pair, plus one context per
    /// published custom driver.
    pub(crate) fn load_coordinator_drivers(&self) -> Result<()> {
        let (os_build, dpa_version) = {
            let store = self.store.lock().unwrap();

            store
                .device_by_address(0)
                .ok()
                .flatten()
                .and_then(|dev| {
                    store.product_by_id(dev.product_id).ok().flatten()
                })
                .map(|p| (p.os_build, p.dpa_version))
                .unwrap_or((0, 0))
        };
        let drivers = self.cache.latest_drivers(os_build, dpa_version);

        if drivers.is_empty() {
            warn!(
                "failed to load drivers for OS {:04X}, DPA {:04X}",
                os_build, dpa_version
            );
            return Ok(());
        }

        let customs = self.cache.custom_drivers(os_build, dpa_version);

        self.registry.load_default_context(&drivers, &customs)
    }

    // Progress reports are advisory; a congested bus drops them
    // rather than stalling the pass.

    fn send_progress(&self, step: u8, text: &str) {
        use crate::dispatch::set_pointer;

        let mut doc = json!({ "mType": "iqrfNetworkEnum_EnumerateAsync" });

        set_pointer(
            &mut doc,
            "/data/msgId",
            json!("iqrf_network_enumeration_async"),
        );
        set_pointer(&mut doc, "/data/rsp/step", json!(step));
        set_pointer(&mut doc, "/data/rsp/stepStr", json!(text));
        set_pointer(&mut doc, "/data/status", json!(0));
        set_pointer(&mut doc, "/data/statusStr", json!("ok"));

        if self.bus_tx.try_send(BusMessage::broadcast(doc)).is_err() {
            debug!("bus congested; dropping progress report");
        }
    }
}

// Watches every graded response for the coordinator commands that
// alter the network, and schedules a pass when one goes by.

async fn watch_responses(
    shared: Arc<Shared>,
    mut tap: broadcast::Receiver<Vec<u8>>,
) {
    while shared.thread_run.load(Ordering::SeqCst) {
        match tap.recv().await {
            Ok(frame) => analyze_response(&shared, &frame),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn analyze_response(shared: &Shared, frame: &[u8]) {
    let Ok(rsp) = DpaResponse::parse(frame) else {
        return;
    };

    if rsp.asynchronous || rsp.nadr != 0 || rsp.pnum != 0 {
        return;
    }

    let command = rsp.pcmd & 0x7F;

    if MUTATING_COMMANDS.contains(&command) {
        info!("automatic enumeration invoked by pcmd {}", command);
        shared.run.store(true, Ordering::SeqCst);
        shared.repeat.store(true, Ordering::SeqCst);
        shared.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{
        ScriptedTransport, SimCoordinator, SimNode, StubCache, StubRender,
    };
    use iqrfd_api::Package;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn node_package() -> Package {
        Package {
            package_id: 7,
            hwpid: 0x0002,
            hwpid_version: 2,
            os_build: 0x08d8,
            dpa_version: 0x0302,
            handler_url: None,
            handler_hash: None,
            notes: None,
            custom_driver: None,
            std_drivers: vec![
                StubCache::std_driver(2, 1.0),
                StubCache::std_driver(94, 1.0),
            ],
        }
    }

    fn coordinator_package() -> Package {
        Package {
            package_id: 1,
            hwpid: 0,
            hwpid_version: 0,
            os_build: 0x08d8,
            dpa_version: 0x0414,
            std_drivers: vec![StubCache::std_driver(2, 1.0)],
            ..Package::default()
        }
    }

    struct Rig {
        enumerator: Arc<Enumerator>,
        sim: Arc<SimCoordinator>,
        store: SharedStore,
        _bus_rx: mpsc::Receiver<BusMessage>,
    }

    fn rig() -> Rig {
        let sim = Arc::new(SimCoordinator::new());
        let dpa = DpaService::new(sim.clone());
        let store: SharedStore =
            Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let cache = Arc::new(StubCache::new());

        cache.add_package(node_package());
        cache.add_package(coordinator_package());
        cache.add_driver(StubCache::std_driver(2, 1.0));
        cache.add_driver(StubCache::std_driver(94, 1.0));

        let registry = ContextRegistry::new(
            Arc::new(StubRender::new()),
            String::from("/* wrapper */"),
        );
        let (bus_tx, bus_rx) = mpsc::channel(64);
        let enumerator = Arc::new(Enumerator::new(
            dpa,
            store.clone(),
            cache,
            registry,
            bus_tx,
            EnumConfig::default(),
        ));

        Rig {
            enumerator,
            sim,
            store,
            _bus_rx: bus_rx,
        }
    }

    fn sensor_node(mid: u32) -> SimNode {
        SimNode {
            mid,
            sensors: vec![0x01],
            ..SimNode::default()
        }
    }

    #[tokio::test]
    async fn test_pass_creates_devices() {
        // Scenario: bonded {1, 2}, discovered {1}, coordinator DPA
        // below 4.02 so each node is polled. After the pass the
        // store holds both devices with the right flags and
        // identities.

        let rig = rig();

        rig.sim.set_coordinator_dpa(0x0302);
        rig.sim.bond(1, sensor_node(0xaabb));
        rig.sim.bond(2, sensor_node(0xccdd));
        rig.sim.discover(1, 1, 0, 0);

        rig.enumerator
            .run_pass(EnumParams {
                reenumerate: false,
                standards: false,
            })
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();
        let one = store.device_by_address(1).unwrap().unwrap();
        let two = store.device_by_address(2).unwrap().unwrap();

        assert!(one.discovered);
        assert_eq!(one.mid, 0xaabb);
        assert_eq!(one.vrn, 1);
        assert!(!two.discovered);
        assert_eq!(two.mid, 0xccdd);
        assert!(two.parent.is_none());

        // The coordinator is a device too, and both nodes share one
        // product row.

        assert!(store.device_by_address(0).unwrap().is_some());
        assert_eq!(one.product_id, two.product_id);

        let product =
            store.product_by_id(one.product_id).unwrap().unwrap();

        assert_eq!(product.hwpid, 0x0002);
        assert_eq!(product.os_build, 0x08d8);
        assert_eq!(product.os_version.as_deref(), Some("4.03D"));
    }

    #[tokio::test]
    async fn test_frc_enumeration_path() {
        // With a capable coordinator and more than one node, the
        // identities come from the batched FRC sweeps and must match
        // what polling would have produced.

        let rig = rig();

        rig.sim.bond(1, sensor_node(0xaabb));
        rig.sim.bond(2, sensor_node(0xccdd));
        rig.sim.bond(
            3,
            SimNode {
                mid: 0xeeff,
                online: false,
                ..SimNode::default()
            },
        );

        rig.enumerator
            .run_pass(EnumParams {
                reenumerate: false,
                standards: false,
            })
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();
        let one = store.device_by_address(1).unwrap().unwrap();
        let product = store.product_by_id(one.product_id).unwrap().unwrap();

        assert_eq!(product.hwpid, 0x0002);
        assert_eq!(product.hwpid_version, 2);
        assert_eq!(product.os_build, 0x08d8);
        assert_eq!(product.os_version.as_deref(), Some("4.03D"));
        assert_eq!(product.dpa_version, 0x0302);

        // The offline node was dropped by the FRC ping and never
        // made it into the store.

        assert!(store.device_by_address(3).unwrap().is_none());

        // The ping and the three identity sweeps all went on air.

        let frc_frames: Vec<_> = rig
            .sim
            .executed()
            .iter()
            .filter(|frame| frame.get(2) == Some(&0x0d))
            .cloned()
            .collect();

        assert!(frc_frames.len() >= 4);
    }

    #[tokio::test]
    async fn test_standards_and_sensor_inventory() {
        let rig = rig();

        rig.sim.bond(
            1,
            SimNode {
                sensors: vec![0x01, 0x01, 0x04],
                binouts: Some(3),
                ..SimNode::default()
            },
        );

        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();
        let device = store.device_by_address(1).unwrap().unwrap();

        assert!(device.enumerated);

        let mounts = store.device_sensors(1).unwrap();

        assert_eq!(mounts.len(), 3);

        // Dense global indexes; per-type indexes dense within the
        // type.

        assert_eq!(mounts[0].global_index, 0);
        assert_eq!(mounts[0].type_index, 0);
        assert_eq!(mounts[1].kind, 0x01);
        assert_eq!(mounts[1].type_index, 1);
        assert_eq!(mounts[2].kind, 0x04);
        assert_eq!(mounts[2].type_index, 0);
    }

    #[tokio::test]
    async fn test_noncertified_product_binds_latest_drivers() {
        // HWPID with the low nibble 0xF: no package lookup; the
        // latest catalog driver of every declared peripheral binds
        // instead.

        let rig = rig();

        rig.sim.bond(
            1,
            SimNode {
                hwpid: 0x123f,
                ..SimNode::default()
            },
        );

        rig.enumerator
            .run_pass(EnumParams {
                reenumerate: false,
                standards: false,
            })
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();
        let device = store.device_by_address(1).unwrap().unwrap();
        let drivers = store.product_driver_ids(device.product_id).unwrap();
        let os_driver = store
            .driver_by_peripheral_version(2, 1.0)
            .unwrap()
            .unwrap();

        // The simulated node declares the OS peripheral; the catalog
        // only publishes drivers for peripherals 2 and 94, and the
        // node doesn't declare 94.

        assert!(drivers.contains(&os_driver.id));
        assert!(!drivers.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_passes() {
        // Two consecutive passes without a network change must not
        // change a single row.

        let rig = rig();

        rig.sim.bond(1, sensor_node(0xaabb));
        rig.sim.bond(2, sensor_node(0xccdd));

        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let (devices, drivers_map, mounts) = {
            let store = rig.store.lock().unwrap();

            (
                store.devices().unwrap(),
                store.products_drivers_map().unwrap(),
                store.device_sensors(1).unwrap(),
            )
        };

        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();

        assert_eq!(store.devices().unwrap(), devices);
        assert_eq!(store.products_drivers_map().unwrap(), drivers_map);
        assert_eq!(store.device_sensors(1).unwrap(), mounts);
    }

    #[tokio::test]
    async fn test_mid_rebind_updates_in_place() {
        // A MID change under a fixed address updates the row; it
        // never deletes and recreates it.

        let rig = rig();

        rig.sim.bond(1, sensor_node(0xaabb));
        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let before = {
            let store = rig.store.lock().unwrap();

            store.device_by_address(1).unwrap().unwrap()
        };

        rig.sim.set_node_mid(1, 0xfeed);
        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();
        let after = store.device_by_address(1).unwrap().unwrap();

        assert_eq!(after.id, before.id);
        assert_eq!(after.mid, 0xfeed);
    }

    #[tokio::test]
    async fn test_shrunken_network_deletes_devices() {
        let rig = rig();

        rig.sim.bond(1, sensor_node(0xaabb));
        rig.sim.bond(2, sensor_node(0xccdd));
        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        rig.sim.unbond(2);
        rig.enumerator
            .run_pass(EnumParams::default())
            .await
            .unwrap();

        let store = rig.store.lock().unwrap();

        assert!(store.device_by_address(1).unwrap().is_some());
        assert!(store.device_by_address(2).unwrap().is_none());

        // Cascade took the capability rows with it.

        assert!(store.device_sensors(2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_read_failure_aborts_pass() {
        let transport = Arc::new(ScriptedTransport::new());
        let store: SharedStore =
            Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let (bus_tx, _bus_rx) = mpsc::channel(64);
        let enumerator = Enumerator::new(
            DpaService::new(transport),
            store,
            Arc::new(StubCache::new()),
            ContextRegistry::new(Arc::new(StubRender::new()), String::new()),
            bus_tx,
            EnumConfig::default(),
        );

        // No scripted responses: the bonded-devices read fails and
        // the whole pass aborts.

        assert!(enumerator
            .run_pass(EnumParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_trigger_on_mutating_command() {
        let rig = rig();
        let shared = Arc::new(Shared {
            notify: Notify::new(),
            params: StdMutex::new(EnumParams::default()),
            run: AtomicBool::new(false),
            repeat: AtomicBool::new(false),
            active: AtomicBool::new(false),
            thread_run: AtomicBool::new(true),
        });

        // A BondNode response flips the run flag...

        let frame =
            vec![0x00, 0x00, 0x00, 0x84, 0xff, 0xff, 0x00, 0x00, 0x01, 0x01];

        analyze_response(&shared, &frame);
        assert!(shared.run.load(Ordering::SeqCst));

        // ...but an unrelated coordinator response does not.

        shared.run.store(false, Ordering::SeqCst);

        let frame = vec![0x00, 0x00, 0x00, 0x82, 0xff, 0xff, 0x00, 0x00];

        analyze_response(&shared, &frame);
        assert!(!shared.run.load(Ordering::SeqCst));

        drop(rig);
    }
}
