//! The driver-backed message dispatcher: routes inbound API
//! requests to the handler for their message family, renders
//! requests and responses through the driver contexts, and publishes
//! the response envelopes back to the messaging splitter.

use crate::enumerate::{EnumParams, EnumeratorHandle};
use crate::exclusive::DpaService;
use crate::js::ContextRegistry;
use crate::sensordata::SensorData;
use crate::store::SharedStore;
use iqrfd_api::bus::{ApiRequest, BusMessage, BusTx};
use iqrfd_api::{Error, Result};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, info_span, warn};
use tracing_futures::Instrument;

mod asyncmsg;
mod db;
mod envelope;
mod frc;
mod mtype;
mod raw;
mod standard;

pub use envelope::{set_pointer, Envelope};

/// Service-level status codes, used when the failure happened before
/// any transaction could be graded.
pub const STATUS_PARSE_ERROR: i32 = 1001;
pub const STATUS_EXCLUSIVE_ACCESS: i32 = 1002;
pub const STATUS_NOT_RUNNING: i32 = 1003;
pub const STATUS_READING_IN_PROGRESS: i32 = 1004;
pub const STATUS_CONFIG_FAILURE: i32 = 1005;

// Caller-supplied deadline (milliseconds) from the request document.

pub(crate) fn doc_timeout(doc: &Value) -> Option<Duration> {
    doc.pointer("/data/timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
}

// Caller-requested retransmission count. The transaction machine
// ignores it for FRC requests.

pub(crate) fn doc_repeat(doc: &Value) -> u8 {
    doc.pointer("/data/repeat")
        .and_then(Value::as_u64)
        .map(|n| n.min(10) as u8)
        .unwrap_or(1)
}

pub struct Dispatcher {
    pub(crate) dpa: DpaService,
    pub(crate) registry: ContextRegistry,
    pub(crate) store: SharedStore,
    pub(crate) bus_tx: BusTx,
    pub(crate) metadata_to_messages: bool,
    pub(crate) async_dpa_message: bool,
    pub(crate) async_counter: AtomicU32,
    enumerator: Option<EnumeratorHandle>,
    sensor_data: Option<Arc<SensorData>>,
}

impl Dispatcher {
    pub fn new(
        dpa: DpaService,
        registry: ContextRegistry,
        store: SharedStore,
        bus_tx: BusTx,
    ) -> Self {
        Dispatcher {
            dpa,
            registry,
            store,
            bus_tx,
            metadata_to_messages: false,
            async_dpa_message: false,
            async_counter: AtomicU32::new(0),
            enumerator: None,
            sensor_data: None,
        }
    }

    pub fn with_metadata_to_messages(mut self, enabled: bool) -> Self {
        self.metadata_to_messages = enabled;
        self
    }

    pub fn with_async_dpa_message(mut self, enabled: bool) -> Self {
        self.async_dpa_message = enabled;
        self
    }

    pub fn with_enumerator(mut self, handle: EnumeratorHandle) -> Self {
        self.enumerator = Some(handle);
        self
    }

    pub fn with_sensor_data(mut self, sensor_data: Arc<SensorData>) -> Self {
        self.sensor_data = Some(sensor_data);
        self
    }

    /// Consumes inbound requests and unsolicited frames until both
    /// channels close.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ApiRequest>,
        mut async_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Infallible> {
        info!("starting");

        loop {
            tokio::select! {
                Some(req) = rx.recv() => {
                    let messaging = req.messaging.clone();
                    let doc = self
                        .handle_request(req)
                        .instrument(info_span!("api_req"))
                        .await;

                    if self
                        .bus_tx
                        .send(BusMessage::to(messaging, doc))
                        .await
                        .is_err()
                    {
                        warn!("splitter exited before a reply could be sent");
                    }
                }
                Some(frame) = async_rx.recv() => {
                    for doc in asyncmsg::handle(&self, &frame) {
                        if self
                            .bus_tx
                            .send(BusMessage::broadcast(doc))
                            .await
                            .is_err()
                        {
                            warn!("splitter exited; dropping async message");
                        }
                    }
                }
                else => break,
            }
        }

        const ERR_MSG: &str = "request channels closed";

        warn!(ERR_MSG);
        Err(Error::MissingPeer(ERR_MSG.to_string()))
    }

    /// Routes one request to its family handler and returns the
    /// response envelope.
    pub async fn handle_request(&self, req: ApiRequest) -> Value {
        match req.mtype.as_str() {
            "iqrfRaw" => raw::handle_raw(self, &req).await,
            "iqrfRawHdp" => raw::handle_raw_hdp(self, &req).await,
            "iqrfNetworkEnum_Enumerate" => self.handle_enumerate(&req),
            m if m.starts_with("iqrfDb_") => db::handle(self, &req),
            m if m.starts_with("iqrfSensorData_") => {
                match &self.sensor_data {
                    Some(sensor_data) => {
                        sensor_data.handle_command(&req).await
                    }
                    None => error_response(
                        &req,
                        STATUS_NOT_RUNNING,
                        "sensor data component not present",
                    ),
                }
            }
            m if mtype::FRC_STANDARD_TYPES.contains(&m) => {
                frc::handle(self, &req).await
            }
            m if mtype::driver_function(m).is_some() => {
                standard::handle(self, &req).await
            }
            other => error_response(
                &req,
                STATUS_PARSE_ERROR,
                &format!("unsupported message type: {}", other),
            ),
        }
    }

    fn handle_enumerate(&self, req: &ApiRequest) -> Value {
        let Some(enumerator) = &self.enumerator else {
            return error_response(
                req,
                STATUS_NOT_RUNNING,
                "enumerator not present",
            );
        };

        let params = EnumParams {
            reenumerate: req
                .doc
                .pointer("/data/req/reenumerate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            standards: req
                .doc
                .pointer("/data/req/standards")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };

        enumerator.invoke(params);

        // Ack echoes the request parameters.

        let mut doc = json!({ "mType": req.mtype });

        envelope::set_pointer(&mut doc, "/data/msgId", json!(req.msg_id()));
        envelope::set_pointer(
            &mut doc,
            "/data/rsp",
            req.doc
                .pointer("/data/req")
                .cloned()
                .unwrap_or_else(|| json!({})),
        );
        envelope::set_pointer(&mut doc, "/data/status", json!(0));
        envelope::set_pointer(&mut doc, "/data/statusStr", json!("ok"));
        doc
    }

    // Schedules a full re-enumeration; the database reset path uses
    // this to rebuild the model.

    pub(crate) fn invoke_enumeration(&self) {
        if let Some(enumerator) = &self.enumerator {
            enumerator.invoke(EnumParams {
                reenumerate: true,
                standards: true,
            });
        }
    }

    // Attaches the stored device metadata when the feature is on.

    pub(crate) fn attach_metadata(&self, env: &mut Envelope, nadr: u16) {
        if !self.metadata_to_messages || nadr > 255 {
            return;
        }

        match self.store.lock().unwrap().device_metadata(nadr as u8) {
            Ok(metadata) => env.set_metadata(metadata),
            Err(e) => warn!("{}", e),
        }
    }
}

/// A minimal error envelope for requests that never reached a family
/// handler.
fn error_response(req: &ApiRequest, status: i32, status_str: &str) -> Value {
    let mut doc = json!({ "mType": req.mtype });

    envelope::set_pointer(&mut doc, "/data/msgId", json!(req.msg_id()));
    envelope::set_pointer(&mut doc, "/data/status", json!(status));
    envelope::set_pointer(&mut doc, "/data/statusStr", json!(status_str));
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{
        async_sensor_frame, ScriptedTransport, SimCoordinator, SimNode,
        StubRender,
    };
    use iqrfd_api::bus::MessagingInstance;
    use iqrfd_api::DpaTransport;
    use std::sync::Mutex;

    fn dispatcher(
        transport: Arc<dyn DpaTransport>,
    ) -> (Arc<Dispatcher>, mpsc::Receiver<BusMessage>) {
        let dpa = DpaService::new(transport);
        let registry = ContextRegistry::new(
            Arc::new(StubRender::new()),
            String::new(),
        );
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let (bus_tx, bus_rx) = mpsc::channel(10);

        (
            Arc::new(Dispatcher::new(dpa, registry, store, bus_tx)),
            bus_rx,
        )
    }

    fn api_request(doc: Value) -> ApiRequest {
        ApiRequest::new(MessagingInstance::new("test", "test"), doc)
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let (ctx, _bus) = dispatcher(Arc::new(ScriptedTransport::new()));
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfNothing_Known",
                "data": {"msgId": "u1"}
            })))
            .await;

        assert_eq!(rsp["data"]["status"], STATUS_PARSE_ERROR);
        assert_eq!(rsp["data"]["msgId"], "u1");
    }

    #[tokio::test]
    async fn test_raw_echo() {
        // Scenario: raw OS read to the coordinator with a canned
        // response; the envelope must echo the stub bytes.

        let transport = Arc::new(ScriptedTransport::new());
        let stub = "00.00.04.80.ff.ff.00.00.d8.08.43.04.00.00.00.00.00";

        transport
            .push_response(iqrfd_api::dpa::parse_hex(stub).unwrap());

        let (ctx, _bus) = dispatcher(transport);
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfRaw",
                "data": {
                    "msgId": "r1",
                    "req": {"rData": "00.00.04.00.ff.ff.00.00"},
                    "returnVerbose": true,
                }
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);
        assert_eq!(rsp["data"]["rsp"]["rData"], stub);

        let raw = rsp["data"]["raw"].as_array().unwrap();

        assert_eq!(raw[0]["request"], "00.00.04.00.ff.ff.00.00");
        assert_eq!(raw[0]["response"], stub);
    }

    #[tokio::test]
    async fn test_raw_hdp() {
        let transport = Arc::new(ScriptedTransport::new());

        transport.push_response(vec![
            0x01, 0x00, 0x02, 0x80, 0x02, 0x00, 0x00, 0x35, 0xaa, 0xbb,
        ]);

        let (ctx, _bus) = dispatcher(transport);
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfRawHdp",
                "data": {
                    "msgId": "h1",
                    "req": {"nAdr": 1, "pNum": 2, "pCmd": 0},
                }
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);
        assert_eq!(rsp["data"]["rsp"]["pnum"], 2);
        assert_eq!(rsp["data"]["rsp"]["pcmd"], 0x80);
        assert_eq!(rsp["data"]["rsp"]["pData"], json!([0xaa, 0xbb]));
    }

    #[tokio::test]
    async fn test_embed_os_read_through_driver() {
        // Scenario: the OS read fixture must decode to the
        // human-readable version strings.

        let sim = Arc::new(SimCoordinator::new());

        sim.bond(1, SimNode::default());

        let (ctx, _bus) = dispatcher(sim);
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfEmbedOs_Read",
                "data": {"msgId": "o1", "req": {"nAdr": 1, "param": {}}}
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);

        let result = &rsp["data"]["rsp"]["result"];

        assert_eq!(result["osVersion"], "4.03D");
        assert_eq!(result["osBuild"], "08D8");
    }

    #[tokio::test]
    async fn test_bonded_devices_empty_then_bonded() {
        // Scenario: coordinator-only network first reports no bonded
        // devices; after a bond of address 1 the list is [1].

        let sim = Arc::new(SimCoordinator::new());
        let (ctx, _bus) = dispatcher(sim.clone());
        let request = json!({
            "mType": "iqrfEmbedCoordinator_BondedDevices",
            "data": {"msgId": "b1", "req": {"nAdr": 0, "param": {}}}
        });

        let rsp = ctx.handle_request(api_request(request.clone())).await;

        assert_eq!(rsp["data"]["status"], 0);
        assert_eq!(
            rsp["data"]["rsp"]["result"]["bondedDevices"],
            json!([])
        );

        sim.bond(
            1,
            SimNode {
                mid: 0x01020304,
                ..SimNode::default()
            },
        );

        let rsp = ctx.handle_request(api_request(request)).await;

        assert_eq!(
            rsp["data"]["rsp"]["result"]["bondedDevices"],
            json!([1])
        );
    }

    #[tokio::test]
    async fn test_driver_request_failure() {
        // The stub engine knows no LED driver; the envelope must
        // carry the driver failure with the trace-parity mapping.

        let (ctx, _bus) = dispatcher(Arc::new(ScriptedTransport::new()));
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfEmbedLedr_Pulse",
                "data": {"msgId": "l1", "req": {"nAdr": 3, "param": {}}}
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 1000);
        assert!(rsp["data"]["rsp"]["errorStr"]
            .as_str()
            .unwrap()
            .contains("unknown driver function"));
        assert_eq!(rsp["data"]["rsp"]["pnum"], 6);
        assert_eq!(rsp["data"]["rsp"]["pcmd"], 0x83);
    }

    #[tokio::test]
    async fn test_read_sensors_persists_values() {
        // A successful ReadSensorsWithTypes writes fresh samples to
        // the mounted slots.

        let transport = Arc::new(ScriptedTransport::new());

        transport.push_response(vec![
            0x01, 0x00, 0x5e, 0x81, 0xff, 0xff, 0x00, 0x00, 0x01, 0x68,
            0x01,
        ]);

        let (ctx, _bus) = dispatcher(transport);

        {
            let store = ctx.store.lock().unwrap();
            let pid = store
                .insert_product(&crate::store::Product::new(
                    2, 2, 0x08d8, "4.03D", 0x0302,
                ))
                .unwrap();

            store
                .insert_device(&crate::store::Device::new(
                    1, true, 0xaabb, 0, 0, None, pid,
                ))
                .unwrap();

            let sid = store
                .insert_sensor(&crate::store::Sensor {
                    id: 0,
                    kind: 0x01,
                    name: String::from("Temperature"),
                    short_name: String::from("t"),
                    unit: Some(String::from("°C")),
                    decimals: 4,
                    frc_2bit: false,
                    frc_1byte: false,
                    frc_2byte: true,
                    frc_4byte: false,
                })
                .unwrap();

            store
                .insert_device_sensor(&crate::store::DeviceSensor::new(
                    1, 0x01, 0, 0, sid,
                ))
                .unwrap();
        }

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfSensor_ReadSensorsWithTypes",
                "data": {"msgId": "s1", "req": {"nAdr": 1, "param": {}}}
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);
        assert_eq!(
            rsp["data"]["rsp"]["result"]["sensors"][0]["value"],
            22.5
        );

        let store = ctx.store.lock().unwrap();
        let mounts = store.device_sensors(1).unwrap();

        assert_eq!(mounts[0].value, Some(22.5));
        assert!(mounts[0].updated.is_some());
    }

    #[tokio::test]
    async fn test_async_sensor_frame() {
        // Scenario: an unsolicited ReadSensorsWithTypes frame
        // expands to a bus message with a fresh async msgId and a
        // non-empty sensors array.

        let (ctx, _bus) = dispatcher(Arc::new(ScriptedTransport::new()));
        let frame = async_sensor_frame(1, &[(0x01, 0x0168)]);
        let docs = asyncmsg::handle(&ctx, &frame);

        assert_eq!(docs.len(), 1);

        let doc = &docs[0];

        assert_eq!(doc["mType"], "iqrfSensor_ReadSensorsWithTypes");
        assert!(doc["data"]["msgId"]
            .as_str()
            .unwrap()
            .starts_with("async-"));

        let sensors =
            doc["data"]["rsp"]["result"]["sensors"].as_array().unwrap();

        assert!(!sensors.is_empty());
        assert_eq!(sensors[0]["value"], 22.5);
    }

    #[tokio::test]
    async fn test_async_raw_mirror() {
        let dpa = DpaService::new(Arc::new(ScriptedTransport::new()));
        let registry = ContextRegistry::new(
            Arc::new(StubRender::new()),
            String::new(),
        );
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let (bus_tx, _bus) = mpsc::channel(10);
        let ctx = Dispatcher::new(dpa, registry, store, bus_tx)
            .with_async_dpa_message(true);
        let frame = async_sensor_frame(1, &[(0x01, 0x0168)]);
        let docs = asyncmsg::handle(&ctx, &frame);

        // Raw mirror plus the rendered sensor message.

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["mType"], "iqrfRaw");
        assert_eq!(
            docs[0]["data"]["rsp"]["rData"],
            iqrfd_api::dpa::encode_hex(&frame)
        );
    }

    #[tokio::test]
    async fn test_db_read_api() {
        let (ctx, _bus) = dispatcher(Arc::new(ScriptedTransport::new()));

        {
            let store = ctx.store.lock().unwrap();
            let pid = store
                .insert_product(&crate::store::Product::new(
                    2, 2, 0x08d8, "4.03D", 0x0414,
                ))
                .unwrap();
            let did = store
                .insert_device(&crate::store::Device::new(
                    1, true, 0x01020304, 1, 0, Some(0), pid,
                ))
                .unwrap();

            store.upsert_binary_output(did, 4).unwrap();
        }

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfDb_GetDevices",
                "data": {"msgId": "d1", "req": {}}
            })))
            .await;
        let devices = rsp["data"]["rsp"]["devices"].as_array().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["address"], 1);
        assert_eq!(devices[0]["midHex"], "01020304");
        assert_eq!(devices[0]["osBuild"], "08D8");
        assert_eq!(devices[0]["dpaVersion"], "4.14");

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfDb_GetBinaryOutputs",
                "data": {"msgId": "d2"}
            })))
            .await;

        assert_eq!(
            rsp["data"]["rsp"]["binoutDevices"],
            json!([{"address": 1, "count": 4}])
        );

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfDb_Reset",
                "data": {"msgId": "d3"}
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);
        assert!(ctx
            .store
            .lock()
            .unwrap()
            .devices()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_device_metadata_round_trip() {
        let (ctx, _bus) = dispatcher(Arc::new(ScriptedTransport::new()));

        // Seed one device so there is something to annotate.

        {
            let store = ctx.store.lock().unwrap();
            let pid = store
                .insert_product(&crate::store::Product::new(
                    1, 1, 0x08d8, "4.03D", 0x0302,
                ))
                .unwrap();

            store
                .insert_device(&crate::store::Device::new(
                    1, true, 0xaabb, 0, 0, None, pid,
                ))
                .unwrap();
        }

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfDb_SetDeviceMetadata",
                "data": {"msgId": "m1", "req": {"devices": [
                    {"address": 1, "metadata": {"room": "attic"}},
                    {"address": 9, "metadata": {}},
                ]}}
            })))
            .await;

        assert_eq!(rsp["data"]["rsp"]["devices"][0]["success"], true);
        assert_eq!(rsp["data"]["rsp"]["devices"][1]["success"], false);

        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfDb_GetDeviceMetadata",
                "data": {"msgId": "m2", "req": {"devices": [1]}}
            })))
            .await;

        assert_eq!(
            rsp["data"]["rsp"]["devices"][0]["metadata"]["room"],
            "attic"
        );
    }

    #[tokio::test]
    async fn test_async_frame_through_dispatcher_task() {
        // End to end: a frame beamed by the simulator reaches the
        // bus as a broadcast without any inbound request.

        let sim = Arc::new(SimCoordinator::new());
        let (async_tx, async_rx) = mpsc::channel(8);

        sim.set_async_sender(async_tx);

        let dpa = DpaService::new(sim.clone());
        let registry = ContextRegistry::new(
            Arc::new(StubRender::new()),
            String::new(),
        );
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let (bus_tx, mut bus_rx) = mpsc::channel(8);
        let (api_tx, api_rx) = mpsc::channel::<ApiRequest>(8);
        let dispatcher =
            Arc::new(Dispatcher::new(dpa, registry, store, bus_tx));
        let task = tokio::spawn(dispatcher.run(api_rx, async_rx));

        sim.emit_async(async_sensor_frame(1, &[(0x01, 0x0168)]));

        let msg = tokio::time::timeout(
            Duration::from_secs(1),
            bus_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(msg.doc["mType"], "iqrfSensor_ReadSensorsWithTypes");
        assert!(msg.messaging.is_empty());

        drop(api_tx);
        task.abort();
    }

    #[tokio::test]
    async fn test_sensor_frc_two_phase() {
        // Two nodes, temperature, 2-byte FRC: one selective send, no
        // extra result, per-node values in the result.

        let sim = Arc::new(SimCoordinator::new());

        sim.bond(
            1,
            SimNode {
                frc_value: 0x0168, // 22.5
                sensors: vec![0x01],
                ..SimNode::default()
            },
        );
        sim.bond(
            2,
            SimNode {
                frc_value: 0x0178, // 23.5
                sensors: vec![0x01],
                ..SimNode::default()
            },
        );

        let (ctx, _bus) = dispatcher(sim);
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfSensor_Frc",
                "data": {
                    "msgId": "f1",
                    "req": {
                        "nAdr": 0,
                        "param": {
                            "sensorType": 1,
                            "sensorIndex": 0,
                            "frcCommand": 0xE0,
                            "selectedNodes": [1, 2],
                            "getExtraResult": false,
                        },
                    },
                    "returnVerbose": true,
                }
            })))
            .await;

        assert_eq!(rsp["data"]["status"], 0);

        let sensors =
            rsp["data"]["rsp"]["result"]["sensors"].as_array().unwrap();

        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0]["value"], 22.5);
        assert_eq!(sensors[1]["value"], 23.5);

        // Only the send transaction ran.

        assert_eq!(rsp["data"]["raw"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frc_exclusive_unavailable() {
        // With the radio held by a long-running consumer, the FRC
        // handler gives up with the service code instead of queueing
        // behind it.

        let (ctx, _bus) = dispatcher(Arc::new(SimCoordinator::new()));
        let held = ctx
            .dpa
            .try_exclusive(Duration::from_millis(100))
            .await
            .unwrap();
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfSensor_Frc",
                "data": {
                    "msgId": "x1",
                    "req": {
                        "nAdr": 0,
                        "param": {
                            "sensorType": 1,
                            "sensorIndex": 0,
                            "frcCommand": 0xE0,
                            "selectedNodes": [1],
                        },
                    },
                }
            })))
            .await;

        assert_eq!(rsp["data"]["status"], STATUS_EXCLUSIVE_ACCESS);
        drop(held);
    }

    #[tokio::test]
    async fn test_sensor_frc_ext_format() {
        let sim = Arc::new(SimCoordinator::new());

        sim.bond(
            1,
            SimNode {
                frc_value: 0x0168,
                sensors: vec![0x01],
                ..SimNode::default()
            },
        );

        let (ctx, _bus) = dispatcher(sim);
        let rsp = ctx
            .handle_request(api_request(json!({
                "mType": "iqrfSensor_Frc",
                "data": {
                    "msgId": "f2",
                    "req": {
                        "nAdr": 0,
                        "param": {
                            "sensorType": 1,
                            "sensorIndex": 0,
                            "frcCommand": 0xE0,
                            "selectedNodes": [1],
                            "getExtraResult": false,
                            "extFormat": true,
                        },
                    },
                }
            })))
            .await;

        let sensors =
            rsp["data"]["rsp"]["result"]["sensors"].as_array().unwrap();

        assert_eq!(sensors[0]["nAdr"], 1);
        assert_eq!(sensors[0]["sensor"]["value"], 22.5);

        // Address 1 is not in the store, so the annotations are
        // null.

        assert!(sensors[0]["mid"].is_null());
    }
}
