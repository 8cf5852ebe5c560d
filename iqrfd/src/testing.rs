//! Stand-ins for the external collaborators: a scripted radio
//! transport, a simulated coordinator-only network, a Rust-side
//! driver engine, and a canned repository cache.
//!
//! `SimCoordinator` and `StubRender` also back the daemon's simulate
//! mode, so they live here rather than under `#[cfg(test)]`.

use crate::dpa::{self, embed};
use async_trait::async_trait;
use chrono::Local;
use iqrfd_api::dpa::{
    encode_hex, frc, parse_hex, pcmd, pnum, DpaRequest, DpaResponse,
    RESPONSE_PCMD_BIT,
};
use iqrfd_api::txn::{TransactionResult, TxnStatus};
use iqrfd_api::{
    DpaTransport, DriverCache, Error, JsRender, Package, Quantity, Result,
    StdDriver,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;

// ---------------------------------------------------------------------
// Scripted transport

enum Scripted {
    Respond(Vec<u8>, u64),
    NoResponse,
}

/// A transport that replays a scripted list of outcomes; a request
/// past the end of the script gets no response. Records every
/// executed frame and the peak number of concurrent exchanges.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    executed: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, bytes: Vec<u8>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Respond(bytes, 0));
    }

    pub fn push_response_delayed(&self, bytes: Vec<u8>, delay_ms: u64) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Respond(bytes, delay_ms));
    }

    pub fn push_no_response(&self) {
        self.script.lock().unwrap().push_back(Scripted::NoResponse);
    }

    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.executed.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DpaTransport for ScriptedTransport {
    async fn execute(
        &self,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<TransactionResult> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;

        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.executed.lock().unwrap().push(request.to_vec());

        let item = self.script.lock().unwrap().pop_front();
        let (response, delay) = match item {
            Some(Scripted::Respond(bytes, delay)) => (Some(bytes), delay),
            Some(Scripted::NoResponse) | None => (None, 0),
        };

        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let now = Local::now();

        Ok(TransactionResult {
            request: request.to_vec(),
            confirmation: None,
            response_ts: response.as_ref().map(|_| now),
            response,
            request_ts: Some(now),
            confirmation_ts: None,
            status: TxnStatus::Ok,
            error_str: String::from("ok"),
        })
    }
}

// ---------------------------------------------------------------------
// Simulated network

/// One simulated node's identity and capabilities.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub mid: u32,
    pub hwpid: u16,
    pub hwpid_version: u16,
    pub os_build: u16,
    pub os_version: u8,
    pub tr_mcu: u8,
    pub dpa_version: u16,
    pub online: bool,
    /// Sensor types the node mounts, in slot order.
    pub sensors: Vec<u8>,
    pub binouts: Option<u8>,
    pub lights: Option<u8>,
    pub dali: bool,
    /// Raw 2-byte value the node answers sensor FRCs with.
    pub frc_value: u16,
    pub vrn: u8,
    pub zone: u8,
    pub parent: u8,
    pub discovered: bool,
}

impl Default for SimNode {
    fn default() -> Self {
        SimNode {
            mid: 0x0102_0304,
            hwpid: 0x0002,
            hwpid_version: 2,
            os_build: 0x08d8,
            os_version: 0x43,
            tr_mcu: 0x04,
            dpa_version: 0x0302,
            online: true,
            sensors: vec![],
            binouts: None,
            lights: None,
            dali: false,
            frc_value: 0x0168, // 22.5 °C in sixteenths
            vrn: 0,
            zone: 0,
            parent: 0,
            discovered: false,
        }
    }
}

struct SimState {
    nodes: BTreeMap<u8, SimNode>,
    coordinator: SimNode,
}

/// A coordinator-only network simulator good enough to drive the
/// enumerator, the sensor reader, and the raw API paths end to end.
pub struct SimCoordinator {
    state: Mutex<SimState>,
    async_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    executed: Mutex<Vec<Vec<u8>>>,
}

impl Default for SimCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCoordinator {
    pub fn new() -> Self {
        SimCoordinator {
            state: Mutex::new(SimState {
                nodes: BTreeMap::new(),
                coordinator: SimNode {
                    mid: 0x8100_0001,
                    hwpid: 0,
                    hwpid_version: 0,
                    dpa_version: 0x0414,
                    ..SimNode::default()
                },
            }),
            async_tx: Mutex::new(None),
            executed: Mutex::new(vec![]),
        }
    }

    /// Every frame the simulator was handed, in execution order.
    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.executed.lock().unwrap().clone()
    }

    /// Wires the channel unsolicited frames are pushed onto.
    pub fn set_async_sender(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.async_tx.lock().unwrap() = Some(tx);
    }

    /// Emits an unsolicited frame, as a beaming sensor would.
    pub fn emit_async(&self, frame: Vec<u8>) {
        if let Some(tx) = self.async_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(frame);
        }
    }

    pub fn bond(&self, address: u8, node: SimNode) {
        self.state.lock().unwrap().nodes.insert(address, node);
    }

    pub fn unbond(&self, address: u8) {
        self.state.lock().unwrap().nodes.remove(&address);
    }

    pub fn discover(&self, address: u8, vrn: u8, zone: u8, parent: u8) {
        if let Some(node) =
            self.state.lock().unwrap().nodes.get_mut(&address)
        {
            node.discovered = true;
            node.vrn = vrn;
            node.zone = zone;
            node.parent = parent;
        }
    }

    pub fn set_node_mid(&self, address: u8, mid: u32) {
        if let Some(node) =
            self.state.lock().unwrap().nodes.get_mut(&address)
        {
            node.mid = mid;
        }
    }

    fn respond(req: &DpaRequest, pdata: Vec<u8>) -> Vec<u8> {
        DpaResponse {
            nadr: req.nadr,
            pnum: req.pnum,
            pcmd: req.pcmd | RESPONSE_PCMD_BIT,
            hwpid: req.hwpid,
            rcode: 0,
            asynchronous: false,
            dpa_value: 0x35,
            pdata,
        }
        .to_bytes()
    }

    fn eeeprom_read(state: &SimState, address: u16, len: u8) -> Vec<u8> {
        let mut data = vec![0u8; len as usize];

        for (i, byte) in data.iter_mut().enumerate() {
            let offset = address as usize + i;

            match offset {
                // MID table: 8 bytes per address.
                0x4000..=0x4fff => {
                    let addr = ((offset - 0x4000) / 8) as u8;
                    let pos = (offset - 0x4000) % 8;

                    if pos < 4 {
                        if let Some(node) = state.nodes.get(&addr) {
                            *byte = (node.mid >> (8 * pos)) as u8;
                        }
                    }
                }
                // VRN array.
                0x5000..=0x51ff => {
                    let addr = (offset - 0x5000) as u8;

                    if let Some(node) = state.nodes.get(&addr) {
                        if node.discovered {
                            *byte = node.vrn;
                        }
                    }
                }
                // Zone array, stored one above the logical zone.
                0x5200..=0x52ff => {
                    let addr = (offset - 0x5200) as u8;

                    if let Some(node) = state.nodes.get(&addr) {
                        if node.discovered {
                            *byte = node.zone + 1;
                        }
                    }
                }
                // Parent array.
                0x5300..=0x53ff => {
                    let addr = (offset - 0x5300) as u8;

                    if let Some(node) = state.nodes.get(&addr) {
                        if node.discovered {
                            *byte = node.parent;
                        }
                    }
                }
                _ => {}
            }
        }
        data
    }

    fn os_read_pdata(node: &SimNode) -> Vec<u8> {
        vec![
            node.mid as u8,
            (node.mid >> 8) as u8,
            (node.mid >> 16) as u8,
            (node.mid >> 24) as u8,
            node.os_version,
            node.tr_mcu,
            (node.os_build & 0xff) as u8,
            (node.os_build >> 8) as u8,
            0x00,
            0x30,
            0x00,
            0x05,
        ]
    }

    fn per_enum_pdata(node: &SimNode) -> Vec<u8> {
        // Embedded peripherals: coordinator-ish baseline plus FRC;
        // standard peripherals show up through the driver bindings
        // instead of this bitmap.

        vec![
            (node.dpa_version & 0xff) as u8,
            (node.dpa_version >> 8) as u8,
            0x00,
            0b0010_1111,
            0b0010_0000,
            0x00,
            0x00,
            (node.hwpid & 0xff) as u8,
            (node.hwpid >> 8) as u8,
            (node.hwpid_version & 0xff) as u8,
            (node.hwpid_version >> 8) as u8,
            0x01,
        ]
    }

    fn frc_response(state: &SimState, req: &DpaRequest) -> Option<Vec<u8>> {
        let frc_cmd = *req.pdata.first()?;
        let mut data = [0u8; 55];

        match frc_cmd {
            frc::PING => {
                for (addr, node) in &state.nodes {
                    if node.online {
                        data[*addr as usize / 8] |= 1 << (*addr as usize % 8);
                    }
                }
            }
            frc::STD_SENSORS_2BYTE => {
                // Selective send: value slots follow the stub driver
                // convention of 2 bytes per selected node, ascending,
                // starting at offset 2.

                let mask = req.pdata.get(1..31)?;
                let selected = dpa::bitmap_to_addrs(mask);

                for (k, addr) in selected.iter().enumerate() {
                    if let Some(node) = state.nodes.get(addr) {
                        if node.online && 2 + 2 * k + 1 < 55 {
                            data[2 + 2 * k] = (node.frc_value & 0xff) as u8;
                            data[2 + 2 * k + 1] = (node.frc_value >> 8) as u8;
                        }
                    }
                }
            }
            frc::MEMORY_READ_4B => {
                // Four bytes per selected node, ascending, after the
                // coordinator's slot. The node "memory" holds the
                // answer of the embedded request named in the user
                // data.

                let mask = req.pdata.get(1..31)?;
                let user = req.pdata.get(31..38)?;
                let address = user[2] as u16 | (user[3] as u16) << 8;
                let selected = dpa::bitmap_to_addrs(mask);

                for (k, addr) in selected.iter().enumerate() {
                    let base = 4 + 4 * k;

                    if base + 4 > 55 {
                        break;
                    }

                    if let Some(node) = state.nodes.get(addr) {
                        if node.online {
                            data[base..base + 4].copy_from_slice(
                                &Self::memory_4b(node, address),
                            );
                        }
                    }
                }
            }
            frc::MEMORY_READ => {
                // RSSI register read; nodes report zeroes.
            }
            _ => return None,
        }

        let mut pdata = vec![state.nodes.len() as u8];

        pdata.extend_from_slice(&data);
        Some(pdata)
    }

    // The RAM window the enumeration FRC reads: the peripheral
    // enumeration answer at 0x04a0 and the OS read answer fields.

    fn memory_4b(node: &SimNode, address: u16) -> [u8; 4] {
        match address {
            // DpaVersion, UserPerNr, first embedded peripheral byte.
            0x04a0 => [
                (node.dpa_version & 0xff) as u8,
                (node.dpa_version >> 8) as u8,
                0x00,
                0b0010_1111,
            ],
            // OsVersion, McuType, OsBuild.
            0x04a4 => [
                node.os_version,
                node.tr_mcu,
                (node.os_build & 0xff) as u8,
                (node.os_build >> 8) as u8,
            ],
            // HWPID, HWPID version.
            0x04a7 => [
                (node.hwpid & 0xff) as u8,
                (node.hwpid >> 8) as u8,
                (node.hwpid_version & 0xff) as u8,
                (node.hwpid_version >> 8) as u8,
            ],
            _ => [0; 4],
        }
    }

    /// Overrides the coordinator's reported DPA version; versions
    /// below 4.02 force the enumerator onto the polling path.
    pub fn set_coordinator_dpa(&self, dpa_version: u16) {
        self.state.lock().unwrap().coordinator.dpa_version = dpa_version;
    }

    fn handle(&self, req: &DpaRequest) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();

        if req.nadr != 0 {
            // Routed request; only online bonded nodes answer.

            let node = state.nodes.get(&(req.nadr as u8))?.clone();

            if !node.online {
                return None;
            }

            let pdata = match (req.pnum, req.pcmd) {
                (pnum::OS, pcmd::OS_READ) => Self::os_read_pdata(&node),
                (pnum::EXPLORATION, pcmd::EXPLORATION_PER_ENUM) => {
                    Self::per_enum_pdata(&node)
                }
                (pnum::BINARY_OUTPUT, pcmd::STANDARD_ENUMERATE) => {
                    vec![node.binouts?]
                }
                (pnum::LIGHT, pcmd::STANDARD_ENUMERATE) => {
                    vec![node.lights?]
                }
                (pnum::SENSOR, pcmd::STANDARD_ENUMERATE) => {
                    node.sensors.clone()
                }
                _ => return None,
            };

            return Some(Self::respond(req, pdata));
        }

        let pdata = match (req.pnum, req.pcmd) {
            (pnum::COORDINATOR, pcmd::COORDINATOR_BONDED_DEVICES) => {
                let mut bitmap = vec![0u8; 30];

                for addr in state.nodes.keys() {
                    bitmap[*addr as usize / 8] |= 1 << (*addr as usize % 8);
                }
                bitmap
            }
            (pnum::COORDINATOR, pcmd::COORDINATOR_DISCOVERED_DEVICES) => {
                let mut bitmap = vec![0u8; 30];

                for (addr, node) in &state.nodes {
                    if node.discovered {
                        bitmap[*addr as usize / 8] |=
                            1 << (*addr as usize % 8);
                    }
                }
                bitmap
            }
            (pnum::COORDINATOR, pcmd::COORDINATOR_BOND_NODE) => {
                let wanted = req.pdata.first().copied().unwrap_or(0);
                let addr = if wanted != 0 {
                    wanted
                } else {
                    (1..=239u8)
                        .find(|a| !state.nodes.contains_key(a))
                        .unwrap_or(0)
                };

                state.nodes.entry(addr).or_default();

                let count = state.nodes.len() as u8;

                vec![addr, count]
            }
            (pnum::COORDINATOR, pcmd::COORDINATOR_REMOVE_BOND) => {
                let addr = req.pdata.first().copied().unwrap_or(0);

                state.nodes.remove(&addr);
                vec![state.nodes.len() as u8]
            }
            (pnum::EEEPROM, pcmd::EEEPROM_XREAD) => {
                let address = *req.pdata.first()? as u16
                    | (*req.pdata.get(1)? as u16) << 8;
                let len = *req.pdata.get(2)?;

                Self::eeeprom_read(&state, address, len)
            }
            (pnum::OS, pcmd::OS_READ) => {
                Self::os_read_pdata(&state.coordinator)
            }
            (pnum::EXPLORATION, pcmd::EXPLORATION_PER_ENUM) => {
                Self::per_enum_pdata(&state.coordinator)
            }
            (pnum::FRC, pcmd::FRC_SEND)
            | (pnum::FRC, pcmd::FRC_SEND_SELECTIVE) => {
                Self::frc_response(&state, req)?
            }
            (pnum::FRC, pcmd::FRC_EXTRA_RESULT) => vec![0u8; 9],
            (pnum::FRC, pcmd::FRC_SET_PARAMS) => {
                vec![req.pdata.first().copied().unwrap_or(0)]
            }
            _ => return None,
        };

        Some(Self::respond(req, pdata))
    }

}

#[async_trait]
impl DpaTransport for SimCoordinator {
    async fn execute(
        &self,
        request: &[u8],
        _timeout: Duration,
    ) -> Result<TransactionResult> {
        let req = DpaRequest::from_bytes(request)?;

        self.executed.lock().unwrap().push(request.to_vec());

        let response = self.handle(&req);
        let now = Local::now();

        Ok(TransactionResult {
            request: request.to_vec(),
            confirmation: (req.nadr != 0).then(|| request.to_vec()),
            response_ts: response.as_ref().map(|_| now),
            response,
            request_ts: Some(now),
            confirmation_ts: None,
            status: TxnStatus::Ok,
            error_str: String::from("ok"),
        })
    }
}

// ---------------------------------------------------------------------
// Driver engine stub

struct RenderState {
    contexts: HashMap<i32, (String, BTreeSet<i64>)>,
    addr_map: HashMap<u8, i32>,
}

/// A Rust-side rendition of the driver functions the tests exercise.
/// Context bookkeeping follows the engine contract; the functions
/// themselves are implemented over the same raw-HDP JSON documents a
/// real driver would see.
pub struct StubRender {
    state: Mutex<RenderState>,
}

impl Default for StubRender {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRender {
    pub fn new() -> Self {
        StubRender {
            state: Mutex::new(RenderState {
                contexts: HashMap::new(),
                addr_map: HashMap::new(),
            }),
        }
    }

    pub fn context_code(&self, context_id: i32) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .contexts
            .get(&context_id)
            .map(|(code, _)| code.clone())
    }

    pub fn context_for_address(&self, address: u8) -> Option<i32> {
        self.state.lock().unwrap().addr_map.get(&address).copied()
    }

    fn quantity_doc(kind: u8) -> Value {
        match kind {
            0x01 => json!({
                "id": "TEMPERATURE",
                "type": 1,
                "name": "Temperature",
                "shortName": "t",
                "unit": "°C",
                "decimalPlaces": 4,
                "frcs": [0x90, 0xE0],
            }),
            0x02 => json!({
                "id": "CARBON_DIOXIDE",
                "type": 2,
                "name": "Carbon dioxide",
                "shortName": "CO2",
                "unit": "ppm",
                "decimalPlaces": 0,
                "frcs": [0x90, 0xE0],
            }),
            0x04 => json!({
                "id": "HUMIDITY",
                "type": 4,
                "name": "Relative humidity",
                "shortName": "RH",
                "unit": "%",
                "decimalPlaces": 1,
                "frcs": [0x90],
            }),
            other => json!({
                "id": format!("TYPE_{}", other),
                "type": other,
                "name": format!("Type {}", other),
                "shortName": format!("q{}", other),
                "unit": "?",
                "decimalPlaces": 0,
                "frcs": [0x90],
            }),
        }
    }

    fn rdata(params: &Value) -> Result<Vec<u8>> {
        params
            .get("rdata")
            .and_then(Value::as_str)
            .map(parse_hex)
            .unwrap_or_else(|| Ok(vec![]))
    }

    // iqrf.embed.coordinator.BondedDevices

    fn bonded_devices_rsp(params: &Value) -> Result<Value> {
        let bitmap = Self::rdata(params)?;
        let addrs: Vec<u8> =
            dpa::bitmap_to_addrs(&bitmap).into_iter().collect();

        Ok(json!({ "bondedDevices": addrs }))
    }

    // iqrf.embed.os.Read

    fn os_read_rsp(params: &Value) -> Result<Value> {
        let os = dpa::OsRead::parse(&Self::rdata(params)?)?;

        Ok(json!({
            "mid": os.mid,
            "osVersion": os.os_version_string(),
            "trMcuType": os.tr_mcu,
            "osBuild": dpa::os_build_string(os.os_build),
            "rssi": os.rssi,
            "supplyVoltage": 261.12 / (127.0 - os.supply_voltage as f64),
        }))
    }

    // iqrf.sensor.Enumerate: one sensor type byte per slot.

    fn sensor_enumerate_rsp(params: &Value) -> Result<Value> {
        let types = Self::rdata(params)?;
        let sensors: Vec<Value> = types
            .iter()
            .enumerate()
            .map(|(idx, kind)| {
                let mut doc = Self::quantity_doc(*kind);

                doc["idx"] = json!(idx);
                doc
            })
            .collect();

        Ok(json!({ "sensors": sensors }))
    }

    // iqrf.sensor.ReadSensorsWithTypes: (type, value lo, value hi)
    // triplets.

    fn read_sensors_rsp(params: &Value) -> Result<Value> {
        let bytes = Self::rdata(params)?;
        let mut sensors = vec![];

        for chunk in bytes.chunks_exact(3) {
            let kind = chunk[0];
            let raw = chunk[1] as u16 | (chunk[2] as u16) << 8;
            let mut doc = Self::quantity_doc(kind);

            doc["value"] = json!(Self::decode_value(kind, raw));
            sensors.push(doc);
        }

        Ok(json!({ "sensors": sensors }))
    }

    fn decode_value(kind: u8, raw: u16) -> f64 {
        match kind {
            0x01 => (raw as i16) as f64 / 16.0,
            0x04 => raw as f64 / 2.0,
            _ => raw as f64,
        }
    }

    // iqrf.sensor.Frc request: builds the send and extra-result
    // commands in `retpars`.

    fn sensor_frc_req(params: &Value) -> Result<Value> {
        let kind = params
            .get("sensorType")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::DriverError("missing sensorType".into()))?
            as u8;
        let idx = params
            .get("sensorIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u8;
        let command = params
            .get("frcCommand")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::DriverError("missing frcCommand".into()))?
            as u8;
        let selected: Vec<u8> = params
            .get("selectedNodes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter().filter_map(|v| v.as_u64().map(|n| n as u8)).collect()
            })
            .unwrap_or_default();

        let mut send = vec![command];

        if selected.is_empty() {
            send.extend_from_slice(&[pnum::SENSOR, kind, idx]);
        } else {
            send.extend_from_slice(&dpa::select_nodes(
                selected.iter().copied(),
            ));
            send.extend_from_slice(&[pnum::SENSOR, kind, idx]);
        }

        Ok(json!({
            "retpars": [
                {
                    "pNum": format!("{:02x}", pnum::FRC),
                    "pCmd": format!(
                        "{:02x}",
                        if selected.is_empty() {
                            pcmd::FRC_SEND
                        } else {
                            pcmd::FRC_SEND_SELECTIVE
                        }
                    ),
                    "rdata": encode_hex(&send),
                },
                {
                    "pNum": format!("{:02x}", pnum::FRC),
                    "pCmd": format!("{:02x}", pcmd::FRC_EXTRA_RESULT),
                },
            ]
        }))
    }

    // iqrf.sensor.Frc response: decodes the value slots back out of
    // the FRC data. The leading array item mirrors the real driver,
    // which reserves slot 0 for the coordinator.

    fn sensor_frc_rsp(params: &Value) -> Result<Value> {
        let kind = params
            .get("sensorType")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::DriverError("missing sensorType".into()))?
            as u8;
        let selected: Vec<u8> = params
            .get("selectedNodes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter().filter_map(|v| v.as_u64().map(|n| n as u8)).collect()
            })
            .unwrap_or_default();
        let frc_send = params
            .pointer("/responseFrcSend/rdata")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::DriverError("missing responseFrcSend".into())
            })?;
        let bytes = parse_hex(frc_send)?;

        // Skip the aggregate status byte.

        let data = &bytes[1..];
        let mut sensors = vec![Value::Null];

        for (k, _) in selected.iter().enumerate() {
            let offset = 2 + 2 * k;

            if offset + 1 >= data.len() {
                break;
            }

            let raw = data[offset] as u16 | (data[offset + 1] as u16) << 8;
            let mut doc = Self::quantity_doc(kind);

            doc["value"] = json!(Self::decode_value(kind, raw));
            sensors.push(doc);
        }

        Ok(json!({ "sensors": sensors }))
    }
}

impl JsRender for StubRender {
    fn load_context(
        &self,
        context_id: i32,
        code: &str,
        driver_ids: &BTreeSet<i64>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .contexts
            .insert(context_id, (code.to_string(), driver_ids.clone()));
        Ok(())
    }

    fn map_address_to_context(&self, address: u8, context_id: i32) {
        self.state
            .lock()
            .unwrap()
            .addr_map
            .insert(address, context_id);
    }

    fn driver_id_set(&self, context_id: i32) -> Option<BTreeSet<i64>> {
        self.state
            .lock()
            .unwrap()
            .contexts
            .get(&context_id)
            .map(|(_, ids)| ids.clone())
    }

    fn call(
        &self,
        _address: u16,
        _hwpid: u16,
        function: &str,
        params: &str,
    ) -> Result<String> {
        let params: Value = serde_json::from_str(params)?;

        let result = match function {
            "iqrf.embed.coordinator.BondedDevices_Request_req" => {
                json!({"pNum": "00", "pCmd": "02"})
            }
            "iqrf.embed.coordinator.BondedDevices_Response_rsp" => {
                Self::bonded_devices_rsp(&params)?
            }
            "iqrf.embed.os.Read_Request_req" => {
                json!({"pNum": "02", "pCmd": "00"})
            }
            "iqrf.embed.os.Read_Response_rsp" => Self::os_read_rsp(&params)?,
            "iqrf.sensor.Enumerate_Request_req" => {
                json!({"pNum": "5e", "pCmd": "3e"})
            }
            "iqrf.sensor.Enumerate_Response_rsp" => {
                Self::sensor_enumerate_rsp(&params)?
            }
            "iqrf.sensor.ReadSensorsWithTypes_Request_req" => {
                json!({"pNum": "5e", "pCmd": "01"})
            }
            "iqrf.sensor.ReadSensorsWithTypes_Response_rsp"
            | "iqrf.sensor.ReadSensorsWithTypesFrcValue_AsyncResponse" => {
                Self::read_sensors_rsp(&params)?
            }
            "iqrf.sensor.Frc_Request_req" => Self::sensor_frc_req(&params)?,
            "iqrf.sensor.Frc_Response_rsp" => Self::sensor_frc_rsp(&params)?,
            other => {
                return Err(Error::DriverError(format!(
                    "unknown driver function: {}",
                    other
                )))
            }
        };

        Ok(result.to_string())
    }

    fn clear_contexts(&self) {
        let mut state = self.state.lock().unwrap();

        state.contexts.clear();
        state.addr_map.clear();
    }
}

// ---------------------------------------------------------------------
// Repository cache stub

/// A canned driver/package catalog.
#[derive(Default)]
pub struct StubCache {
    packages: Mutex<Vec<Package>>,
    drivers: Mutex<Vec<StdDriver>>,
    customs: Mutex<Vec<(u16, String)>>,
}

impl StubCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&self, package: Package) {
        self.packages.lock().unwrap().push(package);
    }

    pub fn add_driver(&self, driver: StdDriver) {
        self.drivers.lock().unwrap().push(driver);
    }

    pub fn add_custom_driver(&self, hwpid: u16, code: &str) {
        self.customs.lock().unwrap().push((hwpid, code.to_string()));
    }

    /// A driver record the tests register under `peripheral`.
    pub fn std_driver(peripheral: i16, version: f64) -> StdDriver {
        StdDriver {
            peripheral,
            version,
            name: format!("driver-{}", peripheral),
            version_flags: 0,
            notes: String::new(),
            code: format!("/* driver {} v{} */", peripheral, version),
            hash: format!("hash-{}-{}", peripheral, version),
        }
    }
}

impl DriverCache for StubCache {
    fn package(
        &self,
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        dpa_version: u16,
    ) -> Option<Package> {
        self.packages
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.hwpid == hwpid
                    && p.hwpid_version == hwpid_version
                    && p.os_build == os_build
                    && p.dpa_version == dpa_version
            })
            .cloned()
    }

    fn driver(&self, peripheral: i16, version: f64) -> Option<StdDriver> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.peripheral == peripheral && d.version == version)
            .cloned()
    }

    fn latest_driver(&self, peripheral: i16) -> Option<StdDriver> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.peripheral == peripheral)
            .max_by(|a, b| a.version.total_cmp(&b.version))
            .cloned()
    }

    fn latest_drivers(
        &self,
        _os_build: u16,
        _dpa_version: u16,
    ) -> Vec<StdDriver> {
        let drivers = self.drivers.lock().unwrap();
        let mut latest: BTreeMap<i16, StdDriver> = BTreeMap::new();

        for driver in drivers.iter() {
            match latest.get(&driver.peripheral) {
                Some(cur) if cur.version >= driver.version => {}
                _ => {
                    latest.insert(driver.peripheral, driver.clone());
                }
            }
        }
        latest.into_values().collect()
    }

    fn custom_drivers(
        &self,
        _os_build: u16,
        _dpa_version: u16,
    ) -> Vec<(u16, String)> {
        self.customs.lock().unwrap().clone()
    }

    fn quantity(&self, kind: u8) -> Option<Quantity> {
        let doc = StubRender::quantity_doc(kind);

        Some(Quantity {
            kind,
            name: doc["name"].as_str()?.to_string(),
            short_name: doc["shortName"].as_str()?.to_string(),
            unit: doc["unit"].as_str()?.to_string(),
            decimals: doc["decimalPlaces"].as_u64()? as u8,
        })
    }
}

/// Builds the raw bytes of an unsolicited sensor frame: a
/// `ReadSensorsWithTypes` FRC-value beam (PCMD 0x7B) with the async
/// bit set, carrying the given `(type, raw value)` samples.
pub fn async_sensor_frame(nadr: u16, samples: &[(u8, u16)]) -> Vec<u8> {
    let mut pdata = vec![];

    for (kind, raw) in samples {
        pdata.push(*kind);
        pdata.push((*raw & 0xff) as u8);
        pdata.push((*raw >> 8) as u8);
    }

    DpaResponse {
        nadr,
        pnum: pnum::SENSOR,
        pcmd: 0x7B | RESPONSE_PCMD_BIT,
        hwpid: 0x0002,
        rcode: 0,
        asynchronous: true,
        dpa_value: 0x35,
        pdata,
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_bonding_and_bitmaps() {
        let sim = SimCoordinator::new();

        sim.bond(1, SimNode::default());
        sim.bond(
            2,
            SimNode {
                mid: 0xccdd,
                ..SimNode::default()
            },
        );

        let rsp = sim.handle(&embed::bonded_devices()).unwrap();
        let rsp = DpaResponse::parse(&rsp).unwrap();

        assert_eq!(dpa::bitmap_to_addrs(&rsp.pdata), BTreeSet::from([1, 2]));

        sim.discover(1, 3, 0, 0);

        let rsp = sim.handle(&embed::discovered_devices()).unwrap();
        let rsp = DpaResponse::parse(&rsp).unwrap();

        assert_eq!(dpa::bitmap_to_addrs(&rsp.pdata), BTreeSet::from([1]));
    }

    #[test]
    fn test_sim_mid_table() {
        let sim = SimCoordinator::new();

        sim.bond(
            1,
            SimNode {
                mid: 0x0102_0304,
                ..SimNode::default()
            },
        );

        let rsp = sim.handle(&embed::eeeprom_read(0x4000, 16)).unwrap();
        let rsp = DpaResponse::parse(&rsp).unwrap();

        assert_eq!(&rsp.pdata[8..12], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_stub_render_os_read() {
        let render = StubRender::new();
        let params = json!({
            "pNum": "02", "pCmd": "80", "rcode": "00", "dpaval": "35",
            "rdata": "04.03.02.01.43.04.d8.08.00.30",
        });
        let result = render
            .call(0, 0xffff, "iqrf.embed.os.Read_Response_rsp",
                  &params.to_string())
            .unwrap();
        let result: Value = serde_json::from_str(&result).unwrap();

        assert_eq!(result["osVersion"], "4.03D");
        assert_eq!(result["osBuild"], "08D8");
    }

    #[test]
    fn test_stub_render_sensor_frc_round_trip() {
        let render = StubRender::new();
        let req_params = json!({
            "sensorType": 1,
            "sensorIndex": 0,
            "frcCommand": 0xE0,
            "selectedNodes": [1, 2],
        });
        let result = render
            .call(0, 0xffff, "iqrf.sensor.Frc_Request_req",
                  &req_params.to_string())
            .unwrap();
        let result: Value = serde_json::from_str(&result).unwrap();
        let send = &result["retpars"][0];

        assert_eq!(send["pNum"], "0d");
        assert_eq!(send["pCmd"], "02");

        // 1 command + 30 mask + 3 user bytes.

        assert_eq!(parse_hex(send["rdata"].as_str().unwrap()).unwrap().len(),
                   34);
    }
}
