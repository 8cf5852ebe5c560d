//! The sensor-data worker: periodically reads every sensor in the
//! network with batched FRC commands, persists the values, and
//! publishes reading reports. Also serves the worker's lifecycle
//! commands from the message bus.

use crate::config::SensorDataConfig;
use crate::dispatch::{
    set_pointer, STATUS_CONFIG_FAILURE, STATUS_NOT_RUNNING,
    STATUS_READING_IN_PROGRESS,
};
use crate::dpa::{self, embed};
use crate::exclusive::{DpaService, ExclusiveAccess};
use crate::js::ContextRegistry;
use crate::store::SharedStore;
use chrono::Local;
use iqrfd_api::bus::{ApiRequest, BusMessage, BusTx};
use iqrfd_api::dpa::{
    frc, hdp_to_request, response_to_hdp, DpaResponse, HWPID_DONT_CHECK,
};
use iqrfd_api::{Error, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

/// Sensor type of the beaming-compatible RSSI quantity.
const RSSI_SENSOR_TYPE: u8 = 133;

/// Offset the beaming RSSI value is reported under.
const RSSI_OFFSET: u8 = 130;

/// User data of the FRC memory read that fetches the RSSI register.
const RSSI_MEMORY_READ: [u8; 5] = [182, 5, 2, 0, 0];

/// Node batch size of a plain FRC memory read.
const MEMORY_READ_BATCH: usize = 63;

/// How long to wait for exclusive access before backing off for
/// `retry_period`.
const ACQUIRE_WAIT: Duration = Duration::from_millis(1_000);

// FRC width bookkeeping by sensor type range.

fn frc_command_for(kind: u8) -> Result<u8> {
    match kind {
        0x01..=0x7F => Ok(frc::STD_SENSORS_2BYTE),
        0x80..=0x9F => Ok(frc::STD_SENSORS_BYTE),
        0xA0..=0xBF => Ok(frc::STD_SENSORS_4BYTE),
        _ => Err(Error::InvArgument(format!(
            "unknown or unsupported sensor type: {}",
            kind
        ))),
    }
}

fn frc_device_count(kind: u8) -> Result<usize> {
    match kind {
        0x01..=0x7F => Ok(31),
        0x80..=0x9F => Ok(63),
        0xA0..=0xBF => Ok(15),
        _ => Err(Error::InvArgument(format!(
            "unknown or unsupported sensor type: {}",
            kind
        ))),
    }
}

fn extra_result_required(command: u8, device_count: usize) -> Result<bool> {
    match command {
        frc::STD_SENSORS_BYTE => Ok(device_count > 55),
        frc::STD_SENSORS_2BYTE => Ok(device_count > 27),
        frc::STD_SENSORS_4BYTE => Ok(device_count > 13),
        _ => Err(Error::InvArgument(format!(
            "unknown or unsupported FRC command: {}",
            command
        ))),
    }
}

#[derive(Default)]
struct DeviceReading {
    mid: u32,
    hwpid: u16,
    rssi: Option<u8>,
    samples: Vec<(u8, f64)>,
}

#[derive(Default)]
struct ReadingResult {
    devices: BTreeMap<u8, DeviceReading>,
}

pub struct SensorData {
    dpa: DpaService,
    store: SharedStore,
    registry: ContextRegistry,
    bus_tx: BusTx,
    cfg: StdMutex<SensorDataConfig>,
    config_path: Option<String>,
    running: AtomicBool,
    reading: AtomicBool,
    notify: Notify,
}

impl SensorData {
    pub fn new(
        dpa: DpaService,
        store: SharedStore,
        registry: ContextRegistry,
        bus_tx: BusTx,
        cfg: SensorDataConfig,
        config_path: Option<String>,
    ) -> Self {
        SensorData {
            dpa,
            store,
            registry,
            bus_tx,
            cfg: StdMutex::new(cfg),
            config_path,
            running: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Spawns the worker unless it is already running. Returns
    /// whether a new worker was started.
    pub fn start_worker(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let this = self.clone();

        tokio::spawn(
            async move { this.worker().await }
                .instrument(info_span!("sensor_data")),
        );
        true
    }

    pub fn stop_worker(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    async fn worker(self: Arc<Self>) {
        info!("starting");

        while self.running.load(Ordering::SeqCst) {
            let (period, retry_period, async_reports) = {
                let cfg = self.cfg.lock().unwrap();

                (cfg.period, cfg.retry_period, cfg.async_reports)
            };

            let access = match self.dpa.try_exclusive(ACQUIRE_WAIT).await {
                Ok(access) => access,
                Err(_) => {
                    debug!(
                        "exclusive access acquisition failed, retrying in \
			 {} minutes",
                        retry_period
                    );
                    self.sleep(Duration::from_secs(
                        retry_period as u64 * 60,
                    ))
                    .await;
                    continue;
                }
            };

            let next_reading =
                Instant::now() + Duration::from_secs(period as u64 * 60);

            self.reading.store(true, Ordering::SeqCst);

            if async_reports {
                self.send_report(true, None);
            }

            let outcome = self.read_all(&access).await;

            drop(access);
            self.reading.store(false, Ordering::SeqCst);

            match outcome {
                Ok(result) => {
                    if let Err(e) = self.persist(&result) {
                        warn!("couldn't persist sensor values: {}", e);
                    }

                    if async_reports {
                        self.send_report(false, Some(&result));
                    }
                }
                Err(e) => warn!("sensor reading failed: {}", e),
            }

            let now = Instant::now();

            if next_reading > now {
                self.sleep(next_reading - now).await;
            }
        }
    }

    // A notified sleep; `Invoke` wakes it early, `Stop` makes the
    // loop condition fail afterwards.

    async fn sleep(&self, period: Duration) {
        debug!("sensor data worker sleeping for {:?}", period);

        let _ = tokio::time::timeout(period, self.notify.notified()).await;
    }

    /// One complete reading pass under exclusive access. Exposed to
    /// the test suite; the worker loop is a thin shell around this.
    pub(crate) async fn read_once(&self) -> Result<()> {
        let access = self
            .dpa
            .try_exclusive(ACQUIRE_WAIT)
            .await
            .map_err(|_| Error::InUse)?;
        let result = self.read_all(&access).await?;

        drop(access);
        self.persist(&result)
    }

    // -----------------------------------------------------------------
    // Reading

    async fn read_all(
        &self,
        access: &ExclusiveAccess,
    ) -> Result<ReadingResult> {
        let mut result = ReadingResult::default();

        let (addrs, select_map) = {
            let store = self.store.lock().unwrap();
            let mut addrs = store.device_addresses()?;

            addrs.remove(&0);
            (addrs, store.sensor_select_map()?)
        };

        // Fill in HWPID and MID; a device the store can't resolve
        // reads as zero.

        {
            let store = self.store.lock().unwrap();

            for addr in &addrs {
                result.devices.insert(
                    *addr,
                    DeviceReading {
                        mid: store.device_mid(*addr).unwrap_or(0),
                        hwpid: store.device_hwpid(*addr).unwrap_or(0),
                        rssi: None,
                        samples: vec![],
                    },
                );
            }
        }

        let all: Vec<u8> = addrs.iter().copied().collect();

        self.read_rssi(access, &all, &mut result).await;

        for (kind, mounts) in &select_map {
            if *kind >= 0xC0 {
                continue;
            }

            for slot in 0..32u8 {
                let batch_all: Vec<u8> = mounts
                    .iter()
                    .filter(|(_, idx)| *idx == slot)
                    .map(|(addr, _)| *addr)
                    .collect();

                if batch_all.is_empty() {
                    continue;
                }

                for batch in batch_all.chunks(frc_device_count(*kind)?) {
                    self.set_offline_frc(access).await?;

                    let samples =
                        self.sensor_frc(access, *kind, slot, batch).await?;
                    let store = self.store.lock().unwrap();

                    for (addr, value) in samples {
                        let global =
                            store.global_sensor_index(addr, *kind, slot)?;

                        if let Some(device) = result.devices.get_mut(&addr)
                        {
                            device.samples.push((global, value));
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    // RSSI collection: beaming-compatible sensor FRC first, then a
    // plain memory read of the RSSI register for the nodes still
    // lacking a value.

    async fn read_rssi(
        &self,
        access: &ExclusiveAccess,
        addrs: &[u8],
        result: &mut ReadingResult,
    ) {
        for batch in addrs.chunks(MEMORY_READ_BATCH) {
            let outcome = async {
                self.set_offline_frc(access).await?;
                self.sensor_frc(access, RSSI_SENSOR_TYPE, 0, batch).await
            }
            .await;

            match outcome {
                Ok(samples) => {
                    for (addr, value) in samples {
                        if let Some(device) = result.devices.get_mut(&addr)
                        {
                            device.rssi =
                                Some(value as u8 + RSSI_OFFSET);
                        }
                    }
                }
                Err(e) => {
                    debug!("beaming RSSI read failed: {}", e);
                }
            }
        }

        let missing: Vec<u8> = result
            .devices
            .iter()
            .filter(|(_, device)| device.rssi.is_none())
            .map(|(addr, _)| *addr)
            .collect();

        if missing.is_empty() {
            return;
        }

        match self.frc_read_memory(access, &missing).await {
            Ok(values) => {
                for (addr, value) in missing.iter().zip(values) {
                    if let Some(device) = result.devices.get_mut(addr) {
                        device.rssi = Some(value);
                    }
                }
            }
            Err(e) => {
                warn!("failed to get device RSSI via FRC memory read: {}", e)
            }
        }
    }

    async fn set_offline_frc(&self, access: &ExclusiveAccess) -> Result<()> {
        let result = access
            .execute(&embed::frc_set_params(0x08), None)
            .await;

        if result.status.is_ok() {
            Ok(())
        } else {
            Err(Error::OperationError(result.error_str))
        }
    }

    // One driver-rendered sensor FRC over `batch`, extra result only
    // when the batch exceeds the send response capacity. Returns
    // `(address, value)` pairs.

    async fn sensor_frc(
        &self,
        access: &ExclusiveAccess,
        kind: u8,
        slot: u8,
        batch: &[u8],
    ) -> Result<Vec<(u8, f64)>> {
        let command = frc_command_for(kind)?;
        let mut params = json!({
            "sensorType": kind,
            "sensorIndex": slot,
            "frcCommand": command,
            "selectedNodes": batch,
        });

        // The breakdown types need the per-device HWPID to pick the
        // right decoding.

        if kind == 129 || kind == 160 {
            let map = self
                .store
                .lock()
                .unwrap()
                .sensor_device_hwpids(kind)
                .unwrap_or_default();

            params["deviceHwpids"] = serde_json::to_value(map)?;
        }
        let retpars: Value = serde_json::from_str(&self.registry.call(
            0,
            HWPID_DONT_CHECK,
            "iqrf.sensor.Frc_Request_req",
            &params.to_string(),
        )?)?;

        let send_frame = retpars
            .pointer("/retpars/0")
            .ok_or_else(|| Error::DriverError("missing retpars[0]".into()))
            .and_then(|hdp| hdp_to_request(0, HWPID_DONT_CHECK, hdp))?;
        let send_result = access.execute(&send_frame, None).await;
        let send_bytes = match send_result.response {
            Some(bytes) if send_result.status.is_ok() => bytes,
            _ => return Err(Error::OperationError(send_result.error_str)),
        };

        let mut response_param = params.clone();

        response_param["responseFrcSend"] =
            response_to_hdp(&DpaResponse::parse(&send_bytes)?, None);

        if extra_result_required(command, batch.len())? {
            let extra_frame = retpars
                .pointer("/retpars/1")
                .ok_or_else(|| {
                    Error::DriverError("missing retpars[1]".into())
                })
                .and_then(|hdp| hdp_to_request(0, HWPID_DONT_CHECK, hdp))?;
            let extra_result = access.execute(&extra_frame, None).await;
            let extra_bytes = match extra_result.response {
                Some(bytes) if extra_result.status.is_ok() => bytes,
                _ => {
                    return Err(Error::OperationError(
                        extra_result.error_str,
                    ))
                }
            };

            response_param["responseFrcExtraResult"] =
                response_to_hdp(&DpaResponse::parse(&extra_bytes)?, None);
        }

        if let Some(send_request) = retpars.pointer("/retpars/0") {
            response_param["frcSendRequest"] = send_request.clone();
        }

        let parsed: Value = serde_json::from_str(&self.registry.call(
            0,
            HWPID_DONT_CHECK,
            "iqrf.sensor.Frc_Response_rsp",
            &response_param.to_string(),
        )?)?;
        let Some(items) = parsed.get("sensors").and_then(Value::as_array)
        else {
            return Err(Error::DriverError(
                "FRC result without sensors member".into(),
            ));
        };

        // Slot 0 belongs to the coordinator; batch nodes follow in
        // ascending order.

        Ok(batch
            .iter()
            .zip(items.iter().skip(1))
            .filter_map(|(addr, item)| {
                item.get("value")
                    .and_then(Value::as_f64)
                    .map(|value| (*addr, value))
            })
            .collect())
    }

    // Plain FRC memory read over `nodes`, one byte per node.

    async fn frc_read_memory(
        &self,
        access: &ExclusiveAccess,
        nodes: &[u8],
    ) -> Result<Vec<u8>> {
        let mut values = vec![];

        for batch in nodes.chunks(MEMORY_READ_BATCH) {
            let frame = embed::frc_send_selective(
                frc::MEMORY_READ,
                batch.iter().copied(),
                &RSSI_MEMORY_READ,
            );
            let result = access.execute(&frame, None).await;
            let bytes = match result.response {
                Some(bytes) if result.status.is_ok() => bytes,
                _ => return Err(Error::OperationError(result.error_str)),
            };
            let data =
                dpa::FrcData::parse(&DpaResponse::parse(&bytes)?.pdata)?;
            let mut batch_values: Vec<u8> =
                data.data[1..1 + batch.len().min(54)].to_vec();

            if batch.len() > 55 {
                let extra = access
                    .execute(&embed::frc_extra_result(), None)
                    .await;
                let extra_bytes = match extra.response {
                    Some(bytes) if extra.status.is_ok() => bytes,
                    _ => {
                        return Err(Error::OperationError(extra.error_str))
                    }
                };

                batch_values.extend_from_slice(
                    &DpaResponse::parse(&extra_bytes)?.pdata,
                );
                batch_values.truncate(batch.len());
            }
            values.extend_from_slice(&batch_values);
        }
        Ok(values)
    }

    // -----------------------------------------------------------------
    // Persistence and reports

    // All values of a pass share one timestamp.

    fn persist(&self, result: &ReadingResult) -> Result<()> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let store = self.store.lock().unwrap();

        for (addr, device) in &result.devices {
            for (global, value) in &device.samples {
                store.update_sensor_value(*addr, *global, *value, &stamp)?;
            }
        }
        Ok(())
    }

    fn send_report(&self, started: bool, result: Option<&ReadingResult>) {
        let messaging = self.cfg.lock().unwrap().messaging_list.clone();
        let mut doc = json!({ "mType": "iqrfSensorData_Report" });

        set_pointer(&mut doc, "/data/msgId", json!("async"));
        set_pointer(&mut doc, "/data/rsp/reading", json!(started));

        if let Some(result) = result {
            let devices: Vec<Value> = result
                .devices
                .iter()
                .map(|(addr, device)| {
                    json!({
                        "address": addr,
                        "mid": device.mid,
                        "hwpid": device.hwpid,
                        "rssi": device.rssi,
                        "sensors": device
                            .samples
                            .iter()
                            .map(|(index, value)| {
                                json!({"index": index, "value": value})
                            })
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();

            set_pointer(&mut doc, "/data/rsp/devices", json!(devices));
        }
        set_pointer(&mut doc, "/data/status", json!(0));
        set_pointer(&mut doc, "/data/statusStr", json!("ok"));

        if self
            .bus_tx
            .try_send(BusMessage {
                messaging,
                doc,
            })
            .is_err()
        {
            warn!("bus congested; dropping sensor data report");
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle commands

    /// Serves the `iqrfSensorData_*` command surface.
    pub async fn handle_command(self: &Arc<Self>, req: &ApiRequest) -> Value {
        match req.mtype.as_str() {
            "iqrfSensorData_Status" => self.cmd_status(req),
            "iqrfSensorData_Invoke" => self.cmd_invoke(req),
            "iqrfSensorData_Start" => self.cmd_start(req),
            "iqrfSensorData_Stop" => self.cmd_stop(req),
            "iqrfSensorData_GetConfig" => self.cmd_get_config(req),
            "iqrfSensorData_SetConfig" => self.cmd_set_config(req),
            other => reply(
                req,
                crate::dispatch::STATUS_PARSE_ERROR,
                &format!("unsupported message type: {}", other),
            ),
        }
    }

    fn cmd_status(&self, req: &ApiRequest) -> Value {
        let mut doc = reply(req, 0, "ok");

        set_pointer(&mut doc, "/data/rsp/running", json!(self.is_running()));
        set_pointer(&mut doc, "/data/rsp/reading", json!(self.is_reading()));
        doc
    }

    fn cmd_invoke(&self, req: &ApiRequest) -> Value {
        if !self.is_running() {
            return reply(
                req,
                STATUS_NOT_RUNNING,
                "sensor data read worker not running",
            );
        }

        if self.is_reading() {
            return reply(
                req,
                STATUS_READING_IN_PROGRESS,
                "sensor data read already in progress",
            );
        }

        self.notify.notify_waiters();
        reply(req, 0, "ok")
    }

    fn cmd_start(self: &Arc<Self>, req: &ApiRequest) -> Value {
        self.start_worker();
        reply(req, 0, "ok")
    }

    fn cmd_stop(&self, req: &ApiRequest) -> Value {
        self.stop_worker();
        reply(req, 0, "ok")
    }

    fn cmd_get_config(&self, req: &ApiRequest) -> Value {
        let cfg = self.cfg.lock().unwrap().clone();
        let mut doc = reply(req, 0, "ok");

        set_pointer(&mut doc, "/data/rsp/autoRun", json!(cfg.auto_run));
        set_pointer(&mut doc, "/data/rsp/period", json!(cfg.period));
        set_pointer(
            &mut doc,
            "/data/rsp/retryPeriod",
            json!(cfg.retry_period),
        );
        set_pointer(
            &mut doc,
            "/data/rsp/asyncReports",
            json!(cfg.async_reports),
        );
        set_pointer(
            &mut doc,
            "/data/rsp/messagingList",
            serde_json::to_value(&cfg.messaging_list)
                .unwrap_or_else(|_| json!([])),
        );
        doc
    }

    // SetConfig applies atomically: on any failure every field
    // reverts to its previous value.

    fn cmd_set_config(&self, req: &ApiRequest) -> Value {
        let previous = self.cfg.lock().unwrap().clone();
        let outcome = self.apply_config(req);

        match outcome {
            Ok(()) => reply(req, 0, "ok"),
            Err(e) => {
                warn!("{}", e);
                *self.cfg.lock().unwrap() = previous;
                reply(
                    req,
                    STATUS_CONFIG_FAILURE,
                    "failed to load and update component instance \
		     configuration",
                )
            }
        }
    }

    fn apply_config(&self, req: &ApiRequest) -> Result<()> {
        {
            let mut cfg = self.cfg.lock().unwrap();

            if let Some(v) = req
                .doc
                .pointer("/data/req/autoRun")
                .and_then(Value::as_bool)
            {
                cfg.auto_run = v;
            }

            if let Some(v) = req
                .doc
                .pointer("/data/req/period")
                .and_then(Value::as_u64)
            {
                if v < 1 {
                    return Err(Error::ConfigError(
                        "'period' must be at least 1 minute".into(),
                    ));
                }
                cfg.period = v as u32;
            }

            if let Some(v) = req
                .doc
                .pointer("/data/req/retryPeriod")
                .and_then(Value::as_u64)
            {
                if v < 1 {
                    return Err(Error::ConfigError(
                        "'retryPeriod' must be at least 1 minute".into(),
                    ));
                }
                cfg.retry_period = v as u32;
            }

            if let Some(v) = req
                .doc
                .pointer("/data/req/asyncReports")
                .and_then(Value::as_bool)
            {
                cfg.async_reports = v;
            }

            if let Some(list) =
                req.doc.pointer("/data/req/messagingList")
            {
                cfg.messaging_list = serde_json::from_value(list.clone())
                    .map_err(|e| {
                        Error::ConfigError(format!(
                            "bad messagingList: {}",
                            e
                        ))
                    })?;
            }
        }
        self.persist_config()
    }

    // Rewrites the daemon's [sensor_data] config section so the
    // accepted values survive a restart.

    fn persist_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("couldn't read '{}': {}", path, e))
        })?;
        let mut root: toml::Value = toml::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("{}", e)))?;
        let section = toml::Value::try_from(self.cfg.lock().unwrap().clone())
            .map_err(|e| Error::ConfigError(format!("{}", e)))?;

        if let Some(table) = root.as_table_mut() {
            table.insert(String::from("sensor_data"), section);
        }

        let text = toml::to_string(&root)
            .map_err(|e| Error::ConfigError(format!("{}", e)))?;

        std::fs::write(path, text).map_err(|e| {
            Error::ConfigError(format!("couldn't write '{}': {}", path, e))
        })
    }
}

fn reply(req: &ApiRequest, status: i32, status_str: &str) -> Value {
    let mut doc = json!({ "mType": req.mtype });

    set_pointer(&mut doc, "/data/msgId", json!(req.msg_id()));
    set_pointer(&mut doc, "/data/status", json!(status));
    set_pointer(&mut doc, "/data/statusStr", json!(status_str));
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Device, DeviceSensor, Product, Sensor, Store};
    use crate::testing::{SimCoordinator, SimNode, StubRender};
    use iqrfd_api::bus::MessagingInstance;
    use iqrfd_api::dpa::{pcmd, pnum, DpaRequest};
    use tokio::sync::mpsc;

    fn temperature() -> Sensor {
        Sensor {
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
        }
    }

    // A store holding `addrs` devices each mounting one temperature
    // sensor at slot 0.

    fn seeded_store(addrs: &[u8]) -> SharedStore {
        let store = Store::open_in_memory().unwrap();
        let pid = store
            .insert_product(&Product::new(2, 2, 0x08d8, "4.03D", 0x0302))
            .unwrap();
        let sid = store.insert_sensor(&temperature()).unwrap();

        for addr in addrs {
            store
                .insert_device(&Device::new(
                    *addr,
                    true,
                    0xaa00 + *addr as u32,
                    0,
                    0,
                    None,
                    pid,
                ))
                .unwrap();
            store
                .insert_device_sensor(&DeviceSensor::new(
                    *addr, 0x01, 0, 0, sid,
                ))
                .unwrap();
        }
        Arc::new(std::sync::Mutex::new(store))
    }

    fn reader(
        sim: Arc<SimCoordinator>,
        store: SharedStore,
    ) -> (Arc<SensorData>, mpsc::Receiver<BusMessage>) {
        let (bus_tx, bus_rx) = mpsc::channel(64);
        let registry = ContextRegistry::new(
            Arc::new(StubRender::new()),
            String::new(),
        );

        (
            Arc::new(SensorData::new(
                DpaService::new(sim),
                store,
                registry,
                bus_tx,
                SensorDataConfig::default(),
                None,
            )),
            bus_rx,
        )
    }

    fn frc_frames(sim: &SimCoordinator, frc_command: u8) -> Vec<DpaRequest> {
        sim.executed()
            .iter()
            .filter_map(|frame| DpaRequest::from_bytes(frame).ok())
            .filter(|req| {
                req.pnum == pnum::FRC
                    && (req.pcmd == pcmd::FRC_SEND
                        || req.pcmd == pcmd::FRC_SEND_SELECTIVE)
                    && req.pdata.first() == Some(&frc_command)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_node_batch() {
        // Two temperature nodes: exactly one selective send with
        // bits 1 and 2 set, no extra result, both values persisted
        // with a shared timestamp.

        let sim = Arc::new(SimCoordinator::new());

        sim.bond(
            1,
            SimNode {
                frc_value: 0x0168,
                ..SimNode::default()
            },
        );
        sim.bond(
            2,
            SimNode {
                frc_value: 0x0178,
                ..SimNode::default()
            },
        );

        let store = seeded_store(&[1, 2]);
        let (reader, _bus) = reader(sim.clone(), store.clone());

        reader.read_once().await.unwrap();

        let sends = frc_frames(&sim, frc::STD_SENSORS_2BYTE);

        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].pcmd, pcmd::FRC_SEND_SELECTIVE);

        // Mask bytes follow the command byte; bits 1 and 2 of the
        // first byte.

        assert_eq!(sends[0].pdata[1], 0x06);

        let extras: Vec<_> = sim
            .executed()
            .iter()
            .filter_map(|frame| DpaRequest::from_bytes(frame).ok())
            .filter(|req| {
                req.pnum == pnum::FRC && req.pcmd == pcmd::FRC_EXTRA_RESULT
            })
            .collect();

        assert!(extras.is_empty());

        let store = store.lock().unwrap();
        let one = &store.device_sensors(1).unwrap()[0];
        let two = &store.device_sensors(2).unwrap()[0];

        assert_eq!(one.value, Some(22.5));
        assert_eq!(two.value, Some(23.5));
        assert_eq!(one.updated, two.updated);
        assert!(one.updated.is_some());
    }

    #[tokio::test]
    async fn test_batch_split_and_extra_result() {
        // Thirty-five 2-byte sensors split into ceil(35/31) = 2
        // sends; the first batch (31 nodes) needs the extra result,
        // the second (4 nodes) does not.

        let addrs: Vec<u8> = (1..=35).collect();
        let sim = Arc::new(SimCoordinator::new());

        for addr in &addrs {
            sim.bond(*addr, SimNode::default());
        }

        let store = seeded_store(&addrs);
        let (reader, _bus) = reader(sim.clone(), store);

        reader.read_once().await.unwrap();

        let sends = frc_frames(&sim, frc::STD_SENSORS_2BYTE);

        assert_eq!(sends.len(), 2);

        let extras: Vec<_> = sim
            .executed()
            .iter()
            .filter_map(|frame| DpaRequest::from_bytes(frame).ok())
            .filter(|req| {
                req.pnum == pnum::FRC && req.pcmd == pcmd::FRC_EXTRA_RESULT
            })
            .collect();

        assert_eq!(extras.len(), 1);

        // Every selective sensor send was preceded by the offline
        // FRC flag.

        let set_params: Vec<_> = sim
            .executed()
            .iter()
            .filter_map(|frame| DpaRequest::from_bytes(frame).ok())
            .filter(|req| {
                req.pnum == pnum::FRC
                    && req.pcmd == pcmd::FRC_SET_PARAMS
                    && req.pdata == vec![0x08]
            })
            .collect();

        assert!(set_params.len() >= sends.len());
    }

    fn command_request(mtype: &str, extra: Value) -> ApiRequest {
        let mut doc = json!({
            "mType": mtype,
            "data": {"msgId": "c1"}
        });

        if !extra.is_null() {
            set_pointer(&mut doc, "/data/req", extra);
        }
        ApiRequest::new(MessagingInstance::new("test", "test"), doc)
    }

    #[tokio::test]
    async fn test_lifecycle_status_codes() {
        let sim = Arc::new(SimCoordinator::new());
        let store = seeded_store(&[]);
        let (reader, _bus) = reader(sim, store);

        // Invoke while not running.

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_Invoke",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["status"], STATUS_NOT_RUNNING);

        // Invoke while a reading is (artificially) active.

        reader.running.store(true, Ordering::SeqCst);
        reader.reading.store(true, Ordering::SeqCst);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_Invoke",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["status"], STATUS_READING_IN_PROGRESS);

        reader.reading.store(false, Ordering::SeqCst);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_Invoke",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["status"], 0);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_Status",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["rsp"]["running"], true);
        assert_eq!(rsp["data"]["rsp"]["reading"], false);
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_revert() {
        let sim = Arc::new(SimCoordinator::new());
        let store = seeded_store(&[]);
        let (reader, _bus) = reader(sim, store);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_SetConfig",
                json!({
                    "period": 15,
                    "asyncReports": true,
                    "messagingList": [{"type": "mqtt", "instance": "m0"}],
                }),
            ))
            .await;

        assert_eq!(rsp["data"]["status"], 0);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_GetConfig",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["rsp"]["period"], 15);
        assert_eq!(rsp["data"]["rsp"]["asyncReports"], true);
        assert_eq!(
            rsp["data"]["rsp"]["messagingList"][0]["type"],
            "mqtt"
        );

        // A rejected update reverts every field.

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_SetConfig",
                json!({"period": 0, "asyncReports": false}),
            ))
            .await;

        assert_eq!(rsp["data"]["status"], STATUS_CONFIG_FAILURE);

        let rsp = reader
            .handle_command(&command_request(
                "iqrfSensorData_GetConfig",
                Value::Null,
            ))
            .await;

        assert_eq!(rsp["data"]["rsp"]["period"], 15);
        assert_eq!(rsp["data"]["rsp"]["asyncReports"], true);
    }
}
