//! The Standards transition: probes each standard a device's
//! product declares and reconciles the capability rows.

use super::Enumerator;
use crate::dpa::embed;
use crate::exclusive::ExclusiveAccess;
use crate::store::{self, DeviceSensor, Store};
use iqrfd_api::dpa::{
    hdp_to_request, pnum, response_to_hdp, DpaResponse, HWPID_DONT_CHECK,
};
use iqrfd_api::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Peripheral numbers of the probed standards.
const PER_BINOUT: i16 = pnum::BINARY_OUTPUT as i16;
const PER_DALI: i16 = pnum::DALI as i16;
const PER_LIGHT: i16 = pnum::LIGHT as i16;
const PER_SENSOR: i16 = pnum::SENSOR as i16;

/// One enumerated sensor slot as the driver reports it.
pub(super) struct SensorItem {
    pub kind: u8,
    pub name: String,
    pub short_name: String,
    pub unit: Option<String>,
    pub decimals: u8,
    pub frcs: Vec<u8>,
}

impl Enumerator {
    /// Probes standards for every device that is not yet enumerated
    /// (or all of them on a full re-enumeration). Radio probing
    /// happens first; the capability rows are then reconciled in one
    /// transaction per device, and a failure rolls back only that
    /// device.
    pub(super) async fn standard_enumeration(
        &self,
        access: &ExclusiveAccess,
        reenumerate: bool,
    ) -> Result<()> {
        let devices: Vec<store::Device> = {
            let store = self.store.lock().unwrap();

            store
                .devices()?
                .into_iter()
                .filter(|device| !device.enumerated || reenumerate)
                .collect()
        };

        for device in devices {
            if let Err(e) = self.enumerate_device_standards(access, &device).await
            {
                warn!(
                    "standards enumeration failed for address {}: {}",
                    device.address, e
                );
            }
        }
        Ok(())
    }

    async fn enumerate_device_standards(
        &self,
        access: &ExclusiveAccess,
        device: &store::Device,
    ) -> Result<()> {
        let (has_binout, has_dali, has_light, has_sensor) = {
            let store = self.store.lock().unwrap();

            (
                store.device_implements_peripheral(device.id, PER_BINOUT)?,
                store.device_implements_peripheral(device.id, PER_DALI)?,
                store.device_implements_peripheral(device.id, PER_LIGHT)?,
                store.device_implements_peripheral(device.id, PER_SENSOR)?,
            )
        };

        // Radio probes first, so the database work below is one
        // synchronous transaction.

        let binout_count = if has_binout {
            Some(self.probe_count(access, device, pnum::BINARY_OUTPUT).await?)
        } else {
            None
        };
        let light_count = if has_light {
            Some(self.probe_count(access, device, pnum::LIGHT).await?)
        } else {
            None
        };
        let sensors = if has_sensor {
            Some(self.probe_sensors(access, device).await?)
        } else {
            None
        };

        let store = self.store.lock().unwrap();

        store.with_transaction(|store| {
            match binout_count {
                Some(count) => store.upsert_binary_output(device.id, count)?,
                None => store.remove_binary_output(device.id)?,
            }

            if has_dali {
                if store.dali_by_device(device.id)?.is_none() {
                    store.insert_dali(device.id)?;
                }
            } else {
                store.remove_dali(device.id)?;
            }

            match light_count {
                Some(count) => store.upsert_light(device.id, count)?,
                None => store.remove_light(device.id)?,
            }

            match &sensors {
                Some(items) => {
                    reconcile_sensors(store, device.address, items)?
                }
                None => store.remove_device_sensors(device.address)?,
            }

            if let Some(mut device) = store.device_by_id(device.id)? {
                device.enumerated = true;
                store.update_device(&device)?;
            }
            Ok(())
        })
    }

    // Binary output and light answer their Enumerate command with a
    // single count byte.

    async fn probe_count(
        &self,
        access: &ExclusiveAccess,
        device: &store::Device,
        peripheral: u8,
    ) -> Result<u8> {
        let rsp = access
            .execute_repeat(
                &embed::standard_enumerate(device.address as u16, peripheral),
                None,
                1,
            )
            .await;

        match rsp.response {
            Some(bytes) if rsp.status.is_ok() => {
                let parsed = DpaResponse::parse(&bytes)?;

                parsed.pdata.first().copied().ok_or_else(|| {
                    Error::ProtocolError(
                        "empty standard enumerate response".into(),
                    )
                })
            }
            _ => Err(Error::OperationError(rsp.error_str)),
        }
    }

    // The sensor inventory comes through the driver, which knows the
    // quantity catalog.

    async fn probe_sensors(
        &self,
        access: &ExclusiveAccess,
        device: &store::Device,
    ) -> Result<Vec<SensorItem>> {
        let hwpid = {
            let store = self.store.lock().unwrap();

            store.device_hwpid(device.address).unwrap_or(HWPID_DONT_CHECK)
        };
        let hdp_request: Value = serde_json::from_str(&self.registry.call(
            device.address as u16,
            hwpid,
            "iqrf.sensor.Enumerate_Request_req",
            "{}",
        )?)?;
        let frame =
            hdp_to_request(device.address as u16, HWPID_DONT_CHECK, &hdp_request)?;
        let result = access.execute_repeat(&frame, None, 1).await;

        let bytes = match result.response {
            Some(bytes) if result.status.is_ok() => bytes,
            _ => return Err(Error::OperationError(result.error_str)),
        };
        let hdp_response =
            response_to_hdp(&DpaResponse::parse(&bytes)?, Some(&hdp_request));
        let parsed: Value = serde_json::from_str(&self.registry.call(
            device.address as u16,
            hwpid,
            "iqrf.sensor.Enumerate_Response_rsp",
            &hdp_response.to_string(),
        )?)?;

        let Some(items) = parsed.get("sensors").and_then(Value::as_array)
        else {
            return Err(Error::DriverError(
                "sensor enumeration without sensors member".into(),
            ));
        };

        items
            .iter()
            .map(|item| {
                let kind = item
                    .get("type")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        Error::DriverError("sensor item missing type".into())
                    })? as u8;

                Ok(SensorItem {
                    kind,
                    name: item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    short_name: item
                        .get("shortName")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    unit: item
                        .get("unit")
                        .and_then(Value::as_str)
                        .map(String::from),
                    decimals: item
                        .get("decimalPlaces")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u8,
                    frcs: item
                        .get("frcs")
                        .and_then(Value::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_u64().map(|n| n as u8))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Reconciles a device's sensor inventory: slots are matched by
/// global index, a slot that changed sensor identity is replaced
/// (with its dense per-type index reassigned), vanished slots are
/// removed.
pub(super) fn reconcile_sensors(
    store: &Store,
    address: u8,
    items: &[SensorItem],
) -> Result<()> {
    let stored = store.device_sensors(address)?;
    let mut type_counters: BTreeMap<u8, u8> = BTreeMap::new();

    for (index, item) in items.iter().enumerate() {
        let global_index = index as u8;
        let sensor_id =
            match store.sensor_by_type_name(item.kind, &item.name)? {
                Some(sensor) => sensor.id,
                None => store.insert_sensor(&store::Sensor {
                    id: 0,
                    kind: item.kind,
                    name: item.name.clone(),
                    short_name: item.short_name.clone(),
                    unit: item.unit.clone(),
                    decimals: item.decimals,
                    frc_2bit: item.frcs.contains(&0x10),
                    frc_1byte: item.frcs.contains(&0x90),
                    frc_2byte: item.frcs.contains(&0xE0),
                    frc_4byte: item.frcs.contains(&0xF9),
                })?,
            };

        let counter = type_counters.entry(item.kind).or_insert(0);
        let type_index = *counter;

        *counter += 1;

        match stored.iter().find(|m| m.global_index == global_index) {
            Some(mount)
                if mount.sensor_id == sensor_id
                    && mount.kind == item.kind
                    && mount.type_index == type_index => {}
            Some(_) => {
                store.remove_device_sensor(address, global_index)?;
                store.insert_device_sensor(&DeviceSensor::new(
                    address,
                    item.kind,
                    global_index,
                    type_index,
                    sensor_id,
                ))?;
            }
            None => {
                store.insert_device_sensor(&DeviceSensor::new(
                    address,
                    item.kind,
                    global_index,
                    type_index,
                    sensor_id,
                ))?;
            }
        }
    }

    for mount in &stored {
        if mount.global_index as usize >= items.len() {
            store.remove_device_sensor(address, mount.global_index)?;
        }
    }
    Ok(())
}
