//! The database read API: structured views over the stored network
//! model, served without touching the radio.

use super::{set_pointer, Dispatcher, STATUS_PARSE_ERROR};
use crate::dpa::{dpa_version_string, mid_string, os_build_string};
use iqrfd_api::bus::ApiRequest;
use serde_json::{json, Value};

pub fn handle(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    match req.mtype.as_str() {
        "iqrfDb_GetDevices" => get_devices(ctx, req),
        "iqrfDb_GetBinaryOutputs" => get_binary_outputs(ctx, req),
        "iqrfDb_GetDalis" => get_dalis(ctx, req),
        "iqrfDb_GetLights" => get_lights(ctx, req),
        "iqrfDb_GetSensors" => get_sensors(ctx, req),
        "iqrfDb_GetDeviceMetadata" => get_metadata(ctx, req),
        "iqrfDb_SetDeviceMetadata" => set_metadata(ctx, req),
        "iqrfDb_Reset" => reset(ctx, req),
        other => reply(
            req,
            STATUS_PARSE_ERROR,
            &format!("unsupported message type: {}", other),
        ),
    }
}

fn reply(req: &ApiRequest, status: i32, status_str: &str) -> Value {
    let mut doc = json!({ "mType": req.mtype });

    set_pointer(&mut doc, "/data/msgId", json!(req.msg_id()));
    set_pointer(&mut doc, "/data/status", json!(status));
    set_pointer(&mut doc, "/data/statusStr", json!(status_str));
    doc
}

fn store_failure(req: &ApiRequest, e: impl std::fmt::Display) -> Value {
    reply(req, STATUS_PARSE_ERROR, &format!("{}", e))
}

fn requested_addresses(req: &ApiRequest) -> Vec<u8> {
    req.doc
        .pointer("/data/req/devices")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|n| n as u8))
                .collect()
        })
        .unwrap_or_default()
}

fn get_devices(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let addrs = requested_addresses(req);
    let brief = req
        .doc
        .pointer("/data/req/brief")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let pairs = {
        let store = ctx.store.lock().unwrap();

        match store.devices_with_products(&addrs) {
            Ok(pairs) => pairs,
            Err(e) => return store_failure(req, e),
        }
    };

    let devices: Vec<Value> = pairs
        .iter()
        .map(|(device, product)| {
            let mut doc = json!({
                "address": device.address,
                "mid": device.mid,
                "hwpid": product.hwpid,
                "discovered": device.discovered,
            });

            if !brief {
                doc["midHex"] = json!(mid_string(device.mid));
                doc["hwpidVersion"] = json!(product.hwpid_version);
                doc["osBuild"] = json!(os_build_string(product.os_build));
                doc["osVersion"] = json!(product.os_version);
                doc["dpaVersion"] =
                    json!(dpa_version_string(product.dpa_version));
                doc["enumerated"] = json!(device.enumerated);
                doc["vrn"] = json!(device.vrn);
                doc["zone"] = json!(device.zone);
                doc["parent"] = json!(device.parent);
                doc["productName"] = json!(product.name);
            }
            doc
        })
        .collect();

    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/devices", json!(devices));
    doc
}

fn get_binary_outputs(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let rows = match ctx.store.lock().unwrap().binary_outputs() {
        Ok(rows) => rows,
        Err(e) => return store_failure(req, e),
    };
    let devices: Vec<Value> = rows
        .iter()
        .map(|(address, count)| {
            json!({"address": address, "count": count})
        })
        .collect();
    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/binoutDevices", json!(devices));
    doc
}

fn get_dalis(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let rows = match ctx.store.lock().unwrap().dalis() {
        Ok(rows) => rows,
        Err(e) => return store_failure(req, e),
    };
    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/daliDevices", json!(rows));
    doc
}

fn get_lights(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let rows = match ctx.store.lock().unwrap().lights() {
        Ok(rows) => rows,
        Err(e) => return store_failure(req, e),
    };
    let devices: Vec<Value> = rows
        .iter()
        .map(|(address, count)| {
            json!({"address": address, "count": count})
        })
        .collect();
    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/lightDevices", json!(devices));
    doc
}

fn get_sensors(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let rows = match ctx.store.lock().unwrap().device_sensor_details() {
        Ok(rows) => rows,
        Err(e) => return store_failure(req, e),
    };

    // Group the flat rows into one entry per device.

    let mut devices: Vec<Value> = vec![];

    for (mount, sensor) in rows {
        let entry = json!({
            "index": mount.global_index,
            "typeIndex": mount.type_index,
            "type": sensor.kind,
            "name": sensor.name,
            "shortname": sensor.short_name,
            "unit": sensor.unit,
            "decimals": sensor.decimals,
            "value": mount.value,
            "updated": mount.updated,
            "metadata": mount
                .metadata
                .as_deref()
                .and_then(|text| serde_json::from_str::<Value>(text).ok()),
        });

        match devices.last_mut() {
            Some(device)
                if device["address"] == json!(mount.address) =>
            {
                device["sensors"].as_array_mut().unwrap().push(entry);
            }
            _ => devices.push(json!({
                "address": mount.address,
                "sensors": [entry],
            })),
        }
    }

    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/sensorDevices", json!(devices));
    doc
}

fn get_metadata(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let addrs = requested_addresses(req);
    let store = ctx.store.lock().unwrap();
    let devices: Vec<Value> = addrs
        .iter()
        .map(|addr| match store.device_metadata(*addr) {
            Ok(metadata) => {
                json!({"address": addr, "metadata": metadata})
            }
            Err(_) => json!({"address": addr, "metadata": null}),
        })
        .collect();
    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/devices", json!(devices));
    doc
}

// Unknown addresses are reported per device and don't fail the
// batch.

fn set_metadata(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let entries = req
        .doc
        .pointer("/data/req/devices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let store = ctx.store.lock().unwrap();
    let devices: Vec<Value> = entries
        .iter()
        .filter_map(|entry| {
            let addr = entry.get("address").and_then(Value::as_u64)? as u8;
            let metadata = entry
                .get("metadata")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let ok = store.set_device_metadata(addr, &metadata).is_ok();

            Some(json!({"address": addr, "success": ok}))
        })
        .collect();
    let mut doc = reply(req, 0, "ok");

    set_pointer(&mut doc, "/data/rsp/devices", json!(devices));
    doc
}

// Resets the network model and schedules a fresh enumeration pass so
// the model rebuilds from the live network. The driver contexts are
// dropped with it; the pass reloads them from the rebuilt rows.

fn reset(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    if let Err(e) = ctx.store.lock().unwrap().reset() {
        return store_failure(req, e);
    }

    ctx.registry.clear();
    ctx.invoke_enumeration();
    reply(req, 0, "ok")
}
