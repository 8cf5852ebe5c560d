//! The FRC-standard handler: one driver-rendered send (plus optional
//! extra-result) exchange under exclusive access, with result
//! filtering and the extended per-node output format.

use super::envelope::Envelope;
use super::{mtype, Dispatcher};
use chrono::Local;
use iqrfd_api::bus::ApiRequest;
use iqrfd_api::dpa::{hdp_to_request, response_to_hdp, DpaResponse};
use iqrfd_api::txn::{TransactionResult, TxnStatus};
use iqrfd_api::{Error, Result};
use serde_json::{json, Value};
use tokio::time::Duration;
use tracing::warn;

const EXCLUSIVE_WAIT: Duration = Duration::from_millis(2_000);

fn selected_nodes(param: &Value) -> Vec<u8> {
    param
        .get("selectedNodes")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|n| n as u8))
                .collect()
        })
        .unwrap_or_default()
}

pub async fn handle(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let mut env = Envelope::from_request(req);
    let function = match mtype::driver_function(&req.mtype) {
        Some(f) => f,
        None => {
            env.set_status(
                super::STATUS_PARSE_ERROR,
                format!("unsupported message type: {}", &req.mtype),
            );
            return env.create_response(&[]);
        }
    };
    let param = req
        .doc
        .pointer("/data/req/param")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let selected = selected_nodes(&param);
    let hwpid = if env.hwpid() < 0 {
        iqrfd_api::dpa::HWPID_DONT_CHECK
    } else {
        env.hwpid() as u16
    };

    // Render the send and extra-result commands through the driver.

    let retpars = match ctx
        .registry
        .call(0, hwpid, &format!("{}_Request_req", function),
              &param.to_string())
        .map_err(|e| Error::DriverError(format!("{}", e)))
        .and_then(|text| {
            serde_json::from_str::<Value>(&text).map_err(Error::from)
        }) {
        Ok(doc) => doc,
        Err(e) => {
            env.set_fallback_per_cmd(Some(mtype::frc_per_cmd(
                !selected.is_empty(),
            )));
            env.set_txn_status(TxnStatus::Fail);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
            return env.create_response(&[]);
        }
    };

    let send_frame = retpars
        .pointer("/retpars/0")
        .ok_or_else(|| Error::DriverError("missing retpars[0]".into()))
        .and_then(|hdp| hdp_to_request(0, hwpid, hdp));
    let extra_frame = retpars
        .pointer("/retpars/1")
        .ok_or_else(|| Error::DriverError("missing retpars[1]".into()))
        .and_then(|hdp| hdp_to_request(0, hwpid, hdp));

    let (send_frame, extra_frame) = match (send_frame, extra_frame) {
        (Ok(send), Ok(extra)) => (send, extra),
        (Err(e), _) | (_, Err(e)) => {
            env.set_fallback_per_cmd(Some(mtype::frc_per_cmd(
                !selected.is_empty(),
            )));
            env.set_txn_status(TxnStatus::Fail);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
            return env.create_response(&[]);
        }
    };

    // The two-phase exchange holds exclusive access so nothing
    // interleaves between send and extra-result.

    let access = match ctx.dpa.try_exclusive(EXCLUSIVE_WAIT).await {
        Ok(access) => access,
        Err(_) => {
            env.set_status(
                super::STATUS_EXCLUSIVE_ACCESS,
                "exclusive access unavailable",
            );
            return env.create_response(&[]);
        }
    };

    let send_result = access
        .execute(&send_frame, super::doc_timeout(&req.doc))
        .await;

    if !send_result.status.is_ok() {
        env.set_txn_status(send_result.status);
        env.set_payload(
            "/data/rsp/errorStr",
            json!(send_result.error_str.clone()),
            false,
        );
        return env.create_response(&[&send_result]);
    }

    let want_extra = param
        .get("getExtraResult")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let extra_result = if want_extra {
        let result = access.execute(&extra_frame, None).await;

        if !result.status.is_ok() {
            env.set_txn_status(result.status);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(result.error_str.clone()),
                false,
            );
            return env.create_response(&[&send_result, &result]);
        }
        Some(result)
    } else {
        None
    };

    drop(access);

    match decode(ctx, req, &param, &function, &retpars, &send_result,
                 extra_result.as_ref(), &selected)
    {
        Ok(result_doc) => {
            env.set_payload("/data/rsp/result", result_doc, false);
            env.set_txn_status(TxnStatus::Ok);
        }
        Err(e) => {
            env.set_txn_status(TxnStatus::BadResponse);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
        }
    }

    let mut results: Vec<&TransactionResult> = vec![&send_result];

    if let Some(extra) = &extra_result {
        results.push(extra);
    }
    env.create_response(&results)
}

// Decodes the exchange through the response driver function and
// applies the filtering/reshaping options.

#[allow(clippy::too_many_arguments)]
fn decode(
    ctx: &Dispatcher,
    req: &ApiRequest,
    param: &Value,
    function: &str,
    retpars: &Value,
    send_result: &TransactionResult,
    extra_result: Option<&TransactionResult>,
    selected: &[u8],
) -> Result<Value> {
    let mut response_param = param.clone();

    // The breakdown sensor types decode per-device; hand the driver
    // the stored HWPID map.

    if req.mtype == "iqrfSensor_Frc" {
        if let Some(kind) =
            param.get("sensorType").and_then(Value::as_u64)
        {
            if kind == 129 || kind == 160 {
                let map = ctx
                    .store
                    .lock()
                    .unwrap()
                    .sensor_device_hwpids(kind as u8)
                    .unwrap_or_default();

                response_param["deviceHwpids"] =
                    serde_json::to_value(map).unwrap_or_default();
            }
        }
    }

    let send_bytes = send_result
        .response
        .as_ref()
        .ok_or_else(|| Error::ProtocolError("no FRC response".into()))?;
    let send_rsp = DpaResponse::parse(send_bytes)?;

    response_param["responseFrcSend"] = response_to_hdp(&send_rsp, None);

    if let Some(extra) = extra_result {
        let extra_bytes = extra.response.as_ref().ok_or_else(|| {
            Error::ProtocolError("no FRC extra response".into())
        })?;
        let extra_rsp = DpaResponse::parse(extra_bytes)?;

        response_param["responseFrcExtraResult"] =
            response_to_hdp(&extra_rsp, None);
    }

    if let Some(send_request) = retpars.pointer("/retpars/0") {
        response_param["frcSendRequest"] = send_request.clone();
    }

    let text = ctx.registry.call(
        0,
        iqrfd_api::dpa::HWPID_DONT_CHECK,
        &format!("{}_Response_rsp", function),
        &response_param.to_string(),
    )?;
    let mut result: Value = serde_json::from_str(&text)?;
    let array_key = mtype::frc_array_key(&req.mtype);

    if !selected.is_empty() {
        filter_selected_nodes(&mut result, array_key, selected.len())?;
    }

    if req.mtype == "iqrfSensor_Frc" {
        persist_frc_values(ctx, param, &result, array_key, selected);
    }

    let ext_format = param
        .get("extFormat")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if ext_format {
        convert_to_extended_format(
            ctx,
            &mut result,
            array_key,
            mtype::frc_item_key(&req.mtype),
            selected,
        )?;
    }
    Ok(result)
}

/// Drops the leading (coordinator) slot and keeps exactly one item
/// per selected node.
fn filter_selected_nodes(
    result: &mut Value,
    array_key: &str,
    count: usize,
) -> Result<()> {
    let items = result
        .get(array_key)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            Error::ProtocolError(format!(
                "expected member {} to be an array",
                array_key
            ))
        })?;

    if items.is_empty() {
        return Ok(());
    }

    if count + 1 > items.len() {
        return Err(Error::ProtocolError(format!(
            "result member {} contains less items than requested nodes",
            array_key
        )));
    }

    result[array_key] = Value::Array(items[1..1 + count].to_vec());
    Ok(())
}

/// Reshapes a flat result array into per-node objects annotated with
/// the stored module id and HWPID (and metadata when enabled).
fn convert_to_extended_format(
    ctx: &Dispatcher,
    result: &mut Value,
    array_key: &str,
    item_key: &str,
    selected: &[u8],
) -> Result<()> {
    let items = result
        .get(array_key)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            Error::ProtocolError(format!(
                "expected member {} to be an array",
                array_key
            ))
        })?;

    if items.is_empty() {
        return Ok(());
    }

    let addrs: Vec<u8> = if selected.is_empty() {
        (0..items.len() as u8).collect()
    } else {
        selected.to_vec()
    };

    if addrs.len() != items.len() {
        return Err(Error::ProtocolError(
            "addr count does not match result item count".into(),
        ));
    }

    let (node_map, metadata) = {
        let store = ctx.store.lock().unwrap();
        let node_map = store.node_mid_hwpid_map().unwrap_or_default();
        let metadata: Vec<Option<Value>> = addrs
            .iter()
            .map(|addr| {
                ctx.metadata_to_messages
                    .then(|| store.device_metadata(*addr).ok())
                    .flatten()
            })
            .collect();

        (node_map, metadata)
    };

    let converted: Vec<Value> = addrs
        .iter()
        .zip(items)
        .zip(metadata)
        .map(|((addr, item), meta)| {
            let mut doc = json!({ "nAdr": addr, item_key: item });

            match node_map.get(addr) {
                Some((mid, hwpid)) => {
                    doc["mid"] = json!(mid);
                    doc["hwpid"] = json!(hwpid);
                }
                None => {
                    doc["mid"] = Value::Null;
                    doc["hwpid"] = Value::Null;
                }
            }

            if let Some(meta) = meta {
                doc["metaData"] = meta;
            }
            doc
        })
        .collect();

    result[array_key] = Value::Array(converted);
    Ok(())
}

// A selective sensor FRC is also a fresh sample for every selected
// node's slot.

fn persist_frc_values(
    ctx: &Dispatcher,
    param: &Value,
    result: &Value,
    array_key: &str,
    selected: &[u8],
) {
    if selected.is_empty() {
        return;
    }

    let (Some(kind), Some(index)) = (
        param.get("sensorType").and_then(Value::as_u64),
        param.get("sensorIndex").and_then(Value::as_u64),
    ) else {
        return;
    };
    let Some(items) = result.get(array_key).and_then(Value::as_array) else {
        return;
    };
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let store = ctx.store.lock().unwrap();

    for (addr, item) in selected.iter().zip(items) {
        let Some(value) =
            item.get("value").and_then(Value::as_f64)
        else {
            continue;
        };

        let outcome = store
            .global_sensor_index(*addr, kind as u8, index as u8)
            .and_then(|global| {
                store.update_sensor_value(*addr, global, value, &stamp)
            });

        if let Err(e) = outcome {
            warn!("couldn't persist FRC value for node {}: {}", addr, e);
        }
    }
}
