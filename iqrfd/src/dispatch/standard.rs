//! The driver-backed standard handler: message parameters go through
//! the product driver to become a DPA frame, the response frame goes
//! back through the driver to become the structured `result`.

use super::envelope::Envelope;
use super::{mtype, Dispatcher};
use chrono::Local;
use iqrfd_api::bus::ApiRequest;
use iqrfd_api::dpa::{
    hdp_to_request, response_to_hdp, DpaResponse, HWPID_DONT_CHECK,
};
use iqrfd_api::txn::TxnStatus;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub async fn handle(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let mut env = Envelope::from_request(req);

    let Some(function) = mtype::driver_function(&req.mtype) else {
        env.set_status(
            super::STATUS_PARSE_ERROR,
            format!("unsupported message type: {}", &req.mtype),
        );
        return env.create_response(&[]);
    };

    let nadr = env.nadr().max(0) as u16;
    let hwpid = if env.hwpid() < 0 {
        HWPID_DONT_CHECK
    } else {
        env.hwpid() as u16
    };

    ctx.attach_metadata(&mut env, nadr);

    let param = req
        .doc
        .pointer("/data/req/param")
        .cloned()
        .unwrap_or_else(|| json!({}));

    // Phase 1: the request driver function renders the parameters
    // into raw-HDP form.

    let hdp_request = match ctx.registry.call(
        nadr,
        hwpid,
        &format!("{}_Request_req", function),
        &param.to_string(),
    ) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("driver returned unparsable request: {}", e);
                env.set_fallback_per_cmd(mtype::per_cmd(&req.mtype));
                env.set_txn_status(TxnStatus::Fail);
                env.set_payload(
                    "/data/rsp/errorStr",
                    json!(format!("{}", e)),
                    false,
                );
                return env.create_response(&[]);
            }
        },
        Err(e) => {
            // Driver-side encode failure. Keep trace parity by
            // mapping the message type to its peripheral pair.

            env.set_fallback_per_cmd(mtype::per_cmd(&req.mtype));
            env.set_txn_status(TxnStatus::Fail);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
            return env.create_response(&[]);
        }
    };

    let frame = match hdp_to_request(nadr, hwpid, &hdp_request) {
        Ok(frame) => frame,
        Err(e) => {
            env.set_fallback_per_cmd(mtype::per_cmd(&req.mtype));
            env.set_txn_status(TxnStatus::BadRequest);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
            return env.create_response(&[]);
        }
    };

    // Phase 2: the wire exchange.

    let result = ctx
        .dpa
        .execute_repeat(
            &frame,
            super::doc_timeout(&req.doc),
            super::doc_repeat(&req.doc),
        )
        .await;

    let Some(response_bytes) = result.response.clone() else {
        if result.status.is_ok() {
            // No response but not an error (broadcast-style
            // traffic).

            env.set_payload(
                "/data/rsp/result",
                json!({"response": "unrequired"}),
                false,
            );
        } else {
            env.set_payload(
                "/data/rsp/errorStr",
                json!(result.error_str.clone()),
                false,
            );
        }
        env.set_txn_status(result.status);
        return env.create_response(&[&result]);
    };

    if !result.status.is_ok() {
        env.set_payload("/data/rsp/errorStr", json!("rcode error"), false);
        env.set_txn_status(result.status);
        return env.create_response(&[&result]);
    }

    // Phase 3: the response driver function parses the raw-HDP view
    // of the response, with the original request attached for the
    // drivers that need it.

    let response = match DpaResponse::parse(&response_bytes) {
        Ok(rsp) => rsp,
        Err(e) => {
            env.set_txn_status(TxnStatus::BadResponse);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
            return env.create_response(&[&result]);
        }
    };
    let hdp_response = response_to_hdp(&response, Some(&hdp_request));

    match ctx.registry.call(
        nadr,
        hwpid,
        &format!("{}_Response_rsp", function),
        &hdp_response.to_string(),
    ) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(doc) => {
                if req.mtype == "iqrfSensor_ReadSensorsWithTypes" {
                    persist_sensor_values(ctx, nadr as u8, &doc);
                }
                debug!("driver result: {}", &doc);
                env.set_payload("/data/rsp/result", doc, false);
                env.set_txn_status(result.status);
            }
            Err(e) => {
                env.set_txn_status(TxnStatus::BadResponse);
                env.set_payload(
                    "/data/rsp/errorStr",
                    json!(format!("{}", e)),
                    false,
                );
            }
        },
        Err(e) => {
            env.set_txn_status(TxnStatus::BadResponse);
            env.set_payload(
                "/data/rsp/errorStr",
                json!(format!("{}", e)),
                false,
            );
        }
    }
    env.create_response(&[&result])
}

// A successful ReadSensorsWithTypes doubles as a fresh sample for
// every sensor slot it returned; slot order is the device's global
// index order.

fn persist_sensor_values(ctx: &Dispatcher, address: u8, result: &Value) {
    let Some(sensors) = result.get("sensors").and_then(Value::as_array)
    else {
        return;
    };
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let store = ctx.store.lock().unwrap();

    for (index, sensor) in sensors.iter().enumerate() {
        let outcome = match sensor.get("value") {
            Some(Value::Number(n)) => {
                n.as_f64().map_or(Ok(()), |value| {
                    store.update_sensor_value(
                        address,
                        index as u8,
                        value,
                        &stamp,
                    )
                })
            }
            Some(value @ Value::Object(_)) => store.update_sensor_metadata(
                address,
                index as u8,
                value,
                &stamp,
            ),
            _ => Ok(()),
        };

        if let Err(e) = outcome {
            warn!("couldn't persist sensor value: {}", e);
        }
    }
}
