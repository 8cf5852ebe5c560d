//! Unsolicited DPA frames. The coordinator forwards every frame
//! whose response code carries the async bit; the dispatcher
//! fabricates a synthetic request for the message types it can map
//! and renders the frame through the same driver path as a solicited
//! response.

use super::envelope::Envelope;
use super::Dispatcher;
use iqrfd_api::bus::{ApiRequest, MessagingInstance};
use iqrfd_api::dpa::{encode_hex, pnum, response_to_hdp, DpaResponse};
use iqrfd_api::txn::{TransactionResult, TxnStatus};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tracing::debug;

// Sensor standard: ReadSensorsWithTypes rendered from an FRC value
// beam.

const ASYNC_SENSOR_PCMD: u8 = 0x7B;

/// Produces the broadcast documents an unsolicited frame expands to.
pub fn handle(ctx: &Dispatcher, frame: &[u8]) -> Vec<Value> {
    let mut out = vec![];

    // The raw API mirrors every async frame verbatim when
    // configured to.

    if ctx.async_dpa_message {
        let mut doc = json!({ "mType": "iqrfRaw" });

        super::envelope::set_pointer(&mut doc, "/data/msgId", json!("async"));
        super::envelope::set_pointer(
            &mut doc,
            "/data/rsp/rData",
            json!(encode_hex(frame)),
        );
        super::envelope::set_pointer(&mut doc, "/data/status", json!(0));
        super::envelope::set_pointer(&mut doc, "/data/statusStr", json!("ok"));
        out.push(doc);
    }

    match render_standard(ctx, frame) {
        Ok(Some(doc)) => out.push(doc),
        Ok(None) => {}
        Err(e) => debug!("wrong format of async response: {}", e),
    }
    out
}

fn render_standard(
    ctx: &Dispatcher,
    frame: &[u8],
) -> iqrfd_api::Result<Option<Value>> {
    let rsp = DpaResponse::parse(frame)?;

    if !rsp.asynchronous || rsp.rcode != 0 {
        return Err(iqrfd_api::Error::ProtocolError(format!(
            "invalid async response code: {}",
            rsp.rcode
        )));
    }

    // Only certain standards have an async rendering; unsupported
    // frames are skipped without complaint.

    if rsp.pnum != pnum::SENSOR || rsp.pcmd & 0x7F != ASYNC_SENSOR_PCMD {
        debug!(
            "unsupported async frame: pnum {} pcmd {}",
            rsp.pnum, rsp.pcmd
        );
        return Ok(None);
    }

    let function = "iqrf.sensor.ReadSensorsWithTypesFrcValue_AsyncResponse";
    let mtype = "iqrfSensor_ReadSensorsWithTypes";
    let msg_id = format!(
        "async-{}",
        ctx.async_counter.fetch_add(1, Ordering::SeqCst) + 1
    );

    // The synthetic request mirrors what a caller would have sent;
    // verbose is hardwired so the trace is always available.

    let fake_request = ApiRequest::new(
        MessagingInstance::new("async", "async"),
        json!({
            "mType": mtype,
            "data": {
                "msgId": msg_id,
                "req": {
                    "nAdr": rsp.nadr,
                    "hwpId": rsp.hwpid,
                    "param": {},
                },
                "returnVerbose": true,
            },
        }),
    );
    let mut env = Envelope::from_request(&fake_request);

    ctx.attach_metadata(&mut env, rsp.nadr);

    let result = TransactionResult::unsolicited(frame.to_vec());
    let hdp_response = response_to_hdp(&rsp, None);

    match ctx.registry.call(
        rsp.nadr,
        rsp.hwpid,
        function,
        &hdp_response.to_string(),
    ) {
        Ok(text) => {
            let doc: Value = serde_json::from_str(&text)?;

            env.set_payload("/data/rsp/result", doc, false);
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
    Ok(Some(env.create_response(&[&result])))
}
