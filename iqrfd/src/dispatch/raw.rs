//! The raw API family: `iqrfRaw` sends a preformatted frame
//! verbatim, `iqrfRawHdp` assembles one from structured fields.

use super::envelope::Envelope;
use super::Dispatcher;
use iqrfd_api::bus::ApiRequest;
use iqrfd_api::dpa::{
    encode_hex, parse_hex, DpaRequest, HWPID_DONT_CHECK, RESPONSE_HDR_LEN,
};
use serde_json::{json, Value};

/// `iqrfRaw`: the request document carries the whole frame as dotted
/// hex in `data.req.rData`; the response echoes the raw response
/// frame the same way.
pub async fn handle_raw(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let mut env = Envelope::from_request(req);
    let rdata = req
        .doc
        .pointer("/data/req/rData")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let frame = match parse_hex(rdata)
        .and_then(|bytes| DpaRequest::from_bytes(&bytes))
    {
        Ok(frame) => frame,
        Err(e) => {
            env.set_status(super::STATUS_PARSE_ERROR, format!("{}", e));
            return env.create_response(&[]);
        }
    };

    ctx.attach_metadata(&mut env, frame.nadr);

    let result = ctx
        .dpa
        .execute_repeat(
            &frame,
            super::doc_timeout(&req.doc),
            super::doc_repeat(&req.doc),
        )
        .await;

    if let Some(response) = &result.response {
        env.set_payload("/data/rsp/rData", json!(encode_hex(response)), false);
    }
    env.set_txn_status(result.status);
    env.create_response(&[&result])
}

/// `iqrfRawHdp`: structured header fields plus an optional byte
/// vector body; the response is returned in the same structured
/// form.
pub async fn handle_raw_hdp(ctx: &Dispatcher, req: &ApiRequest) -> Value {
    let mut env = Envelope::from_request(req);
    let data = &req.doc;

    let nadr = data.pointer("/data/req/nAdr").and_then(Value::as_u64);
    let pnum = data.pointer("/data/req/pNum").and_then(Value::as_u64);
    let pcmd = data.pointer("/data/req/pCmd").and_then(Value::as_u64);

    let (Some(nadr), Some(pnum), Some(pcmd)) = (nadr, pnum, pcmd) else {
        env.set_status(
            super::STATUS_PARSE_ERROR,
            "expected numeric nAdr, pNum, pCmd",
        );
        return env.create_response(&[]);
    };

    let hwpid = data
        .pointer("/data/req/hwpId")
        .and_then(Value::as_u64)
        .unwrap_or(HWPID_DONT_CHECK as u64);
    let pdata: Vec<u8> = data
        .pointer("/data/req/pData")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|b| b as u8))
                .collect()
        })
        .unwrap_or_default();

    let frame = DpaRequest::new(nadr as u16, pnum as u8, pcmd as u8)
        .with_hwpid(hwpid as u16)
        .with_pdata(pdata);

    ctx.attach_metadata(&mut env, frame.nadr);

    let result = ctx
        .dpa
        .execute_repeat(
            &frame,
            super::doc_timeout(&req.doc),
            super::doc_repeat(&req.doc),
        )
        .await;

    if let Some(response) = &result.response {
        if response.len() >= RESPONSE_HDR_LEN {
            let body: Vec<u8> = response[RESPONSE_HDR_LEN..].to_vec();

            env.set_payload("/data/rsp/pData", json!(body), false);
        }
    }
    env.set_txn_status(result.status);
    env.create_response(&[&result])
}
