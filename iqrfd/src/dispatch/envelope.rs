//! The response envelope every API handler emits: `mType` and
//! `data.msgId` echoed, component payloads under `data.rsp`, numeric
//! status plus human-readable string, and, in verbose mode, the raw
//! frame trace of every transaction the exchange ran.

use chrono::SecondsFormat;
use iqrfd_api::bus::ApiRequest;
use iqrfd_api::dpa::{encode_hex, RESPONSE_PCMD_BIT, RESPONSE_HDR_LEN};
use iqrfd_api::txn::{TransactionResult, TxnStatus};
use serde_json::{json, Value};

/// Creates the parents along `pointer` and sets the value at its
/// tail.
pub fn set_pointer(doc: &mut Value, pointer: &str, value: Value) {
    let mut cursor = doc;

    for key in pointer.split('/').filter(|k| !k.is_empty()) {
        if !cursor.is_object() {
            *cursor = json!({});
        }

        cursor = cursor
            .as_object_mut()
            .unwrap()
            .entry(key.to_string())
            .or_insert(Value::Null);
    }
    *cursor = value;
}

struct Payload {
    pointer: String,
    value: Value,
    only_verbose: bool,
}

pub struct Envelope {
    mtype: String,
    msg_id: String,
    verbose: bool,
    nadr: i64,
    hwpid: i64,
    status: i32,
    status_str: String,
    payloads: Vec<Payload>,
    metadata: Option<Value>,
    selected_nodes: Option<Value>,
    sensor_indexes: Option<Value>,
    fallback_per_cmd: Option<(i64, i64)>,
}

impl Envelope {
    pub fn from_request(req: &ApiRequest) -> Self {
        let nadr = req
            .doc
            .pointer("/data/req/nAdr")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let hwpid = req
            .doc
            .pointer("/data/req/hwpId")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let param = req.doc.pointer("/data/req/param").cloned();

        // Selected nodes and sensor indexes are echoed back into the
        // result for the message types that carry them.

        let selected_nodes = match req.mtype.as_str() {
            "iqrfEmbedFrc_SendSelective" | "iqrfEmbedOs_SelectiveBatch" => {
                param
                    .as_ref()
                    .and_then(|p| p.get("selectedNodes"))
                    .cloned()
            }
            _ => None,
        };
        let sensor_indexes =
            if req.mtype == "iqrfSensor_ReadSensorsWithTypes" {
                param
                    .as_ref()
                    .and_then(|p| p.get("sensorIndexes"))
                    .cloned()
            } else {
                None
            };

        Envelope {
            mtype: req.mtype.clone(),
            msg_id: req.msg_id().to_string(),
            verbose: req.verbose(),
            nadr,
            hwpid,
            status: 0,
            status_str: String::from("ok"),
            payloads: vec![],
            metadata: None,
            selected_nodes,
            sensor_indexes,
            fallback_per_cmd: None,
        }
    }

    pub fn nadr(&self) -> i64 {
        self.nadr
    }

    pub fn hwpid(&self) -> i64 {
        self.hwpid
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn set_status(&mut self, status: i32, status_str: impl Into<String>) {
        self.status = status;
        self.status_str = status_str.into();
    }

    pub fn set_txn_status(&mut self, status: TxnStatus) {
        self.status = status.code();
        self.status_str = status.to_string();
    }

    /// Adds a payload set at `pointer`; verbose-only payloads are
    /// dropped from terse responses.
    pub fn set_payload(
        &mut self,
        pointer: &str,
        value: Value,
        only_verbose: bool,
    ) {
        self.payloads.push(Payload {
            pointer: pointer.to_string(),
            value,
            only_verbose,
        });
    }

    pub fn set_metadata(&mut self, metadata: Value) {
        self.metadata = Some(metadata);
    }

    /// Installs the best-effort `(pnum, pcmd)` shown when no request
    /// frame was ever built.
    pub fn set_fallback_per_cmd(&mut self, per_cmd: Option<(u8, u8)>) {
        self.fallback_per_cmd = per_cmd
            .map(|(pnum, pcmd)| {
                (pnum as i64, (pcmd | RESPONSE_PCMD_BIT) as i64)
            })
            .or(Some((-1, -1)));
    }

    /// Renders the envelope. `results` carries the transactions the
    /// handler ran, in order; the first one provides the `data.rsp`
    /// header fields and all of them show up in the verbose trace.
    pub fn create_response(&self, results: &[&TransactionResult]) -> Value {
        let mut doc = json!({ "mType": self.mtype });

        set_pointer(&mut doc, "/data/msgId", json!(self.msg_id));
        set_pointer(&mut doc, "/data/rsp/nAdr", json!(self.nadr));

        let response = results
            .first()
            .and_then(|r| r.response.as_ref())
            .filter(|bytes| bytes.len() >= RESPONSE_HDR_LEN);

        match response {
            Some(bytes) => {
                set_pointer(&mut doc, "/data/rsp/pnum", json!(bytes[2]));
                set_pointer(&mut doc, "/data/rsp/pcmd", json!(bytes[3]));
                set_pointer(
                    &mut doc,
                    "/data/rsp/hwpId",
                    json!(bytes[4] as u16 | (bytes[5] as u16) << 8),
                );
                set_pointer(&mut doc, "/data/rsp/rCode", json!(bytes[6]));
                set_pointer(&mut doc, "/data/rsp/dpaVal", json!(bytes[7]));
            }
            None => {
                // No response frame: echo the request addressing, or
                // the fallback mapping when not even a request was
                // built.

                let (pnum, pcmd) = match results
                    .first()
                    .filter(|r| r.request.len() >= 4)
                {
                    Some(r) => (
                        r.request[2] as i64,
                        (r.request[3] | RESPONSE_PCMD_BIT) as i64,
                    ),
                    None => self.fallback_per_cmd.unwrap_or((-1, -1)),
                };

                set_pointer(&mut doc, "/data/rsp/pnum", json!(pnum));
                set_pointer(&mut doc, "/data/rsp/pcmd", json!(pcmd));
                set_pointer(&mut doc, "/data/rsp/hwpId", json!(-1));
                set_pointer(&mut doc, "/data/rsp/rCode", json!(-1));
                set_pointer(&mut doc, "/data/rsp/dpaVal", json!(-1));
            }
        }

        for payload in &self.payloads {
            if !payload.only_verbose || self.verbose {
                set_pointer(
                    &mut doc,
                    &payload.pointer,
                    payload.value.clone(),
                );
            }
        }

        if self.status == 0 {
            if let Some(nodes) = &self.selected_nodes {
                set_pointer(
                    &mut doc,
                    "/data/rsp/result/selectedNodes",
                    nodes.clone(),
                );
            }

            if let Some(indexes) = &self.sensor_indexes {
                set_pointer(
                    &mut doc,
                    "/data/rsp/result/sensorIndexes",
                    indexes.clone(),
                );
            }
        }

        if let Some(metadata) = &self.metadata {
            set_pointer(&mut doc, "/data/rsp/metaData", metadata.clone());
        }

        set_pointer(&mut doc, "/data/status", json!(self.status));
        set_pointer(&mut doc, "/data/statusStr", json!(self.status_str));

        if self.verbose {
            let raw: Vec<Value> = results
                .iter()
                .map(|r| {
                    json!({
                        "request": encode_hex(&r.request),
                        "requestTs": stamp(&r.request_ts),
                        "confirmation": r
                            .confirmation
                            .as_deref()
                            .map(encode_hex)
                            .unwrap_or_default(),
                        "confirmationTs": stamp(&r.confirmation_ts),
                        "response": r
                            .response
                            .as_deref()
                            .map(encode_hex)
                            .unwrap_or_default(),
                        "responseTs": stamp(&r.response_ts),
                    })
                })
                .collect();

            set_pointer(&mut doc, "/data/raw", json!(raw));
        }
        doc
    }
}

fn stamp(ts: &Option<chrono::DateTime<chrono::Local>>) -> String {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, false))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use iqrfd_api::bus::MessagingInstance;

    fn request(doc: Value) -> ApiRequest {
        ApiRequest::new(MessagingInstance::new("test", "test"), doc)
    }

    #[test]
    fn test_set_pointer() {
        let mut doc = json!({});

        set_pointer(&mut doc, "/data/rsp/result", json!({"x": 1}));
        set_pointer(&mut doc, "/data/status", json!(0));
        assert_eq!(
            doc,
            json!({"data": {"rsp": {"result": {"x": 1}}, "status": 0}})
        );
    }

    #[test]
    fn test_envelope_success() {
        let req = request(json!({
            "mType": "iqrfEmbedOs_Read",
            "data": {"msgId": "m1", "req": {"nAdr": 1, "param": {}}}
        }));
        let mut env = Envelope::from_request(&req);
        let mut result = TransactionResult::failed(
            vec![0x01, 0x00, 0x02, 0x00, 0xff, 0xff],
            TxnStatus::Ok,
            "ok",
        );

        result.response =
            Some(vec![0x01, 0x00, 0x02, 0x80, 0x02, 0x00, 0x00, 0x35]);
        env.set_payload("/data/rsp/result", json!({"osBuild": "08D8"}), false);
        env.set_txn_status(TxnStatus::Ok);

        let doc = env.create_response(&[&result]);

        assert_eq!(doc["mType"], "iqrfEmbedOs_Read");
        assert_eq!(doc["data"]["msgId"], "m1");
        assert_eq!(doc["data"]["rsp"]["nAdr"], 1);
        assert_eq!(doc["data"]["rsp"]["pnum"], 2);
        assert_eq!(doc["data"]["rsp"]["pcmd"], 0x80);
        assert_eq!(doc["data"]["rsp"]["hwpId"], 2);
        assert_eq!(doc["data"]["rsp"]["rCode"], 0);
        assert_eq!(doc["data"]["rsp"]["result"]["osBuild"], "08D8");
        assert_eq!(doc["data"]["status"], 0);
        assert!(doc["data"].get("raw").is_none());
    }

    #[test]
    fn test_envelope_verbose_raw() {
        let req = request(json!({
            "mType": "iqrfRaw",
            "data": {"msgId": "m2", "returnVerbose": true, "req": {}}
        }));
        let mut env = Envelope::from_request(&req);
        let mut result = TransactionResult::failed(
            vec![0x00, 0x00, 0x02, 0x00, 0xff, 0xff],
            TxnStatus::Ok,
            "ok",
        );

        result.response =
            Some(vec![0x00, 0x00, 0x02, 0x80, 0xff, 0xff, 0x00, 0x00]);
        env.set_txn_status(TxnStatus::Ok);

        let doc = env.create_response(&[&result]);
        let raw = doc["data"]["raw"].as_array().unwrap();

        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0]["request"], "00.00.02.00.ff.ff");
        assert_eq!(raw[0]["response"], "00.00.02.80.ff.ff.00.00");
        assert!(!raw[0]["requestTs"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_envelope_driver_failure_fallback() {
        let req = request(json!({
            "mType": "iqrfEmbedOs_Read",
            "data": {"msgId": "m3", "req": {"nAdr": 4, "param": {}}}
        }));
        let mut env = Envelope::from_request(&req);

        env.set_fallback_per_cmd(Some((0x02, 0x00)));
        env.set_txn_status(TxnStatus::Fail);
        env.set_payload("/data/rsp/errorStr", json!("engine says no"), true);

        let doc = env.create_response(&[]);

        assert_eq!(doc["data"]["rsp"]["pnum"], 2);
        assert_eq!(doc["data"]["rsp"]["pcmd"], 0x80);
        assert_eq!(doc["data"]["rsp"]["rCode"], -1);
        assert_eq!(doc["data"]["status"], 1000);

        // errorStr was marked verbose-only and the request was
        // terse.

        assert!(doc["data"]["rsp"].get("errorStr").is_none());
    }
}
