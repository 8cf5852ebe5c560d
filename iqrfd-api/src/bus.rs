//! Types carried over the message bus between the messaging splitter
//! and the daemon's request handlers.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one messaging endpoint (transport type plus configured
/// instance name) behind the splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingInstance {
    #[serde(rename = "type")]
    pub kind: String,
    pub instance: String,
}

impl MessagingInstance {
    pub fn new(kind: &str, instance: &str) -> Self {
        MessagingInstance {
            kind: kind.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for MessagingInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.instance)
    }
}

/// An inbound API request delivered by the splitter. `mtype` is the
/// value of the document's `mType` member, extracted up front so
/// handlers can route without re-parsing.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub messaging: MessagingInstance,
    pub mtype: String,
    pub doc: Value,
}

impl ApiRequest {
    pub fn new(messaging: MessagingInstance, doc: Value) -> Self {
        let mtype = doc
            .get("mType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        ApiRequest {
            messaging,
            mtype,
            doc,
        }
    }

    /// The request's correlation id (`data.msgId`), empty when the
    /// sender omitted it.
    pub fn msg_id(&self) -> &str {
        self.doc
            .pointer("/data/msgId")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Whether the sender asked for the verbose trace arrays.
    pub fn verbose(&self) -> bool {
        self.doc
            .pointer("/data/returnVerbose")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// An outbound document. An empty messaging list means "broadcast to
/// every endpoint accepting async messages".
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub messaging: Vec<MessagingInstance>,
    pub doc: Value,
}

impl BusMessage {
    pub fn to(messaging: MessagingInstance, doc: Value) -> Self {
        BusMessage {
            messaging: vec![messaging],
            doc,
        }
    }

    pub fn broadcast(doc: Value) -> Self {
        BusMessage {
            messaging: vec![],
            doc,
        }
    }
}

/// Transmit handle handlers use to publish documents to the
/// splitter.
pub type BusTx = mpsc::Sender<BusMessage>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_request_fields() {
        let req = ApiRequest::new(
            MessagingInstance::new("test", "test"),
            json!({
                "mType": "iqrfEmbedOs_Read",
                "data": {"msgId": "42", "returnVerbose": true}
            }),
        );

        assert_eq!(req.mtype, "iqrfEmbedOs_Read");
        assert_eq!(req.msg_id(), "42");
        assert!(req.verbose());

        let req = ApiRequest::new(
            MessagingInstance::new("test", "test"),
            json!({"data": {}}),
        );

        assert_eq!(req.mtype, "");
        assert_eq!(req.msg_id(), "");
        assert!(!req.verbose());
    }
}
