//! DPA frame layout and the conversions between raw frames, typed
//! headers, and the driver-oriented "raw HDP" JSON view.
//!
//! A DPA frame is little-endian where multi-byte:
//!
//! ```text
//! offset 0..1  NADR   target address
//! offset 2     PNUM   peripheral number
//! offset 3     PCMD   peripheral command (response sets bit 0x80)
//! offset 4..5  HWPID  hardware profile id (0xFFFF = do-not-check)
//! [request body follows at offset 6]
//! [response: offset 6 = response code, offset 7 = dpa value, body]
//! ```

use crate::types::Error;
use crate::Result;
use serde_json::{json, Value};

/// Address of the coordinator device.
pub const COORDINATOR_ADDR: u16 = 0;

/// Highest node address assignable in a network.
pub const MAX_ADDR: u16 = 239;

/// HWPID wildcard; the node skips the profile check.
pub const HWPID_DONT_CHECK: u16 = 0xFFFF;

/// Set in a response code when the frame was sent unsolicited.
pub const ASYNC_RESPONSE_BIT: u8 = 0x80;

/// Set in the PCMD of every response frame.
pub const RESPONSE_PCMD_BIT: u8 = 0x80;

/// Longest request/response body carried by one frame.
pub const MAX_PDATA_LEN: usize = 56;

/// Length of the request header (NADR, PNUM, PCMD, HWPID).
pub const REQUEST_HDR_LEN: usize = 6;

/// Length of the response header (request header + rcode + dpa value).
pub const RESPONSE_HDR_LEN: usize = 8;

/// Embedded peripheral numbers and the standard peripherals the
/// daemon works with.
pub mod pnum {
    pub const COORDINATOR: u8 = 0x00;
    pub const NODE: u8 = 0x01;
    pub const OS: u8 = 0x02;
    pub const EEPROM: u8 = 0x03;
    pub const EEEPROM: u8 = 0x04;
    pub const RAM: u8 = 0x05;
    pub const LEDR: u8 = 0x06;
    pub const LEDG: u8 = 0x07;
    pub const SPI: u8 = 0x08;
    pub const IO: u8 = 0x09;
    pub const THERMOMETER: u8 = 0x0A;
    pub const UART: u8 = 0x0C;
    pub const FRC: u8 = 0x0D;
    pub const DALI: u8 = 0x4A;
    pub const BINARY_OUTPUT: u8 = 0x4B;
    pub const SENSOR: u8 = 0x5E;
    pub const LIGHT: u8 = 0x71;
    pub const EXPLORATION: u8 = 0xFF;
}

/// Peripheral commands referenced outside driver code.
pub mod pcmd {
    pub const COORDINATOR_ADDR_INFO: u8 = 0x00;
    pub const COORDINATOR_DISCOVERED_DEVICES: u8 = 0x01;
    pub const COORDINATOR_BONDED_DEVICES: u8 = 0x02;
    pub const COORDINATOR_CLEAR_ALL_BONDS: u8 = 0x03;
    pub const COORDINATOR_BOND_NODE: u8 = 0x04;
    pub const COORDINATOR_REMOVE_BOND: u8 = 0x05;
    pub const COORDINATOR_DISCOVERY: u8 = 0x07;
    pub const COORDINATOR_RESTORE: u8 = 0x0C;
    pub const COORDINATOR_SMART_CONNECT: u8 = 0x12;
    pub const COORDINATOR_SET_MID: u8 = 0x13;

    pub const OS_READ: u8 = 0x00;

    pub const EEEPROM_XREAD: u8 = 0x02;

    pub const FRC_SEND: u8 = 0x00;
    pub const FRC_EXTRA_RESULT: u8 = 0x01;
    pub const FRC_SEND_SELECTIVE: u8 = 0x02;
    pub const FRC_SET_PARAMS: u8 = 0x03;

    pub const EXPLORATION_PER_ENUM: u8 = 0x3F;
    pub const STANDARD_ENUMERATE: u8 = 0x3E;
}

/// FRC commands used by the workers. The sensor values come from the
/// standard-sensor FRC family; the rest are plain embedded FRCs.
pub mod frc {
    pub const PING: u8 = 0x00;
    pub const MEMORY_READ: u8 = 0x03;
    pub const MEMORY_READ_4B: u8 = 0x04;

    pub const STD_SENSORS_BIT: u8 = 0x10;
    pub const STD_SENSORS_BYTE: u8 = 0x90;
    pub const STD_SENSORS_2BYTE: u8 = 0xE0;
    pub const STD_SENSORS_4BYTE: u8 = 0xF9;
}

/// A request frame before encoding. `pdata` holds the body that
/// follows the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpaRequest {
    pub nadr: u16,
    pub pnum: u8,
    pub pcmd: u8,
    pub hwpid: u16,
    pub pdata: Vec<u8>,
}

impl DpaRequest {
    pub fn new(nadr: u16, pnum: u8, pcmd: u8) -> Self {
        DpaRequest {
            nadr,
            pnum,
            pcmd,
            hwpid: HWPID_DONT_CHECK,
            pdata: vec![],
        }
    }

    pub fn with_hwpid(mut self, hwpid: u16) -> Self {
        self.hwpid = hwpid;
        self
    }

    pub fn with_pdata(mut self, pdata: Vec<u8>) -> Self {
        self.pdata = pdata;
        self
    }

    /// Serializes the request into its on-wire byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_HDR_LEN + self.pdata.len());

        buf.push((self.nadr & 0xff) as u8);
        buf.push((self.nadr >> 8) as u8);
        buf.push(self.pnum);
        buf.push(self.pcmd);
        buf.push((self.hwpid & 0xff) as u8);
        buf.push((self.hwpid >> 8) as u8);
        buf.extend_from_slice(&self.pdata);
        buf
    }

    /// Rebuilds a request from raw bytes. Used by the raw API family
    /// where the caller supplies the preformatted frame.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQUEST_HDR_LEN {
            return Err(Error::ProtocolError(format!(
                "request frame too short: {} bytes",
                buf.len()
            )));
        }

        if buf.len() > REQUEST_HDR_LEN + MAX_PDATA_LEN {
            return Err(Error::ProtocolError(format!(
                "request frame too long: {} bytes",
                buf.len()
            )));
        }

        Ok(DpaRequest {
            nadr: buf[0] as u16 | (buf[1] as u16) << 8,
            pnum: buf[2],
            pcmd: buf[3],
            hwpid: buf[4] as u16 | (buf[5] as u16) << 8,
            pdata: buf[REQUEST_HDR_LEN..].to_vec(),
        })
    }

    /// Whether the request targets the FRC peripheral. FRC exchanges
    /// must never be retried because a re-run re-aggregates the
    /// network.
    pub fn is_frc(&self) -> bool {
        self.pnum == pnum::FRC
    }

    /// Whether the request stays on the coordinator and never goes on
    /// air.
    pub fn is_local(&self) -> bool {
        self.nadr == COORDINATOR_ADDR && !self.is_frc()
    }
}

/// A decoded response frame. The async flag is stripped from the
/// response code and remembered separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpaResponse {
    pub nadr: u16,
    pub pnum: u8,
    pub pcmd: u8,
    pub hwpid: u16,
    pub rcode: u8,
    pub asynchronous: bool,
    pub dpa_value: u8,
    pub pdata: Vec<u8>,
}

impl DpaResponse {
    /// Decodes a response frame. Malformed lengths are reported as
    /// protocol errors; the response code is masked and its async bit
    /// kept aside.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RESPONSE_HDR_LEN
            || buf.len() > RESPONSE_HDR_LEN + MAX_PDATA_LEN
        {
            return Err(Error::ProtocolError(format!(
                "invalid response length: {} bytes",
                buf.len()
            )));
        }

        let rcode = buf[6];

        Ok(DpaResponse {
            nadr: buf[0] as u16 | (buf[1] as u16) << 8,
            pnum: buf[2],
            pcmd: buf[3],
            hwpid: buf[4] as u16 | (buf[5] as u16) << 8,
            rcode: rcode & !ASYNC_RESPONSE_BIT,
            asynchronous: rcode & ASYNC_RESPONSE_BIT != 0,
            dpa_value: buf[7],
            pdata: buf[RESPONSE_HDR_LEN..].to_vec(),
        })
    }

    /// Re-encodes the response into its on-wire byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_HDR_LEN + self.pdata.len());
        let rcode = if self.asynchronous {
            self.rcode | ASYNC_RESPONSE_BIT
        } else {
            self.rcode
        };

        buf.push((self.nadr & 0xff) as u8);
        buf.push((self.nadr >> 8) as u8);
        buf.push(self.pnum);
        buf.push(self.pcmd);
        buf.push((self.hwpid & 0xff) as u8);
        buf.push((self.hwpid >> 8) as u8);
        buf.push(rcode);
        buf.push(self.dpa_value);
        buf.extend_from_slice(&self.pdata);
        buf
    }

    /// Verifies the addressing triple against the issued request.
    /// Responses set the top bit of PCMD, so it is masked before the
    /// comparison.
    pub fn check_against(&self, req: &DpaRequest) -> Result<()> {
        if self.nadr != req.nadr {
            return Err(Error::ProtocolError(format!(
                "nadr mismatch: expected {}, delivered {}",
                req.nadr, self.nadr
            )));
        }

        if self.pnum != req.pnum {
            return Err(Error::ProtocolError(format!(
                "pnum mismatch: expected {}, delivered {}",
                req.pnum, self.pnum
            )));
        }

        let pcmd = self.pcmd & !RESPONSE_PCMD_BIT;

        if pcmd != req.pcmd {
            return Err(Error::ProtocolError(format!(
                "pcmd mismatch: expected {}, delivered {}",
                req.pcmd, pcmd
            )));
        }
        Ok(())
    }
}

/// Encodes bytes as the dotted hex form used in driver JSON and the
/// verbose trace arrays: two lower-case characters per byte, `.`
/// separated.
pub fn encode_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(".")
}

/// Parses dotted hex back into bytes. Dots, spaces, and tabs are all
/// accepted as separators since driver code is not consistent about
/// them.
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    text.split(['.', ' ', '\t'])
        .filter(|s| !s.is_empty())
        .map(|s| {
            u8::from_str_radix(s, 16).map_err(|_| {
                Error::ParseError(format!("invalid hex byte '{}'", s))
            })
        })
        .collect()
}

/// Parses a single hex-encoded byte (no separators).
pub fn parse_hex_byte(text: &str) -> Result<u8> {
    u8::from_str_radix(text, 16)
        .map_err(|_| Error::ParseError(format!("invalid hex byte '{}'", text)))
}

// Reads a string-valued hex field from a raw-HDP document, accepting
// both casings of the key since driver sources differ.

fn hdp_field<'a>(hdp: &'a Value, camel: &str, lower: &str) -> Option<&'a str> {
    hdp.get(camel)
        .or_else(|| hdp.get(lower))
        .and_then(Value::as_str)
}

/// Converts a raw-HDP request document produced by a driver function
/// into a DPA request frame. Drivers never set NADR or HWPID, so the
/// caller passes them in.
pub fn hdp_to_request(
    nadr: u16,
    hwpid: u16,
    hdp: &Value,
) -> Result<DpaRequest> {
    let pnum = hdp_field(hdp, "pNum", "pnum")
        .ok_or_else(|| Error::ParseError("expected string pNum".into()))
        .and_then(parse_hex_byte)?;
    let pcmd = hdp_field(hdp, "pCmd", "pcmd")
        .ok_or_else(|| Error::ParseError("expected string pCmd".into()))
        .and_then(parse_hex_byte)?;

    let pdata = match hdp.get("rdata") {
        Some(Value::String(s)) => {
            let data = parse_hex(s)?;

            if data.len() > MAX_PDATA_LEN {
                return Err(Error::ProtocolError(format!(
                    "request body too long: {} bytes",
                    data.len()
                )));
            }
            data
        }
        Some(_) => {
            return Err(Error::ParseError("expected string rdata".into()))
        }
        None => vec![],
    };

    Ok(DpaRequest {
        nadr,
        pnum,
        pcmd,
        hwpid,
        pdata,
    })
}

/// Converts a response frame into the raw-HDP document handed to
/// driver response functions. The originally issued raw-HDP request
/// is attached under `originalRequest`, because some drivers (the
/// sensor breakdown parsing in particular) need the request
/// parameters to interpret the response.
pub fn response_to_hdp(
    rsp: &DpaResponse,
    original_request: Option<&Value>,
) -> Value {
    let mut doc = json!({
        "pNum": format!("{:02x}", rsp.pnum),
        "pCmd": format!("{:02x}", rsp.pcmd),
        "rcode": format!("{:02x}", rsp.rcode),
        "dpaval": format!("{:02x}", rsp.dpa_value),
    });

    if !rsp.pdata.is_empty() {
        doc["rdata"] = Value::String(encode_hex(&rsp.pdata));
    }

    if let Some(orig) = original_request {
        doc["originalRequest"] = orig.clone();
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_codec() {
        assert_eq!(encode_hex(&[]), "");
        assert_eq!(encode_hex(&[0x00]), "00");
        assert_eq!(encode_hex(&[0x00, 0xff, 0x5e]), "00.ff.5e");

        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("00.ff.5e").unwrap(), vec![0x00, 0xff, 0x5e]);
        assert_eq!(parse_hex("00 ff 5e").unwrap(), vec![0x00, 0xff, 0x5e]);
        assert!(parse_hex("zz").is_err());

        // Round trip.

        let data = vec![0u8, 1, 2, 127, 128, 255];

        assert_eq!(parse_hex(&encode_hex(&data)).unwrap(), data);
    }

    #[test]
    fn test_request_layout() {
        let req = DpaRequest::new(1, pnum::OS, pcmd::OS_READ);
        let bytes = req.to_bytes();

        assert_eq!(bytes, vec![0x01, 0x00, 0x02, 0x00, 0xff, 0xff]);
        assert_eq!(DpaRequest::from_bytes(&bytes).unwrap(), req);

        let req = DpaRequest::new(0x1234, 0x0d, 0x02)
            .with_hwpid(0xabcd)
            .with_pdata(vec![1, 2, 3]);
        let bytes = req.to_bytes();

        assert_eq!(bytes[0], 0x34);
        assert_eq!(bytes[1], 0x12);
        assert_eq!(bytes[4], 0xcd);
        assert_eq!(bytes[5], 0xab);
        assert_eq!(DpaRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_request_length_limits() {
        assert!(DpaRequest::from_bytes(&[0; 5]).is_err());
        assert!(DpaRequest::from_bytes(&[0; 6]).is_ok());
        assert!(DpaRequest::from_bytes(&[0; 62]).is_ok());
        assert!(DpaRequest::from_bytes(&[0; 63]).is_err());
    }

    #[test]
    fn test_response_parse() {
        // OS read response from the coordinator.

        let buf = [
            0x00, 0x00, 0x02, 0x80, 0xff, 0xff, 0x00, 0x00, 0xd8, 0x08, 0x43,
            0x04,
        ];
        let rsp = DpaResponse::parse(&buf).unwrap();

        assert_eq!(rsp.nadr, 0);
        assert_eq!(rsp.pnum, pnum::OS);
        assert_eq!(rsp.pcmd, 0x80);
        assert_eq!(rsp.rcode, 0);
        assert!(!rsp.asynchronous);
        assert_eq!(rsp.pdata, vec![0xd8, 0x08, 0x43, 0x04]);
        assert_eq!(rsp.to_bytes(), buf);

        let req = DpaRequest::new(0, pnum::OS, pcmd::OS_READ);

        assert!(rsp.check_against(&req).is_ok());
    }

    #[test]
    fn test_response_async_bit() {
        let buf = [0x01, 0x00, 0x5e, 0xfb, 0xff, 0xff, 0x80, 0x00];
        let rsp = DpaResponse::parse(&buf).unwrap();

        assert!(rsp.asynchronous);
        assert_eq!(rsp.rcode, 0);
        assert_eq!(rsp.to_bytes(), buf);
    }

    #[test]
    fn test_response_mismatches() {
        let rsp = DpaResponse::parse(&[
            0x02, 0x00, 0x02, 0x80, 0xff, 0xff, 0x00, 0x00,
        ])
        .unwrap();

        assert!(rsp
            .check_against(&DpaRequest::new(1, pnum::OS, pcmd::OS_READ))
            .is_err());
        assert!(rsp
            .check_against(&DpaRequest::new(2, pnum::RAM, 0))
            .is_err());
        assert!(rsp
            .check_against(&DpaRequest::new(2, pnum::OS, 0x01))
            .is_err());
        assert!(rsp
            .check_against(&DpaRequest::new(2, pnum::OS, pcmd::OS_READ))
            .is_ok());
    }

    #[test]
    fn test_hdp_request() {
        let hdp = json!({"pNum": "5e", "pCmd": "01", "rdata": "01.02"});
        let req = hdp_to_request(3, 0xffff, &hdp).unwrap();

        assert_eq!(req.nadr, 3);
        assert_eq!(req.pnum, 0x5e);
        assert_eq!(req.pcmd, 0x01);
        assert_eq!(req.pdata, vec![1, 2]);

        // Lower-case keys are produced by some driver sources.

        let hdp = json!({"pnum": "00", "pcmd": "02"});
        let req = hdp_to_request(0, 0xffff, &hdp).unwrap();

        assert_eq!(req.pnum, 0);
        assert_eq!(req.pcmd, 2);
        assert!(req.pdata.is_empty());

        assert!(hdp_to_request(0, 0, &json!({"pCmd": "00"})).is_err());
    }

    #[test]
    fn test_hdp_response() {
        let rsp = DpaResponse::parse(&[
            0x01, 0x00, 0x5e, 0x81, 0xff, 0x7f, 0x00, 0x35, 0x0a, 0x00,
        ])
        .unwrap();
        let orig = json!({"pNum": "5e", "pCmd": "01"});
        let doc = response_to_hdp(&rsp, Some(&orig));

        assert_eq!(doc["pNum"], "5e");
        assert_eq!(doc["pCmd"], "81");
        assert_eq!(doc["rcode"], "00");
        assert_eq!(doc["dpaval"], "35");
        assert_eq!(doc["rdata"], "0a.00");
        assert_eq!(doc["originalRequest"], orig);
    }
}
