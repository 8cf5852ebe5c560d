//! Typed builders and parsers for the embedded DPA operations the
//! workers issue directly (the driver-backed API path renders its
//! frames through the scripting engine instead).

use iqrfd_api::dpa::MAX_ADDR;
use iqrfd_api::{Error, Result};
use std::collections::BTreeSet;

pub mod embed;

/// Formats an OS build word the way the catalog and the API expose
/// it.
pub fn os_build_string(os_build: u16) -> String {
    format!("{:04X}", os_build)
}

/// Formats an OS version byte together with the module type suffix,
/// e.g. `0x43` on a PIC16LF1938 module renders as "4.03D".
pub fn os_version_string(os_version: u8, tr_mcu: u8) -> String {
    let suffix = match tr_mcu & 0x07 {
        4 => "D",
        5 => "G",
        _ => "",
    };

    format!("{:x}.{:02x}{}", os_version >> 4, os_version & 0x0f, suffix)
}

/// Formats a module id as its canonical 8-digit serial string.
pub fn mid_string(mid: u32) -> String {
    format!("{:08X}", mid)
}

/// Formats a DPA version word, e.g. `0x0414` renders as "4.14".
pub fn dpa_version_string(dpa: u16) -> String {
    format!("{:X}.{:02X}", (dpa & 0x3FFF) >> 8, dpa & 0xFF)
}

/// Collects the addresses whose bit is set in a bonded/discovered
/// bitmap. Address 0 is never part of a bitmap.
pub fn bitmap_to_addrs(bitmap: &[u8]) -> BTreeSet<u8> {
    let mut addrs = BTreeSet::new();

    for addr in 1..=MAX_ADDR as usize {
        if addr / 8 < bitmap.len() && bitmap[addr / 8] & (1 << (addr % 8)) != 0
        {
            addrs.insert(addr as u8);
        }
    }
    addrs
}

/// Builds the 30-byte selected-nodes mask of an FRC selective send.
pub fn select_nodes(nodes: impl IntoIterator<Item = u8>) -> [u8; 30] {
    let mut mask = [0u8; 30];

    for addr in nodes {
        mask[addr as usize / 8] |= 1 << (addr as usize % 8);
    }
    mask
}

/// The decoded body of an embedded OS read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRead {
    pub mid: u32,
    pub os_version: u8,
    pub tr_mcu: u8,
    pub os_build: u16,
    pub rssi: u8,
    pub supply_voltage: u8,
}

impl OsRead {
    pub fn parse(pdata: &[u8]) -> Result<Self> {
        if pdata.len() < 10 {
            return Err(Error::ProtocolError(format!(
                "OS read response too short: {} bytes",
                pdata.len()
            )));
        }

        Ok(OsRead {
            mid: pdata[0] as u32
                | (pdata[1] as u32) << 8
                | (pdata[2] as u32) << 16
                | (pdata[3] as u32) << 24,
            os_version: pdata[4],
            tr_mcu: pdata[5],
            os_build: pdata[6] as u16 | (pdata[7] as u16) << 8,
            rssi: pdata[8],
            supply_voltage: pdata[9],
        })
    }

    pub fn os_version_string(&self) -> String {
        os_version_string(self.os_version, self.tr_mcu)
    }
}

/// The decoded body of a peripheral enumeration response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerEnum {
    pub dpa_version: u16,
    pub user_per_count: u8,
    pub embedded_pers: [u8; 4],
    pub hwpid: u16,
    pub hwpid_version: u16,
    pub flags: u8,
    pub user_pers: Vec<u8>,
}

impl PerEnum {
    pub fn parse(pdata: &[u8]) -> Result<Self> {
        if pdata.len() < 12 {
            return Err(Error::ProtocolError(format!(
                "peripheral enumeration response too short: {} bytes",
                pdata.len()
            )));
        }

        Ok(PerEnum {
            dpa_version: pdata[0] as u16 | (pdata[1] as u16) << 8,
            user_per_count: pdata[2],
            embedded_pers: [pdata[3], pdata[4], pdata[5], pdata[6]],
            hwpid: pdata[7] as u16 | (pdata[8] as u16) << 8,
            hwpid_version: pdata[9] as u16 | (pdata[10] as u16) << 8,
            flags: pdata[11],
            user_pers: pdata[12..].to_vec(),
        })
    }

    /// Every peripheral the device implements: embedded bits 0..31
    /// plus user peripherals starting at 0x20.
    pub fn peripherals(&self) -> BTreeSet<i16> {
        let mut pers = BTreeSet::new();

        for (byte, bits) in self.embedded_pers.iter().enumerate() {
            for bit in 0..8 {
                if bits & (1 << bit) != 0 {
                    pers.insert((byte * 8 + bit) as i16);
                }
            }
        }

        if self.user_per_count > 0 {
            for (byte, bits) in self.user_pers.iter().enumerate() {
                for bit in 0..8 {
                    if bits & (1 << bit) != 0 {
                        pers.insert((0x20 + byte * 8 + bit) as i16);
                    }
                }
            }
        }
        pers
    }
}

/// The decoded body of an FRC send/send-selective response: the
/// aggregate status followed by up to 55 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrcData {
    pub status: u8,
    pub data: Vec<u8>,
}

impl FrcData {
    pub fn parse(pdata: &[u8]) -> Result<Self> {
        if pdata.is_empty() {
            return Err(Error::ProtocolError(
                "empty FRC response".to_string(),
            ));
        }

        let status = pdata[0];

        if status >= 0xEF {
            return Err(Error::ProtocolError(format!(
                "FRC response error, status: {}",
                status
            )));
        }

        Ok(FrcData {
            status,
            data: pdata[1..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_strings() {
        assert_eq!(os_build_string(0x08d8), "08D8");
        assert_eq!(os_version_string(0x43, 0x04), "4.03D");
        assert_eq!(os_version_string(0x43, 0x05), "4.03G");
        assert_eq!(os_version_string(0x42, 0x24), "4.02D");
        assert_eq!(mid_string(0x01020304), "01020304");
        assert_eq!(dpa_version_string(0x0414), "4.14");
        assert_eq!(dpa_version_string(0x0302), "3.02");
    }

    #[test]
    fn test_bitmap_to_addrs() {
        let mut bitmap = [0u8; 30];

        bitmap[0] = 0x06; // addresses 1 and 2
        bitmap[1] = 0x01; // address 8

        assert_eq!(bitmap_to_addrs(&bitmap), BTreeSet::from([1, 2, 8]));

        // Bit 0 of byte 0 is not an address.

        let mut bitmap = [0u8; 30];

        bitmap[0] = 0x01;
        assert!(bitmap_to_addrs(&bitmap).is_empty());
    }

    #[test]
    fn test_select_nodes() {
        let mask = select_nodes([1u8, 2]);

        assert_eq!(mask[0], 0x06);
        assert!(mask[1..].iter().all(|b| *b == 0));

        let mask = select_nodes([10u8, 239]);

        assert_eq!(mask[1], 0x04);
        assert_eq!(mask[29], 0x80);
    }

    #[test]
    fn test_os_read_parse() {
        let pdata = [
            0x04, 0x03, 0x02, 0x01, 0x43, 0x04, 0xd8, 0x08, 0x00, 0x30,
        ];
        let os = OsRead::parse(&pdata).unwrap();

        assert_eq!(os.mid, 0x01020304);
        assert_eq!(os.os_build, 0x08d8);
        assert_eq!(os.os_version_string(), "4.03D");

        assert!(OsRead::parse(&pdata[..8]).is_err());
    }

    #[test]
    fn test_per_enum_parse() {
        // DPA 4.20, no user peripherals, embedded coordinator + os +
        // frc, hwpid 0x0203 v1.

        let pdata = [
            0x20, 0x04, 0x00, 0b0000_0101, 0b0010_0000, 0, 0, 0x03, 0x02,
            0x01, 0x00, 0x01,
        ];
        let en = PerEnum::parse(&pdata).unwrap();

        assert_eq!(en.dpa_version, 0x0420);
        assert_eq!(en.hwpid, 0x0203);
        assert_eq!(en.hwpid_version, 1);
        assert_eq!(en.peripherals(), BTreeSet::from([0, 2, 13]));
    }

    #[test]
    fn test_frc_data() {
        let mut pdata = vec![0x01];

        pdata.extend_from_slice(&[0u8; 55]);

        let data = FrcData::parse(&pdata).unwrap();

        assert_eq!(data.status, 1);
        assert_eq!(data.data.len(), 55);

        assert!(FrcData::parse(&[0xef]).is_err());
        assert!(FrcData::parse(&[]).is_err());
    }
}
