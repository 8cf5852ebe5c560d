//! Request builders for the embedded peripherals.

use super::select_nodes;
use iqrfd_api::dpa::{frc, pcmd, pnum, DpaRequest, COORDINATOR_ADDR};

/// Coordinator: bonded-devices bitmap.
pub fn bonded_devices() -> DpaRequest {
    DpaRequest::new(
        COORDINATOR_ADDR,
        pnum::COORDINATOR,
        pcmd::COORDINATOR_BONDED_DEVICES,
    )
}

/// Coordinator: discovered-devices bitmap.
pub fn discovered_devices() -> DpaRequest {
    DpaRequest::new(
        COORDINATOR_ADDR,
        pnum::COORDINATOR,
        pcmd::COORDINATOR_DISCOVERED_DEVICES,
    )
}

/// Coordinator EEEPROM extended read: `len` bytes from `address`.
/// The MID table and the routing arrays live here.
pub fn eeeprom_read(address: u16, len: u8) -> DpaRequest {
    DpaRequest::new(COORDINATOR_ADDR, pnum::EEEPROM, pcmd::EEEPROM_XREAD)
        .with_pdata(vec![(address & 0xff) as u8, (address >> 8) as u8, len])
}

/// Embedded OS read.
pub fn os_read(nadr: u16) -> DpaRequest {
    DpaRequest::new(nadr, pnum::OS, pcmd::OS_READ)
}

/// Peripheral enumeration.
pub fn peripheral_enumeration(nadr: u16) -> DpaRequest {
    DpaRequest::new(nadr, pnum::EXPLORATION, pcmd::EXPLORATION_PER_ENUM)
}

/// Standard enumerate command of a standard peripheral (binary
/// output and light answer with their capability count).
pub fn standard_enumerate(nadr: u16, peripheral: u8) -> DpaRequest {
    DpaRequest::new(nadr, peripheral, pcmd::STANDARD_ENUMERATE)
}

/// Broadcast FRC with the given command and user data.
pub fn frc_send(frc_command: u8, user_data: &[u8]) -> DpaRequest {
    let mut pdata = vec![frc_command];

    pdata.extend_from_slice(user_data);
    DpaRequest::new(COORDINATOR_ADDR, pnum::FRC, pcmd::FRC_SEND)
        .with_pdata(pdata)
}

/// Selective FRC restricted to `nodes`.
pub fn frc_send_selective(
    frc_command: u8,
    nodes: impl IntoIterator<Item = u8>,
    user_data: &[u8],
) -> DpaRequest {
    let mut pdata = vec![frc_command];

    pdata.extend_from_slice(&select_nodes(nodes));
    pdata.extend_from_slice(user_data);
    DpaRequest::new(COORDINATOR_ADDR, pnum::FRC, pcmd::FRC_SEND_SELECTIVE)
        .with_pdata(pdata)
}

/// FRC extra result: data beyond the 55 bytes of the send response.
pub fn frc_extra_result() -> DpaRequest {
    DpaRequest::new(COORDINATOR_ADDR, pnum::FRC, pcmd::FRC_EXTRA_RESULT)
}

/// FRC set-params. `0x08` enables the offline flag the sensor
/// reader sets before every selective read.
pub fn frc_set_params(params: u8) -> DpaRequest {
    DpaRequest::new(COORDINATOR_ADDR, pnum::FRC, pcmd::FRC_SET_PARAMS)
        .with_pdata(vec![params])
}

/// FRC ping, used to learn which nodes are online.
pub fn frc_ping() -> DpaRequest {
    frc_send(frc::PING, &[0, 0])
}

/// Selective FRC memory read collecting 4 bytes per node from
/// `address` after the node executed the embedded request given by
/// `(req_pnum, req_pcmd)`.
pub fn frc_memory_read_4b(
    nodes: impl IntoIterator<Item = u8>,
    address: u16,
    req_pnum: u8,
    req_pcmd: u8,
) -> DpaRequest {
    frc_send_selective(
        frc::MEMORY_READ_4B,
        nodes,
        &[
            0,
            0,
            (address & 0xff) as u8,
            (address >> 8) as u8,
            req_pnum,
            req_pcmd,
            0,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_requests() {
        let req = bonded_devices();

        assert_eq!(
            req.to_bytes(),
            vec![0x00, 0x00, 0x00, 0x02, 0xff, 0xff]
        );

        let req = discovered_devices();

        assert_eq!(req.to_bytes()[3], 0x01);
    }

    #[test]
    fn test_eeeprom_read() {
        let req = eeeprom_read(0x4000, 54);

        assert_eq!(req.pnum, pnum::EEEPROM);
        assert_eq!(req.pcmd, pcmd::EEEPROM_XREAD);
        assert_eq!(req.pdata, vec![0x00, 0x40, 54]);
    }

    #[test]
    fn test_frc_selective_layout() {
        let req = frc_memory_read_4b([1u8, 2], 0x04a7, 0xff, 0x3f);

        // command + 30-byte mask + 7 bytes of user data
        assert_eq!(req.pdata.len(), 38);
        assert_eq!(req.pdata[0], frc::MEMORY_READ_4B);
        assert_eq!(req.pdata[1], 0x06);
        assert_eq!(&req.pdata[31..], &[0, 0, 0xa7, 0x04, 0xff, 0x3f, 0]);
    }

    #[test]
    fn test_frc_ping() {
        let req = frc_ping();

        assert_eq!(req.pdata, vec![frc::PING, 0, 0]);
        assert!(req.is_frc());
    }

    #[test]
    fn test_frc_set_params() {
        assert_eq!(frc_set_params(0x08).pdata, vec![0x08]);
    }
}
