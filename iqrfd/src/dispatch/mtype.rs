//! Message-type tables: the driver-function name each API message
//! type renders through, and the best-effort `(pnum, pcmd)` mapping
//! used for trace parity when the request-side driver call fails.

use iqrfd_api::dpa::{pcmd, pnum};

// Message-type prefix to driver namespace.

const PREFIXES: &[(&str, &str)] = &[
    ("iqrfEmbedCoordinator_", "iqrf.embed.coordinator."),
    ("iqrfEmbedNode_", "iqrf.embed.node."),
    ("iqrfEmbedOs_", "iqrf.embed.os."),
    ("iqrfEmbedEeprom_", "iqrf.embed.eeprom."),
    ("iqrfEmbedEeeprom_", "iqrf.embed.eeeprom."),
    ("iqrfEmbedRam_", "iqrf.embed.ram."),
    ("iqrfEmbedLedr_", "iqrf.embed.ledr."),
    ("iqrfEmbedLedg_", "iqrf.embed.ledg."),
    ("iqrfEmbedSpi_", "iqrf.embed.spi."),
    ("iqrfEmbedIo_", "iqrf.embed.io."),
    ("iqrfEmbedThermometer_", "iqrf.embed.thermometer."),
    ("iqrfEmbedUart_", "iqrf.embed.uart."),
    ("iqrfEmbedFrc_", "iqrf.embed.frc."),
    ("iqrfEmbedExplore_", "iqrf.embed.explore."),
    ("iqrfSensor_", "iqrf.sensor."),
    ("iqrfBinaryoutput_", "iqrf.binaryoutput."),
    ("iqrfLight_", "iqrf.light."),
    ("iqrfDali_", "iqrf.dali."),
];

/// The two-phase FRC message types handled by the extended path.
pub const FRC_STANDARD_TYPES: &[&str] = &[
    "iqrfDali_Frc",
    "iqrfLight_FrcLaiRead",
    "iqrfLight_FrcLdiSend",
    "iqrfSensor_Frc",
];

/// Maps a message type to the driver function that renders it, e.g.
/// `iqrfEmbedOs_Read` becomes `iqrf.embed.os.Read`.
pub fn driver_function(mtype: &str) -> Option<String> {
    PREFIXES.iter().find_map(|(prefix, namespace)| {
        mtype
            .strip_prefix(prefix)
            .map(|suffix| format!("{}{}", namespace, suffix))
    })
}

/// The result-array member of an FRC-standard response document.
pub fn frc_array_key(mtype: &str) -> &'static str {
    match mtype {
        "iqrfSensor_Frc" => "sensors",
        "iqrfLight_FrcLaiRead" => "voltages",
        _ => "answers",
    }
}

/// The per-node member name used when reshaping an FRC result into
/// extended format.
pub fn frc_item_key(mtype: &str) -> &'static str {
    match mtype {
        "iqrfSensor_Frc" => "sensor",
        "iqrfLight_FrcLaiRead" => "voltage",
        _ => "answer",
    }
}

/// Best-effort `(pnum, pcmd)` for a message type. Used to fill the
/// response trace when the driver could not encode the request.
pub fn per_cmd(mtype: &str) -> Option<(u8, u8)> {
    let entry = match mtype {
        "iqrfEmbedExplore_Enumerate" => {
            (pnum::EXPLORATION, pcmd::EXPLORATION_PER_ENUM)
        }
        "iqrfEmbedCoordinator_AddrInfo" => (pnum::COORDINATOR, 0x00),
        "iqrfEmbedCoordinator_DiscoveredDevices" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_DISCOVERED_DEVICES)
        }
        "iqrfEmbedCoordinator_BondedDevices" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_BONDED_DEVICES)
        }
        "iqrfEmbedCoordinator_ClearAllBonds" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_CLEAR_ALL_BONDS)
        }
        "iqrfEmbedCoordinator_BondNode" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_BOND_NODE)
        }
        "iqrfEmbedCoordinator_RemoveBond" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_REMOVE_BOND)
        }
        "iqrfEmbedCoordinator_Discovery" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_DISCOVERY)
        }
        "iqrfEmbedCoordinator_SetDpaParams" => (pnum::COORDINATOR, 0x08),
        "iqrfEmbedCoordinator_SetHops" => (pnum::COORDINATOR, 0x09),
        "iqrfEmbedCoordinator_Backup" => (pnum::COORDINATOR, 0x0B),
        "iqrfEmbedCoordinator_Restore" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_RESTORE)
        }
        "iqrfEmbedCoordinator_AuthorizeBond" => (pnum::COORDINATOR, 0x0D),
        "iqrfEmbedCoordinator_SmartConnect" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_SMART_CONNECT)
        }
        "iqrfEmbedCoordinator_SetMID" => {
            (pnum::COORDINATOR, pcmd::COORDINATOR_SET_MID)
        }
        "iqrfEmbedNode_Read" => (pnum::NODE, 0x00),
        "iqrfEmbedNode_RemoveBond" => (pnum::NODE, 0x01),
        "iqrfEmbedNode_Backup" => (pnum::NODE, 0x06),
        "iqrfEmbedNode_Restore" => (pnum::NODE, 0x07),
        "iqrfEmbedNode_ValidateBonds" => (pnum::NODE, 0x08),
        "iqrfEmbedOs_Read" => (pnum::OS, pcmd::OS_READ),
        "iqrfEmbedOs_Reset" => (pnum::OS, 0x01),
        "iqrfEmbedOs_ReadCfg" => (pnum::OS, 0x02),
        "iqrfEmbedOs_Rfpgm" => (pnum::OS, 0x03),
        "iqrfEmbedOs_Sleep" => (pnum::OS, 0x04),
        "iqrfEmbedOs_Batch" => (pnum::OS, 0x05),
        "iqrfEmbedOs_SetSecurity" => (pnum::OS, 0x06),
        "iqrfEmbedOs_Indicate" => (pnum::OS, 0x07),
        "iqrfEmbedOs_Restart" => (pnum::OS, 0x08),
        "iqrfEmbedOs_WriteCfgByte" => (pnum::OS, 0x09),
        "iqrfEmbedOs_LoadCode" => (pnum::OS, 0x0A),
        "iqrfEmbedOs_SelectiveBatch" => (pnum::OS, 0x0B),
        "iqrfEmbedOs_TestRfSignal" => (pnum::OS, 0x0C),
        "iqrfEmbedOs_FactorySettings" => (pnum::OS, 0x0D),
        "iqrfEmbedOs_WriteCfg" => (pnum::OS, 0x0F),
        "iqrfEmbedEeprom_Read" => (pnum::EEPROM, 0x00),
        "iqrfEmbedEeprom_Write" => (pnum::EEPROM, 0x01),
        "iqrfEmbedEeeprom_Read" => (pnum::EEEPROM, pcmd::EEEPROM_XREAD),
        "iqrfEmbedEeeprom_Write" => (pnum::EEEPROM, 0x03),
        "iqrfEmbedRam_Read" => (pnum::RAM, 0x00),
        "iqrfEmbedRam_Write" => (pnum::RAM, 0x01),
        "iqrfEmbedRam_ReadAny" => (pnum::RAM, 0x05),
        "iqrfEmbedLedr_Pulse" => (pnum::LEDR, 0x03),
        "iqrfEmbedLedr_Flashing" => (pnum::LEDR, 0x04),
        "iqrfEmbedLedg_Pulse" => (pnum::LEDG, 0x03),
        "iqrfEmbedLedg_Flashing" => (pnum::LEDG, 0x04),
        "iqrfEmbedSpi_WriteRead" => (pnum::SPI, 0x00),
        "iqrfEmbedIo_Direction" => (pnum::IO, 0x00),
        "iqrfEmbedIo_Set" => (pnum::IO, 0x01),
        "iqrfEmbedIo_Get" => (pnum::IO, 0x02),
        "iqrfEmbedThermometer_Read" => (pnum::THERMOMETER, 0x00),
        "iqrfEmbedUart_Open" => (pnum::UART, 0x00),
        "iqrfEmbedUart_Close" => (pnum::UART, 0x01),
        "iqrfEmbedUart_WriteRead" => (pnum::UART, 0x02),
        "iqrfEmbedUart_ClearWriteRead" => (pnum::UART, 0x03),
        "iqrfEmbedFrc_Send" => (pnum::FRC, pcmd::FRC_SEND),
        "iqrfEmbedFrc_ExtraResult" => (pnum::FRC, pcmd::FRC_EXTRA_RESULT),
        "iqrfEmbedFrc_SendSelective" => {
            (pnum::FRC, pcmd::FRC_SEND_SELECTIVE)
        }
        "iqrfEmbedFrc_SetParams" => (pnum::FRC, pcmd::FRC_SET_PARAMS),
        "iqrfSensor_ReadSensors" => (pnum::SENSOR, 0x00),
        "iqrfSensor_ReadSensorsWithTypes" => (pnum::SENSOR, 0x01),
        "iqrfSensor_Enumerate" => (pnum::SENSOR, pcmd::STANDARD_ENUMERATE),
        "iqrfBinaryoutput_SetOutput" => (pnum::BINARY_OUTPUT, 0x00),
        "iqrfBinaryoutput_Enumerate" => {
            (pnum::BINARY_OUTPUT, pcmd::STANDARD_ENUMERATE)
        }
        "iqrfLight_SendLdiCommands" => (pnum::LIGHT, 0x00),
        "iqrfLight_SendLdiCommandsAsync" => (pnum::LIGHT, 0x01),
        "iqrfLight_SetLai" => (pnum::LIGHT, 0x02),
        "iqrfLight_Enumerate" => (pnum::LIGHT, pcmd::STANDARD_ENUMERATE),
        _ => return None,
    };

    Some(entry)
}

/// The FRC peripheral pair used when an FRC-standard request could
/// not be encoded.
pub fn frc_per_cmd(selective: bool) -> (u8, u8) {
    (
        pnum::FRC,
        if selective {
            pcmd::FRC_SEND_SELECTIVE
        } else {
            pcmd::FRC_SEND
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_function() {
        assert_eq!(
            driver_function("iqrfEmbedOs_Read").as_deref(),
            Some("iqrf.embed.os.Read")
        );
        assert_eq!(
            driver_function("iqrfSensor_ReadSensorsWithTypes").as_deref(),
            Some("iqrf.sensor.ReadSensorsWithTypes")
        );
        assert_eq!(
            driver_function("iqrfEmbedCoordinator_BondedDevices").as_deref(),
            Some("iqrf.embed.coordinator.BondedDevices")
        );
        assert!(driver_function("iqrfRaw").is_none());
        assert!(driver_function("mngDaemon_Mode").is_none());
    }

    #[test]
    fn test_per_cmd() {
        assert_eq!(per_cmd("iqrfEmbedOs_Read"), Some((0x02, 0x00)));
        assert_eq!(
            per_cmd("iqrfEmbedCoordinator_BondedDevices"),
            Some((0x00, 0x02))
        );
        assert_eq!(per_cmd("iqrfSensor_Enumerate"), Some((0x5e, 0x3e)));
        assert_eq!(per_cmd("iqrfTotallyUnknown_Thing"), None);
    }

    #[test]
    fn test_frc_keys() {
        assert_eq!(frc_array_key("iqrfSensor_Frc"), "sensors");
        assert_eq!(frc_item_key("iqrfSensor_Frc"), "sensor");
        assert_eq!(frc_array_key("iqrfDali_Frc"), "answers");
        assert_eq!(frc_array_key("iqrfLight_FrcLaiRead"), "voltages");
    }
}
