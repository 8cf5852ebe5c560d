//! Row types of the network model. The store owns persistent
//! identity; everything here is plain data read from or written to
//! one table.

/// A bonded node on the mesh. Identity is the pair of network
/// address and module id; a new `mid` under a fixed address means the
/// hardware behind the address was replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i64,
    pub address: u8,
    pub discovered: bool,
    pub mid: u32,
    pub vrn: u8,
    pub zone: u8,
    pub parent: Option<u8>,
    pub enumerated: bool,
    pub product_id: i64,
    pub name: Option<String>,
    pub location: Option<String>,
    pub metadata: Option<String>,
}

impl Device {
    pub fn new(
        address: u8,
        discovered: bool,
        mid: u32,
        vrn: u8,
        zone: u8,
        parent: Option<u8>,
        product_id: i64,
    ) -> Self {
        Device {
            id: 0,
            address,
            discovered,
            mid,
            vrn,
            zone,
            parent,
            enumerated: false,
            product_id,
            name: None,
            location: None,
            metadata: None,
        }
    }
}

/// The unique identity tuple `(hwpid, hwpid version, os build, dpa
/// version)` plus the catalog data derived from it. Any two devices
/// sharing the tuple share one product row.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: i64,
    pub hwpid: u16,
    pub hwpid_version: u16,
    pub os_build: u16,
    pub os_version: Option<String>,
    pub dpa_version: u16,
    pub handler_url: Option<String>,
    pub handler_hash: Option<String>,
    pub custom_driver: Option<String>,
    pub package_id: Option<i64>,
    pub name: Option<String>,
}

impl Product {
    pub fn new(
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        os_version: &str,
        dpa_version: u16,
    ) -> Self {
        Product {
            id: 0,
            hwpid,
            hwpid_version,
            os_build,
            os_version: Some(os_version.to_string()),
            dpa_version,
            handler_url: None,
            handler_hash: None,
            custom_driver: None,
            package_id: None,
            name: None,
        }
    }
}

/// A standard driver identified by `(peripheral, version)`. The hash
/// is the authoritative equality key when deciding whether the
/// stored source needs a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Driver {
    pub id: i64,
    pub name: String,
    pub peripheral: i16,
    pub version: f64,
    pub version_flags: i64,
    pub code: String,
    pub hash: String,
}

/// Binary-output capability row: the device implements the standard
/// and exposes `count` outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOutput {
    pub id: i64,
    pub device_id: i64,
    pub count: u8,
}

/// DALI capability row; presence only.
#[derive(Debug, Clone, PartialEq)]
pub struct Dali {
    pub id: i64,
    pub device_id: i64,
}

/// Light capability row.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub id: i64,
    pub device_id: i64,
    pub count: u8,
}

/// A quantity definition; one row per distinct quantity discovered
/// across the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub id: i64,
    pub kind: u8,
    pub name: String,
    pub short_name: String,
    pub unit: Option<String>,
    pub decimals: u8,
    pub frc_2bit: bool,
    pub frc_1byte: bool,
    pub frc_2byte: bool,
    pub frc_4byte: bool,
}

/// The mounting of a sensor in a device. `global_index` is the slot
/// among all sensors the device exposes (dense from 0);
/// `type_index` is the slot among sensors of the same type. The last
/// sample is a numeric value or an opaque metadata blob for
/// structured quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSensor {
    pub address: u8,
    pub kind: u8,
    pub global_index: u8,
    pub type_index: u8,
    pub sensor_id: i64,
    pub value: Option<f64>,
    pub updated: Option<String>,
    pub metadata: Option<String>,
}

impl DeviceSensor {
    pub fn new(
        address: u8,
        kind: u8,
        global_index: u8,
        type_index: u8,
        sensor_id: i64,
    ) -> Self {
        DeviceSensor {
            address,
            kind,
            global_index,
            type_index,
            sensor_id,
            value: None,
            updated: None,
            metadata: None,
        }
    }
}
