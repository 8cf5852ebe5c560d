//! Device repository operations.

use super::{wrap, Device, Store};
use iqrfd_api::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};

const COLUMNS: &str = "id, address, discovered, mid, vrn, zone, parent, \
		       enumerated, productId, name, location, metadata";

fn from_row(row: &Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        address: row.get(1)?,
        discovered: row.get(2)?,
        mid: row.get(3)?,
        vrn: row.get(4)?,
        zone: row.get(5)?,
        parent: row.get(6)?,
        enumerated: row.get(7)?,
        product_id: row.get(8)?,
        name: row.get(9)?,
        location: row.get(10)?,
        metadata: row.get(11)?,
    })
}

impl Store {
    pub fn devices(&self) -> Result<Vec<Device>> {
        let mut stmt = wrap(
            self.conn().prepare(&format!(
                "SELECT {} FROM device ORDER BY address",
                COLUMNS
            )),
            "device list",
            "*",
        )?;
        let rows = wrap(stmt.query_map([], from_row), "device list", "*")?;

        wrap(rows.collect(), "device list", "*")
    }

    pub fn device_by_address(&self, address: u8) -> Result<Option<Device>> {
        wrap(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM device WHERE address = ?1",
                        COLUMNS
                    ),
                    [address],
                    from_row,
                )
                .optional(),
            "device",
            address,
        )
    }

    pub fn device_by_id(&self, id: i64) -> Result<Option<Device>> {
        wrap(
            self.conn()
                .query_row(
                    &format!("SELECT {} FROM device WHERE id = ?1", COLUMNS),
                    [id],
                    from_row,
                )
                .optional(),
            "device",
            id,
        )
    }

    pub fn insert_device(&self, device: &Device) -> Result<i64> {
        wrap(
            self.conn().execute(
                "INSERT INTO device (address, discovered, mid, vrn, zone, \
		 parent, enumerated, productId, name, location, metadata) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    device.address,
                    device.discovered,
                    device.mid,
                    device.vrn,
                    device.zone,
                    device.parent,
                    device.enumerated,
                    device.product_id,
                    device.name,
                    device.location,
                    device.metadata
                ],
            ),
            "device insert",
            device.address,
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn update_device(&self, device: &Device) -> Result<()> {
        wrap(
            self.conn().execute(
                "UPDATE device SET address = ?2, discovered = ?3, mid = ?4, \
		 vrn = ?5, zone = ?6, parent = ?7, enumerated = ?8, \
		 productId = ?9, name = ?10, location = ?11, metadata = ?12 \
		 WHERE id = ?1",
                params![
                    device.id,
                    device.address,
                    device.discovered,
                    device.mid,
                    device.vrn,
                    device.zone,
                    device.parent,
                    device.enumerated,
                    device.product_id,
                    device.name,
                    device.location,
                    device.metadata
                ],
            ),
            "device update",
            device.address,
        )?;
        Ok(())
    }

    /// Removes a device row; the capability and sensor rows follow
    /// by cascade.
    pub fn remove_device(&self, id: i64) -> Result<()> {
        wrap(
            self.conn()
                .execute("DELETE FROM device WHERE id = ?1", [id]),
            "device remove",
            id,
        )?;
        Ok(())
    }

    /// Addresses of every device in the store.
    pub fn device_addresses(&self) -> Result<BTreeSet<u8>> {
        let mut stmt = wrap(
            self.conn().prepare("SELECT address FROM device"),
            "device addresses",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| row.get::<_, u8>(0)),
            "device addresses",
            "*",
        )?;

        wrap(rows.collect(), "device addresses", "*")
    }

    /// Whether a device's product binds a driver for the given
    /// peripheral; the standards pass uses this to decide which
    /// capabilities to probe.
    pub fn device_implements_peripheral(
        &self,
        device_id: i64,
        peripheral: i16,
    ) -> Result<bool> {
        let n: i64 = wrap(
            self.conn().query_row(
                "SELECT COUNT(*) FROM device dev \
		 JOIN productDriver pd ON pd.productId = dev.productId \
		 JOIN driver d ON d.id = pd.driverId \
		 WHERE dev.id = ?1 AND d.peripheralNumber = ?2",
                params![device_id, peripheral],
                |row| row.get(0),
            ),
            "device peripheral",
            device_id,
        )?;
        Ok(n > 0)
    }

    pub fn device_hwpid(&self, address: u8) -> Result<u16> {
        wrap(
            self.conn().query_row(
                "SELECT p.hwpid FROM device d \
		 JOIN product p ON p.id = d.productId \
		 WHERE d.address = ?1",
                [address],
                |row| row.get(0),
            ),
            "device hwpid",
            address,
        )
    }

    pub fn device_mid(&self, address: u8) -> Result<u32> {
        wrap(
            self.conn().query_row(
                "SELECT mid FROM device WHERE address = ?1",
                [address],
                |row| row.get(0),
            ),
            "device mid",
            address,
        )
    }

    /// Address to `(mid, hwpid)` for every device; annotates
    /// extended-format FRC results.
    pub fn node_mid_hwpid_map(&self) -> Result<BTreeMap<u8, (u32, u16)>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT d.address, d.mid, p.hwpid FROM device d \
		 JOIN product p ON p.id = d.productId",
            ),
            "node map",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                Ok((
                    row.get::<_, u8>(0)?,
                    (row.get::<_, u32>(1)?, row.get::<_, u16>(2)?),
                ))
            }),
            "node map",
            "*",
        )?;

        wrap(rows.collect(), "node map", "*")
    }

    /// Devices joined with their products, optionally restricted to
    /// the given addresses. Feeds the database read API.
    pub fn devices_with_products(
        &self,
        addresses: &[u8],
    ) -> Result<Vec<(Device, super::Product)>> {
        let devices = self.devices()?;
        let mut out = vec![];

        for device in devices {
            if !addresses.is_empty() && !addresses.contains(&device.address)
            {
                continue;
            }

            let product = self
                .product_by_id(device.product_id)?
                .ok_or_else(|| {
                    Error::StoreError(format!(
                        "device {} references missing product {}",
                        device.address, device.product_id
                    ))
                })?;

            out.push((device, product));
        }
        Ok(out)
    }

    /// The stored metadata document of a device. Missing devices are
    /// an error; devices without metadata yield an empty object.
    pub fn device_metadata(&self, address: u8) -> Result<serde_json::Value> {
        let blob: Option<String> = wrap(
            self.conn().query_row(
                "SELECT metadata FROM device WHERE address = ?1",
                [address],
                |row| row.get(0),
            ),
            "device metadata",
            address,
        )?;

        match blob {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| Error::StoreError(format!("metadata: {}", e))),
            None => Ok(serde_json::json!({})),
        }
    }

    pub fn set_device_metadata(
        &self,
        address: u8,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let n = wrap(
            self.conn().execute(
                "UPDATE device SET metadata = ?2 WHERE address = ?1",
                params![address, metadata.to_string()],
            ),
            "device metadata",
            address,
        )?;

        if n == 0 {
            Err(Error::NotFound)
        } else {
            Ok(())
        }
    }
}
