//! Sensor catalog and per-device sensor mounting rows.

use super::{wrap, DeviceSensor, Sensor, Store};
use iqrfd_api::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;

const SENSOR_COLUMNS: &str = "id, type, name, shortname, unit, decimals, \
			      frc2bit, frc1byte, frc2byte, frc4byte";

const MOUNT_COLUMNS: &str = "address, type, globalIndex, typeIndex, \
			     sensorId, value, updated, metadata";

fn sensor_from_row(row: &Row) -> rusqlite::Result<Sensor> {
    Ok(Sensor {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        short_name: row.get(3)?,
        unit: row.get(4)?,
        decimals: row.get(5)?,
        frc_2bit: row.get(6)?,
        frc_1byte: row.get(7)?,
        frc_2byte: row.get(8)?,
        frc_4byte: row.get(9)?,
    })
}

fn mount_from_row(row: &Row) -> rusqlite::Result<DeviceSensor> {
    Ok(DeviceSensor {
        address: row.get(0)?,
        kind: row.get(1)?,
        global_index: row.get(2)?,
        type_index: row.get(3)?,
        sensor_id: row.get(4)?,
        value: row.get(5)?,
        updated: row.get(6)?,
        metadata: row.get(7)?,
    })
}

impl Store {
    pub fn sensor_by_id(&self, id: i64) -> Result<Option<Sensor>> {
        wrap(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM sensor WHERE id = ?1",
                        SENSOR_COLUMNS
                    ),
                    [id],
                    sensor_from_row,
                )
                .optional(),
            "sensor",
            id,
        )
    }

    pub fn sensor_by_type_name(
        &self,
        kind: u8,
        name: &str,
    ) -> Result<Option<Sensor>> {
        wrap(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM sensor \
			 WHERE type = ?1 AND name = ?2",
                        SENSOR_COLUMNS
                    ),
                    params![kind, name],
                    sensor_from_row,
                )
                .optional(),
            "sensor",
            format!("{}/{}", kind, name),
        )
    }

    pub fn insert_sensor(&self, sensor: &Sensor) -> Result<i64> {
        wrap(
            self.conn().execute(
                "INSERT INTO sensor (type, name, shortname, unit, decimals, \
		 frc2bit, frc1byte, frc2byte, frc4byte) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sensor.kind,
                    sensor.name,
                    sensor.short_name,
                    sensor.unit,
                    sensor.decimals,
                    sensor.frc_2bit,
                    sensor.frc_1byte,
                    sensor.frc_2byte,
                    sensor.frc_4byte
                ],
            ),
            "sensor insert",
            sensor.kind,
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The sensor inventory of a device, dense by global index.
    pub fn device_sensors(&self, address: u8) -> Result<Vec<DeviceSensor>> {
        let mut stmt = wrap(
            self.conn().prepare(&format!(
                "SELECT {} FROM deviceSensor WHERE address = ?1 \
		 ORDER BY globalIndex",
                MOUNT_COLUMNS
            )),
            "device sensors",
            address,
        )?;
        let rows = wrap(
            stmt.query_map([address], mount_from_row),
            "device sensors",
            address,
        )?;

        wrap(rows.collect(), "device sensors", address)
    }

    pub fn insert_device_sensor(&self, mount: &DeviceSensor) -> Result<()> {
        wrap(
            self.conn().execute(
                "INSERT INTO deviceSensor (address, type, globalIndex, \
		 typeIndex, sensorId, value, updated, metadata) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    mount.address,
                    mount.kind,
                    mount.global_index,
                    mount.type_index,
                    mount.sensor_id,
                    mount.value,
                    mount.updated,
                    mount.metadata
                ],
            ),
            "device sensor insert",
            mount.address,
        )?;
        Ok(())
    }

    pub fn remove_device_sensor(
        &self,
        address: u8,
        global_index: u8,
    ) -> Result<()> {
        wrap(
            self.conn().execute(
                "DELETE FROM deviceSensor \
		 WHERE address = ?1 AND globalIndex = ?2",
                params![address, global_index],
            ),
            "device sensor remove",
            address,
        )?;
        Ok(())
    }

    pub fn remove_device_sensors(&self, address: u8) -> Result<()> {
        wrap(
            self.conn().execute(
                "DELETE FROM deviceSensor WHERE address = ?1",
                [address],
            ),
            "device sensors remove",
            address,
        )?;
        Ok(())
    }

    /// Resolves a `(type, type index)` slot to the device's global
    /// index.
    pub fn global_sensor_index(
        &self,
        address: u8,
        kind: u8,
        type_index: u8,
    ) -> Result<u8> {
        wrap(
            self.conn()
                .query_row(
                    "SELECT globalIndex FROM deviceSensor \
		     WHERE address = ?1 AND type = ?2 AND typeIndex = ?3",
                    params![address, kind, type_index],
                    |row| row.get(0),
                )
                .optional(),
            "global sensor index",
            format!("{}/{}/{}", address, kind, type_index),
        )?
        .ok_or(Error::NotFound)
    }

    /// Sensor type to the `(address, type index)` pairs mounting it,
    /// across the fleet. The sensor reader builds its FRC batches
    /// from this.
    pub fn sensor_select_map(&self) -> Result<BTreeMap<u8, Vec<(u8, u8)>>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT type, address, typeIndex FROM deviceSensor \
		 ORDER BY type, address",
            ),
            "sensor select map",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                Ok((
                    row.get::<_, u8>(0)?,
                    row.get::<_, u8>(1)?,
                    row.get::<_, u8>(2)?,
                ))
            }),
            "sensor select map",
            "*",
        )?;
        let mut map: BTreeMap<u8, Vec<(u8, u8)>> = BTreeMap::new();

        for row in rows {
            let (kind, address, type_index) =
                wrap(row, "sensor select map", "*")?;

            map.entry(kind).or_default().push((address, type_index));
        }
        Ok(map)
    }

    /// Address to HWPID for every device mounting the given sensor
    /// type. Needed to parse the breakdown FRC types.
    pub fn sensor_device_hwpids(&self, kind: u8) -> Result<BTreeMap<u8, u16>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT DISTINCT ds.address, p.hwpid FROM deviceSensor ds \
		 JOIN device d ON d.address = ds.address \
		 JOIN product p ON p.id = d.productId \
		 WHERE ds.type = ?1",
            ),
            "sensor device hwpids",
            kind,
        )?;
        let rows = wrap(
            stmt.query_map([kind], |row| {
                Ok((row.get::<_, u8>(0)?, row.get::<_, u16>(1)?))
            }),
            "sensor device hwpids",
            kind,
        )?;

        wrap(rows.collect(), "sensor device hwpids", kind)
    }

    /// Every mounted sensor with its catalog row, ordered by device
    /// address and global index. Feeds the database read API.
    pub fn device_sensor_details(
        &self,
    ) -> Result<Vec<(DeviceSensor, Sensor)>> {
        let mut stmt = wrap(
            self.conn().prepare(&format!(
                "SELECT {}, {} FROM deviceSensor ds \
		 JOIN sensor s ON s.id = ds.sensorId \
		 ORDER BY ds.address, ds.globalIndex",
                MOUNT_COLUMNS
                    .split(", ")
                    .map(|c| format!("ds.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
                SENSOR_COLUMNS
                    .split(", ")
                    .map(|c| format!("s.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            "device sensor details",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                let mount = mount_from_row(row)?;
                let sensor = Sensor {
                    id: row.get(8)?,
                    kind: row.get(9)?,
                    name: row.get(10)?,
                    short_name: row.get(11)?,
                    unit: row.get(12)?,
                    decimals: row.get(13)?,
                    frc_2bit: row.get(14)?,
                    frc_1byte: row.get(15)?,
                    frc_2byte: row.get(16)?,
                    frc_4byte: row.get(17)?,
                };

                Ok((mount, sensor))
            }),
            "device sensor details",
            "*",
        )?;

        wrap(rows.collect(), "device sensor details", "*")
    }

    /// Writes a fresh numeric sample into a mounted sensor slot.
    pub fn update_sensor_value(
        &self,
        address: u8,
        global_index: u8,
        value: f64,
        updated: &str,
    ) -> Result<()> {
        wrap(
            self.conn().execute(
                "UPDATE deviceSensor SET value = ?3, updated = ?4 \
		 WHERE address = ?1 AND globalIndex = ?2",
                params![address, global_index, value, updated],
            ),
            "sensor value",
            address,
        )?;
        Ok(())
    }

    /// Writes an opaque structured sample (breakdown quantities)
    /// into a mounted sensor slot.
    pub fn update_sensor_metadata(
        &self,
        address: u8,
        global_index: u8,
        metadata: &serde_json::Value,
        updated: &str,
    ) -> Result<()> {
        wrap(
            self.conn().execute(
                "UPDATE deviceSensor SET metadata = ?3, updated = ?4 \
		 WHERE address = ?1 AND globalIndex = ?2",
                params![address, global_index, metadata.to_string(), updated],
            ),
            "sensor metadata",
            address,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Device, Product};
    use super::*;

    fn temperature() -> Sensor {
        Sensor {
            id: 0,
            kind: 0x01,
            name: String::from("Temperature"),
            short_name: String::from("t"),
            unit: Some(String::from("°C")),
            decimals: 4,
            frc_2bit: false,
            frc_1byte: false,
            frc_2byte: true,
            frc_4byte: false,
        }
    }

    fn store_with_device(address: u8) -> Store {
        let store = Store::open_in_memory().unwrap();
        let pid = store
            .insert_product(&Product::new(1, 1, 0x08d8, "4.03D", 0x0414))
            .unwrap();

        store
            .insert_device(&Device::new(address, true, 0xaabb, 1, 0, None, pid))
            .unwrap();
        store
    }

    #[test]
    fn test_sensor_catalog() {
        let store = store_with_device(1);
        let mut sensor = temperature();

        sensor.id = store.insert_sensor(&sensor).unwrap();

        assert_eq!(
            store.sensor_by_type_name(0x01, "Temperature").unwrap(),
            Some(sensor.clone())
        );
        assert_eq!(store.sensor_by_id(sensor.id).unwrap(), Some(sensor));
        assert!(store.sensor_by_type_name(0x01, "Other").unwrap().is_none());
    }

    #[test]
    fn test_mount_indexes() {
        let store = store_with_device(1);
        let sid = store.insert_sensor(&temperature()).unwrap();

        store
            .insert_device_sensor(&DeviceSensor::new(1, 0x01, 0, 0, sid))
            .unwrap();
        store
            .insert_device_sensor(&DeviceSensor::new(1, 0x01, 1, 1, sid))
            .unwrap();

        assert_eq!(store.global_sensor_index(1, 0x01, 1).unwrap(), 1);
        assert_eq!(
            store.global_sensor_index(1, 0x01, 2).unwrap_err(),
            Error::NotFound
        );

        let map = store.sensor_select_map().unwrap();

        assert_eq!(map[&0x01], vec![(1, 0), (1, 1)]);

        let hwpids = store.sensor_device_hwpids(0x01).unwrap();

        assert_eq!(hwpids[&1], 1);
    }

    #[test]
    fn test_value_updates() {
        let store = store_with_device(2);
        let sid = store.insert_sensor(&temperature()).unwrap();

        store
            .insert_device_sensor(&DeviceSensor::new(2, 0x01, 0, 0, sid))
            .unwrap();
        store
            .update_sensor_value(2, 0, 22.5, "2023-06-01 12:00:00")
            .unwrap();

        let mounts = store.device_sensors(2).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].value, Some(22.5));
        assert_eq!(mounts[0].updated.as_deref(), Some("2023-06-01 12:00:00"));
    }
}
