//! Capability rows for the binary-output, DALI, and light standards.

use super::{wrap, BinaryOutput, Dali, Light, Store};
use iqrfd_api::Result;
use rusqlite::{params, OptionalExtension};

impl Store {
    pub fn binary_output_by_device(
        &self,
        device_id: i64,
    ) -> Result<Option<BinaryOutput>> {
        wrap(
            self.conn()
                .query_row(
                    "SELECT id, deviceId, count FROM binaryOutput \
		     WHERE deviceId = ?1",
                    [device_id],
                    |row| {
                        Ok(BinaryOutput {
                            id: row.get(0)?,
                            device_id: row.get(1)?,
                            count: row.get(2)?,
                        })
                    },
                )
                .optional(),
            "binary output",
            device_id,
        )
    }

    /// Creates or refreshes a device's binary-output row.
    pub fn upsert_binary_output(
        &self,
        device_id: i64,
        count: u8,
    ) -> Result<()> {
        wrap(
            self.conn().execute(
                "INSERT INTO binaryOutput (deviceId, count) VALUES (?1, ?2) \
		 ON CONFLICT (deviceId) DO UPDATE SET count = ?2",
                params![device_id, count],
            ),
            "binary output upsert",
            device_id,
        )?;
        Ok(())
    }

    pub fn remove_binary_output(&self, device_id: i64) -> Result<()> {
        wrap(
            self.conn().execute(
                "DELETE FROM binaryOutput WHERE deviceId = ?1",
                [device_id],
            ),
            "binary output remove",
            device_id,
        )?;
        Ok(())
    }

    /// Address to output count for every device implementing the
    /// binary-output standard.
    pub fn binary_outputs(&self) -> Result<Vec<(u8, u8)>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT d.address, bo.count FROM binaryOutput bo \
		 JOIN device d ON d.id = bo.deviceId ORDER BY d.address",
            ),
            "binary outputs",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                Ok((row.get::<_, u8>(0)?, row.get::<_, u8>(1)?))
            }),
            "binary outputs",
            "*",
        )?;

        wrap(rows.collect(), "binary outputs", "*")
    }

    pub fn dali_by_device(&self, device_id: i64) -> Result<Option<Dali>> {
        wrap(
            self.conn()
                .query_row(
                    "SELECT id, deviceId FROM dali WHERE deviceId = ?1",
                    [device_id],
                    |row| {
                        Ok(Dali {
                            id: row.get(0)?,
                            device_id: row.get(1)?,
                        })
                    },
                )
                .optional(),
            "dali",
            device_id,
        )
    }

    pub fn insert_dali(&self, device_id: i64) -> Result<()> {
        wrap(
            self.conn().execute(
                "INSERT OR IGNORE INTO dali (deviceId) VALUES (?1)",
                [device_id],
            ),
            "dali insert",
            device_id,
        )?;
        Ok(())
    }

    pub fn remove_dali(&self, device_id: i64) -> Result<()> {
        wrap(
            self.conn()
                .execute("DELETE FROM dali WHERE deviceId = ?1", [device_id]),
            "dali remove",
            device_id,
        )?;
        Ok(())
    }

    /// Addresses of every device implementing the DALI standard.
    pub fn dalis(&self) -> Result<Vec<u8>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT d.address FROM dali da \
		 JOIN device d ON d.id = da.deviceId ORDER BY d.address",
            ),
            "dalis",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| row.get::<_, u8>(0)),
            "dalis",
            "*",
        )?;

        wrap(rows.collect(), "dalis", "*")
    }

    /// Address to light count for every device implementing the
    /// light standard.
    pub fn lights(&self) -> Result<Vec<(u8, u8)>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT d.address, l.count FROM light l \
		 JOIN device d ON d.id = l.deviceId ORDER BY d.address",
            ),
            "lights",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                Ok((row.get::<_, u8>(0)?, row.get::<_, u8>(1)?))
            }),
            "lights",
            "*",
        )?;

        wrap(rows.collect(), "lights", "*")
    }

    pub fn light_by_device(&self, device_id: i64) -> Result<Option<Light>> {
        wrap(
            self.conn()
                .query_row(
                    "SELECT id, deviceId, count FROM light \
		     WHERE deviceId = ?1",
                    [device_id],
                    |row| {
                        Ok(Light {
                            id: row.get(0)?,
                            device_id: row.get(1)?,
                            count: row.get(2)?,
                        })
                    },
                )
                .optional(),
            "light",
            device_id,
        )
    }

    pub fn upsert_light(&self, device_id: i64, count: u8) -> Result<()> {
        wrap(
            self.conn().execute(
                "INSERT INTO light (deviceId, count) VALUES (?1, ?2) \
		 ON CONFLICT (deviceId) DO UPDATE SET count = ?2",
                params![device_id, count],
            ),
            "light upsert",
            device_id,
        )?;
        Ok(())
    }

    pub fn remove_light(&self, device_id: i64) -> Result<()> {
        wrap(
            self.conn()
                .execute("DELETE FROM light WHERE deviceId = ?1", [device_id]),
            "light remove",
            device_id,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Device, Product};
    use super::*;

    fn store_with_device() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let pid = store
            .insert_product(&Product::new(1, 1, 0x08d8, "4.03D", 0x0414))
            .unwrap();
        let did = store
            .insert_device(&Device::new(1, true, 0xaabb, 1, 0, Some(0), pid))
            .unwrap();

        (store, did)
    }

    #[test]
    fn test_capability_rows() {
        let (store, did) = store_with_device();

        store.upsert_binary_output(did, 4).unwrap();
        store.upsert_binary_output(did, 6).unwrap();
        assert_eq!(store.binary_output_by_device(did).unwrap().unwrap().count, 6);

        store.insert_dali(did).unwrap();
        store.insert_dali(did).unwrap();
        assert!(store.dali_by_device(did).unwrap().is_some());

        store.upsert_light(did, 2).unwrap();
        assert_eq!(store.light_by_device(did).unwrap().unwrap().count, 2);

        store.remove_binary_output(did).unwrap();
        store.remove_dali(did).unwrap();
        store.remove_light(did).unwrap();
        assert!(store.binary_output_by_device(did).unwrap().is_none());
        assert!(store.dali_by_device(did).unwrap().is_none());
        assert!(store.light_by_device(did).unwrap().is_none());
    }

    #[test]
    fn test_cascade_on_device_removal() {
        let (store, did) = store_with_device();

        store.upsert_binary_output(did, 1).unwrap();
        store.upsert_light(did, 1).unwrap();
        store.insert_dali(did).unwrap();

        store.remove_device(did).unwrap();
        assert!(store.binary_output_by_device(did).unwrap().is_none());
        assert!(store.light_by_device(did).unwrap().is_none());
        assert!(store.dali_by_device(did).unwrap().is_none());
    }
}
