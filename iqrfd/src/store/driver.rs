//! Driver repository and the product-driver many-to-many.

use super::{wrap, Driver, Store};
use iqrfd_api::Result;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};

const COLUMNS: &str = "id, name, peripheralNumber, version, versionFlags, \
		       code, driverHash";

fn from_row(row: &Row) -> rusqlite::Result<Driver> {
    Ok(Driver {
        id: row.get(0)?,
        name: row.get(1)?,
        peripheral: row.get(2)?,
        version: row.get(3)?,
        version_flags: row.get(4)?,
        code: row.get(5)?,
        hash: row.get(6)?,
    })
}

impl Store {
    pub fn driver_by_peripheral_version(
        &self,
        peripheral: i16,
        version: f64,
    ) -> Result<Option<Driver>> {
        wrap(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM driver \
			 WHERE peripheralNumber = ?1 AND version = ?2",
                        COLUMNS
                    ),
                    params![peripheral, version],
                    from_row,
                )
                .optional(),
            "driver",
            format!("{}/{}", peripheral, version),
        )
    }

    pub fn insert_driver(&self, driver: &Driver) -> Result<i64> {
        wrap(
            self.conn().execute(
                "INSERT INTO driver (name, peripheralNumber, version, \
		 versionFlags, code, driverHash) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    driver.name,
                    driver.peripheral,
                    driver.version,
                    driver.version_flags,
                    driver.code,
                    driver.hash
                ],
            ),
            "driver insert",
            driver.peripheral,
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The newest version of every stored driver, one per peripheral
    /// number. The coordinator context is built from this set.
    pub fn latest_drivers(&self) -> Result<Vec<Driver>> {
        let mut stmt = wrap(
            self.conn().prepare(&format!(
                "SELECT {} FROM driver d WHERE version = \
		 (SELECT MAX(version) FROM driver \
		  WHERE peripheralNumber = d.peripheralNumber) \
		 ORDER BY peripheralNumber",
                COLUMNS
            )),
            "latest drivers",
            "*",
        )?;
        let rows = wrap(stmt.query_map([], from_row), "latest drivers", "*")?;

        wrap(rows.collect(), "latest drivers", "*")
    }

    pub fn drivers_by_product(&self, product_id: i64) -> Result<Vec<Driver>> {
        let mut stmt = wrap(
            self.conn().prepare(&format!(
                "SELECT {} FROM driver d \
		 JOIN productDriver pd ON pd.driverId = d.id \
		 WHERE pd.productId = ?1 ORDER BY d.peripheralNumber",
                COLUMNS
                    .split(", ")
                    .map(|c| format!("d.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            "product drivers",
            product_id,
        )?;
        let rows = wrap(
            stmt.query_map([product_id], from_row),
            "product drivers",
            product_id,
        )?;

        wrap(rows.collect(), "product drivers", product_id)
    }

    pub fn product_driver_ids(&self, product_id: i64) -> Result<BTreeSet<i64>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT driverId FROM productDriver WHERE productId = ?1",
            ),
            "product driver ids",
            product_id,
        )?;
        let rows = wrap(
            stmt.query_map([product_id], |row| row.get::<_, i64>(0)),
            "product driver ids",
            product_id,
        )?;

        wrap(rows.collect(), "product driver ids", product_id)
    }

    /// Product id to driver-id set for every product that binds at
    /// least one driver. Drives context reload change detection.
    pub fn products_drivers_map(
        &self,
    ) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
        let mut stmt = wrap(
            self.conn()
                .prepare("SELECT productId, driverId FROM productDriver"),
            "product driver map",
            "*",
        )?;
        let rows = wrap(
            stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            }),
            "product driver map",
            "*",
        )?;
        let mut map: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();

        for row in rows {
            let (product, driver) = wrap(row, "product driver map", "*")?;

            map.entry(product).or_default().insert(driver);
        }
        Ok(map)
    }

    /// Reconciles the product's driver set to exactly `drivers`:
    /// missing links are added, surplus links removed.
    pub fn set_product_drivers(
        &self,
        product_id: i64,
        drivers: &BTreeSet<i64>,
    ) -> Result<()> {
        let current = self.product_driver_ids(product_id)?;

        for driver in drivers.difference(&current) {
            wrap(
                self.conn().execute(
                    "INSERT INTO productDriver (productId, driverId) \
		     VALUES (?1, ?2)",
                    params![product_id, driver],
                ),
                "product driver insert",
                product_id,
            )?;
        }

        for driver in current.difference(drivers) {
            wrap(
                self.conn().execute(
                    "DELETE FROM productDriver \
		     WHERE productId = ?1 AND driverId = ?2",
                    params![product_id, driver],
                ),
                "product driver remove",
                product_id,
            )?;
        }
        Ok(())
    }
}
