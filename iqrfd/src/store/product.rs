//! Product repository operations.

use super::{wrap, Product, Store};
use iqrfd_api::Result;
use rusqlite::{params, OptionalExtension, Row};

const COLUMNS: &str = "id, hwpid, hwpidVersion, osBuild, osVersion, \
		       dpaVersion, handlerUrl, handlerHash, customDriver, \
		       packageId, name";

fn from_row(row: &Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        hwpid: row.get(1)?,
        hwpid_version: row.get(2)?,
        os_build: row.get(3)?,
        os_version: row.get(4)?,
        dpa_version: row.get(5)?,
        handler_url: row.get(6)?,
        handler_hash: row.get(7)?,
        custom_driver: row.get(8)?,
        package_id: row.get(9)?,
        name: row.get(10)?,
    })
}

impl Store {
    pub fn product_by_id(&self, id: i64) -> Result<Option<Product>> {
        wrap(
            self.conn()
                .query_row(
                    &format!("SELECT {} FROM product WHERE id = ?1", COLUMNS),
                    [id],
                    from_row,
                )
                .optional(),
            "product",
            id,
        )
    }

    /// Looks a product up by its identity tuple.
    pub fn product_by_tuple(
        &self,
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        dpa_version: u16,
    ) -> Result<Option<Product>> {
        wrap(
            self.conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM product WHERE hwpid = ?1 AND \
			 hwpidVersion = ?2 AND osBuild = ?3 AND \
			 dpaVersion = ?4",
                        COLUMNS
                    ),
                    params![hwpid, hwpid_version, os_build, dpa_version],
                    from_row,
                )
                .optional(),
            "product",
            format!(
                "{}/{}/{:04X}/{:04X}",
                hwpid, hwpid_version, os_build, dpa_version
            ),
        )
    }

    pub fn insert_product(&self, product: &Product) -> Result<i64> {
        wrap(
            self.conn().execute(
                "INSERT INTO product (hwpid, hwpidVersion, osBuild, \
		 osVersion, dpaVersion, handlerUrl, handlerHash, \
		 customDriver, packageId, name) \
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    product.hwpid,
                    product.hwpid_version,
                    product.os_build,
                    product.os_version,
                    product.dpa_version,
                    product.handler_url,
                    product.handler_hash,
                    product.custom_driver,
                    product.package_id,
                    product.name
                ],
            ),
            "product insert",
            product.hwpid,
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The product id bound to the coordinator device (address 0),
    /// if the coordinator has been enumerated.
    pub fn coordinator_product_id(&self) -> Result<Option<i64>> {
        wrap(
            self.conn()
                .query_row(
                    "SELECT productId FROM device WHERE address = 0",
                    [],
                    |row| row.get(0),
                )
                .optional(),
            "coordinator product",
            0,
        )
    }

    pub fn product_custom_driver(&self, id: i64) -> Result<Option<String>> {
        let driver: Option<Option<String>> = wrap(
            self.conn()
                .query_row(
                    "SELECT customDriver FROM product WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional(),
            "product custom driver",
            id,
        )?;
        Ok(driver.flatten())
    }

    /// Addresses of the devices bound to a product.
    pub fn product_device_addresses(&self, id: i64) -> Result<Vec<u8>> {
        let mut stmt = wrap(
            self.conn().prepare(
                "SELECT address FROM device WHERE productId = ?1 \
		 ORDER BY address",
            ),
            "product devices",
            id,
        )?;
        let rows = wrap(
            stmt.query_map([id], |row| row.get::<_, u8>(0)),
            "product devices",
            id,
        )?;

        wrap(rows.collect(), "product devices", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_identity() {
        let store = Store::open_in_memory().unwrap();
        let mut product = Product::new(0x0203, 1, 0x08d8, "4.03D", 0x0414);

        product.id = store.insert_product(&product).unwrap();

        let read = store
            .product_by_tuple(0x0203, 1, 0x08d8, 0x0414)
            .unwrap()
            .unwrap();

        assert_eq!(read, product);
        assert!(store
            .product_by_tuple(0x0203, 2, 0x08d8, 0x0414)
            .unwrap()
            .is_none());

        // The identity tuple is unique.

        assert!(store.insert_product(&product).is_err());
    }
}
