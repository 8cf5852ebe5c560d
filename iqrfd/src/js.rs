//! The driver context registry: decides which JavaScript execution
//! context exists for which product, what code goes into it, and
//! which node addresses route to it. The engine itself is an
//! external collaborator behind the [`JsRender`] trait.
//!
//! Context ids are 32-bit. Non-negative ids are product ids from the
//! store. Negative ids form a reserved space: [`DEFAULT_CONTEXT`]
//! holds the coordinator's driver set, and each custom driver
//! published for a HWPID gets `HWPID_MAPPING_SPACE - hwpid`.
//!
//! Call routing precedence (engine side): an explicit address
//! mapping wins; with no mapping, a loaded per-HWPID custom context
//! is used when the call's HWPID names one; everything else lands in
//! the default context.

use crate::store;
use iqrfd_api::{JsRender, Result, StdDriver};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Context id of the default (coordinator) context.
pub const DEFAULT_CONTEXT: i32 = -1;

/// Base of the per-HWPID custom-driver context ids.
pub const HWPID_MAPPING_SPACE: i32 = -0x10000;

/// The context id a custom driver for `hwpid` loads under.
pub fn custom_context_id(hwpid: u16) -> i32 {
    HWPID_MAPPING_SPACE - hwpid as i32
}

#[derive(Clone)]
pub struct ContextRegistry {
    engine: Arc<dyn JsRender>,
    wrapper: Arc<String>,
}

impl ContextRegistry {
    /// `wrapper` is the daemon-wrapper source appended to every
    /// context.
    pub fn new(engine: Arc<dyn JsRender>, wrapper: String) -> Self {
        ContextRegistry {
            engine,
            wrapper: Arc::new(wrapper),
        }
    }

    pub fn engine(&self) -> &Arc<dyn JsRender> {
        &self.engine
    }

    /// Loads the default context from the latest catalog drivers,
    /// plus one context per published custom driver.
    pub fn load_default_context(
        &self,
        drivers: &[StdDriver],
        custom_drivers: &[(u16, String)],
    ) -> Result<()> {
        let mut code = String::new();
        let mut ids = BTreeSet::new();

        for driver in drivers {
            code.push_str(&driver.code);
            code.push('\n');
            ids.insert(driver.peripheral as i64);
        }
        code.push_str(&self.wrapper);

        self.engine.load_context(DEFAULT_CONTEXT, &code, &ids)?;

        for (hwpid, custom) in custom_drivers {
            let mut custom_code = code.clone();

            custom_code.push_str(custom);
            self.engine.load_context(
                custom_context_id(*hwpid),
                &custom_code,
                &ids,
            )?;
        }
        Ok(())
    }

    /// Whether a product context's loaded driver-id set diverges
    /// from the desired one. Loading is skipped when they match.
    pub fn needs_reload(
        &self,
        product_id: i64,
        drivers: &BTreeSet<i64>,
    ) -> bool {
        self.engine.driver_id_set(product_id as i32).as_ref()
            != Some(drivers)
    }

    /// Loads a product context from its stored drivers and maps the
    /// product's device addresses to it.
    pub fn load_product_context(
        &self,
        product_id: i64,
        drivers: &[store::Driver],
        custom_driver: Option<&str>,
        addresses: &[u8],
    ) -> Result<()> {
        let mut code = String::new();
        let mut ids = BTreeSet::new();

        for driver in drivers {
            code.push_str(&driver.code);
            code.push('\n');
            ids.insert(driver.id);
        }

        if let Some(custom) = custom_driver {
            code.push_str(custom);
            code.push('\n');
        }
        code.push_str(&self.wrapper);

        self.engine.load_context(product_id as i32, &code, &ids)?;

        for addr in addresses {
            self.engine
                .map_address_to_context(*addr, product_id as i32);
        }

        info!(
            "loaded drivers for context {}: nadr {:?}, drv {:?}",
            product_id, addresses, ids
        );
        Ok(())
    }

    /// Calls a driver function for a node address; see the module
    /// docs for the routing precedence.
    pub fn call(
        &self,
        address: u16,
        hwpid: u16,
        function: &str,
        params: &str,
    ) -> Result<String> {
        self.engine.call(address, hwpid, function, params)
    }

    /// Drops every context; the next enumeration pass rebuilds them.
    pub fn clear(&self) {
        warn!("clearing driver contexts");

        self.engine.clear_contexts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubRender;

    fn std_driver(per: i16) -> StdDriver {
        StdDriver {
            peripheral: per,
            version: 1.0,
            name: format!("per-{}", per),
            version_flags: 0,
            notes: String::new(),
            code: format!("/* driver {} */", per),
            hash: format!("hash-{}", per),
        }
    }

    fn db_driver(id: i64, per: i16) -> store::Driver {
        store::Driver {
            id,
            name: format!("per-{}", per),
            peripheral: per,
            version: 1.0,
            version_flags: 0,
            code: format!("/* driver {} */", per),
            hash: format!("hash-{}", per),
        }
    }

    #[test]
    fn test_custom_context_ids() {
        assert_eq!(custom_context_id(0), HWPID_MAPPING_SPACE);
        assert_eq!(custom_context_id(0x0203), HWPID_MAPPING_SPACE - 0x0203);
        assert_ne!(custom_context_id(1), DEFAULT_CONTEXT);
    }

    #[test]
    fn test_default_context_load() {
        let engine = Arc::new(StubRender::new());
        let registry = ContextRegistry::new(
            engine.clone(),
            String::from("/* wrapper */"),
        );

        registry
            .load_default_context(
                &[std_driver(2), std_driver(94)],
                &[(0x0203, String::from("/* custom */"))],
            )
            .unwrap();

        let ids = engine.driver_id_set(DEFAULT_CONTEXT).unwrap();

        assert_eq!(ids, BTreeSet::from([2, 94]));
        assert!(engine.driver_id_set(custom_context_id(0x0203)).is_some());

        let code = engine.context_code(DEFAULT_CONTEXT).unwrap();

        assert!(code.contains("/* driver 2 */"));
        assert!(code.ends_with("/* wrapper */"));
    }

    #[test]
    fn test_reload_detection() {
        let engine = Arc::new(StubRender::new());
        let registry = ContextRegistry::new(engine.clone(), String::new());
        let drivers = vec![db_driver(10, 2), db_driver(11, 94)];
        let wanted = BTreeSet::from([10, 11]);

        assert!(registry.needs_reload(7, &wanted));
        registry
            .load_product_context(7, &drivers, None, &[1, 2])
            .unwrap();
        assert!(!registry.needs_reload(7, &wanted));
        assert!(registry.needs_reload(7, &BTreeSet::from([10])));
        assert_eq!(engine.context_for_address(1), Some(7));
    }
}
