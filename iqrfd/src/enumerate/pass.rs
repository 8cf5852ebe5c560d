//! One enumeration pass: the working set it accumulates and the
//! NetworkCheck, Devices, and Products transitions.

use super::Enumerator;
use crate::dpa::{self, embed};
use crate::exclusive::ExclusiveAccess;
use crate::store;
use iqrfd_api::dpa::{pcmd, pnum, DpaRequest, DpaResponse};
use iqrfd_api::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// RAM address the FRC memory read collects enumeration data from.
const FRC_MEMORY_ADDRESS: u16 = 0x04a0;

/// Offsets of the interesting fields within the peripheral
/// enumeration and OS read answers stored at that address.
const OFFSET_PER_ENUM_HWPID: u16 = 7;
const OFFSET_PER_ENUM_DPA: u16 = 0;
const OFFSET_OS_READ_VERSION: u16 = 4;

/// Longest EEEPROM extended read.
const EEEPROM_READ_MAX_LEN: u16 = 54;

/// Nodes per enumeration FRC batch; one memory-read FRC resolves 4
/// bytes per node and the send response carries data for 12 of
/// them, the extra result for 3 more.
const FRC_ENUM_BATCH: usize = 15;
const FRC_ENUM_NO_EXTRA: usize = 12;

/// Lowest DPA version the package walk-down tries.
const DPA_VERSION_FLOOR: u16 = 768;

/// A product seen during the pass, before it has a database row.
pub(super) struct ProductSlot {
    pub product: store::Product,
    pub drivers: BTreeSet<i64>,
    pub resolved: bool,
}

/// The transient working set of one pass. Devices and products are
/// plain vectors and index maps; only the store owns persistent
/// identity.
#[derive(Default)]
pub(super) struct Pass {
    pub reenumerate: bool,
    pub to_enumerate: BTreeSet<u8>,
    pub discovered: BTreeSet<u8>,
    pub to_delete: Vec<i64>,
    pub mids: BTreeMap<u8, u32>,
    pub vrns: BTreeMap<u8, u8>,
    pub zones: BTreeMap<u8, u8>,
    pub parents: BTreeMap<u8, u8>,
    pub products: Vec<ProductSlot>,
    pub product_index: BTreeMap<(u16, u16, u16, u16), usize>,
    pub device_product: BTreeMap<u8, usize>,
    pub peripherals: BTreeMap<u8, BTreeSet<i16>>,
}

impl Pass {
    pub fn new(reenumerate: bool) -> Self {
        Pass {
            reenumerate,
            ..Pass::default()
        }
    }

    fn intern_product(
        &mut self,
        addr: u8,
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        os_version: &str,
        dpa_version: u16,
    ) {
        let key = (hwpid, hwpid_version, os_build, dpa_version);
        let slot = match self.product_index.get(&key) {
            Some(slot) => *slot,
            None => {
                self.products.push(ProductSlot {
                    product: store::Product::new(
                        hwpid,
                        hwpid_version,
                        os_build,
                        os_version,
                        dpa_version,
                    ),
                    drivers: BTreeSet::new(),
                    resolved: false,
                });
                self.product_index.insert(key, self.products.len() - 1);
                self.products.len() - 1
            }
        };

        self.device_product.insert(addr, slot);
    }
}

impl Enumerator {
    async fn execute_parsed(
        &self,
        access: &ExclusiveAccess,
        req: DpaRequest,
    ) -> Result<DpaResponse> {
        let result = access.execute_repeat(&req, None, 1).await;

        match result.response {
            Some(bytes) if result.status.is_ok() => {
                DpaResponse::parse(&bytes)
            }
            _ => Err(Error::OperationError(result.error_str)),
        }
    }

    // -----------------------------------------------------------------
    // NetworkCheck

    /// Reads the bonded and discovered bitmaps, the MID table, and
    /// the routing arrays, then reconciles against the store:
    /// devices missing from the bonded set are marked for deletion,
    /// devices whose stored MID still matches are dropped from the
    /// enumeration set (unless a full re-enumeration was asked for).
    pub(super) async fn check_network(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        let bonded = self
            .execute_parsed(access, embed::bonded_devices())
            .await?;

        pass.to_enumerate = dpa::bitmap_to_addrs(&bonded.pdata);
        pass.to_enumerate.insert(0);

        let discovered = self
            .execute_parsed(access, embed::discovered_devices())
            .await?;

        for addr in dpa::bitmap_to_addrs(&discovered.pdata) {
            if pass.to_enumerate.contains(&addr) {
                pass.discovered.insert(addr);
            }
        }

        self.read_mids(access, pass).await?;
        self.read_routing(access, pass).await?;

        // The coordinator's own MID comes from its OS read, not the
        // EEEPROM table.

        let os = self
            .execute_parsed(access, embed::os_read(0))
            .await
            .and_then(|rsp| dpa::OsRead::parse(&rsp.pdata))?;

        pass.mids.insert(0, os.mid);

        let devices = {
            let store = self.store.lock().unwrap();

            store.devices()?
        };

        for device in devices {
            if !pass.to_enumerate.contains(&device.address) {
                pass.to_delete.push(device.id);
                continue;
            }

            if !pass.reenumerate
                && pass.mids.get(&device.address) == Some(&device.mid)
            {
                pass.to_enumerate.remove(&device.address);
            }
        }
        Ok(())
    }

    // The MID table is an EEEPROM area of 8 bytes per address, read
    // in 54-byte chunks.

    async fn read_mids(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        let Some(max) = pass.to_enumerate.iter().max().copied() else {
            return Ok(());
        };
        let total = (max as u16 + 1) * 8;
        let data = self.eeeprom_span(access, 0x4000, total).await?;

        for addr in &pass.to_enumerate {
            if *addr == 0 {
                continue;
            }

            let idx = *addr as usize * 8;
            let mid = data[idx] as u32
                | (data[idx + 1] as u32) << 8
                | (data[idx + 2] as u32) << 16
                | (data[idx + 3] as u32) << 24;

            pass.mids.insert(*addr, mid);
        }
        Ok(())
    }

    // VRN, zone, and parent arrays for discovered nodes. The zone
    // array stores the logical zone plus one.

    async fn read_routing(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        let Some(max) = pass.discovered.iter().max().copied() else {
            return Ok(());
        };
        let total = max as u16 + 1;

        let vrns = self.eeeprom_span(access, 0x5000, total).await?;
        let zones = self.eeeprom_span(access, 0x5200, total).await?;
        let parents = self.eeeprom_span(access, 0x5300, total).await?;

        for addr in &pass.discovered {
            let idx = *addr as usize;

            pass.vrns.insert(*addr, vrns[idx]);
            pass.zones.insert(
                *addr,
                if *addr == 0 {
                    0
                } else {
                    zones[idx].saturating_sub(1)
                },
            );
            pass.parents.insert(*addr, parents[idx]);
        }
        Ok(())
    }

    async fn eeeprom_span(
        &self,
        access: &ExclusiveAccess,
        start: u16,
        total: u16,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(total as usize);
        let mut offset = 0;

        while offset < total {
            let len = (total - offset).min(EEEPROM_READ_MAX_LEN) as u8;
            let rsp = self
                .execute_parsed(
                    access,
                    embed::eeeprom_read(start + offset, len),
                )
                .await?;

            if rsp.pdata.len() < len as usize {
                return Err(Error::ProtocolError(format!(
                    "short EEEPROM read at {:#06x}",
                    start + offset
                )));
            }
            data.extend_from_slice(&rsp.pdata[..len as usize]);
            offset += len as u16;
        }
        Ok(data)
    }

    // -----------------------------------------------------------------
    // Devices

    /// Collects the identity tuple of every device left in the
    /// enumeration set: batched FRC when the coordinator's DPA
    /// supports it and more than one node is waiting, per-node
    /// polling otherwise.
    pub(super) async fn enumerate_devices(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        if pass.to_enumerate.contains(&0) {
            if let Err(e) = self.poll_device(access, pass, 0).await {
                warn!("failed to enumerate the coordinator: {}", e);
                pass.to_enumerate.remove(&0);
            }
        }

        let nodes =
            pass.to_enumerate.iter().filter(|a| **a != 0).count();

        if nodes > 1 && self.coordinator_dpa_version(pass) >= 0x0402 {
            self.frc_enumeration(access, pass).await?;
        } else {
            let addrs: Vec<u8> = pass
                .to_enumerate
                .iter()
                .copied()
                .filter(|a| *a != 0)
                .collect();

            for addr in addrs {
                if let Err(e) = self.poll_device(access, pass, addr).await {
                    warn!(
                        "failed to enumerate node at address {}: {}",
                        addr, e
                    );
                    pass.to_enumerate.remove(&addr);
                }
            }
        }
        Ok(())
    }

    fn coordinator_dpa_version(&self, pass: &Pass) -> u16 {
        if let Some(slot) = pass.device_product.get(&0) {
            return pass.products[*slot].product.dpa_version;
        }

        let store = self.store.lock().unwrap();

        store
            .device_by_address(0)
            .ok()
            .flatten()
            .and_then(|dev| store.product_by_id(dev.product_id).ok())
            .flatten()
            .map(|product| product.dpa_version)
            .unwrap_or(0)
    }

    async fn poll_device(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
        addr: u8,
    ) -> Result<()> {
        let os = self
            .execute_parsed(access, embed::os_read(addr as u16))
            .await
            .and_then(|rsp| dpa::OsRead::parse(&rsp.pdata))?;
        let en = self
            .execute_parsed(
                access,
                embed::peripheral_enumeration(addr as u16),
            )
            .await
            .and_then(|rsp| dpa::PerEnum::parse(&rsp.pdata))?;

        pass.mids.entry(addr).or_insert(os.mid);
        pass.peripherals.insert(addr, en.peripherals());
        pass.intern_product(
            addr,
            en.hwpid,
            en.hwpid_version,
            os.os_build,
            &os.os_version_string(),
            en.dpa_version,
        );
        Ok(())
    }

    // FRC-batched identification: ping to learn who is online, then
    // three selective memory-read sweeps over the survivors.

    async fn frc_enumeration(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        let ping = self
            .execute_parsed(access, embed::frc_ping())
            .await
            .and_then(|rsp| dpa::FrcData::parse(&rsp.pdata))?;
        let online = dpa::bitmap_to_addrs(&ping.data);

        pass.to_enumerate
            .retain(|addr| *addr == 0 || online.contains(addr));

        let targets: Vec<u8> = pass
            .to_enumerate
            .iter()
            .copied()
            .filter(|a| *a != 0)
            .collect();

        if targets.is_empty() {
            return Ok(());
        }

        let hwpid_data = self
            .frc_collect(
                access,
                &targets,
                FRC_MEMORY_ADDRESS + OFFSET_PER_ENUM_HWPID,
                pnum::EXPLORATION,
                pcmd::EXPLORATION_PER_ENUM,
            )
            .await?;
        let dpa_data = self
            .frc_collect(
                access,
                &targets,
                FRC_MEMORY_ADDRESS + OFFSET_PER_ENUM_DPA,
                pnum::EXPLORATION,
                pcmd::EXPLORATION_PER_ENUM,
            )
            .await?;
        let os_data = self
            .frc_collect(
                access,
                &targets,
                FRC_MEMORY_ADDRESS + OFFSET_OS_READ_VERSION,
                pnum::OS,
                pcmd::OS_READ,
            )
            .await?;

        for (i, addr) in targets.iter().enumerate() {
            let h = &hwpid_data[i * 4..i * 4 + 4];
            let d = &dpa_data[i * 4..i * 4 + 4];
            let o = &os_data[i * 4..i * 4 + 4];

            let hwpid = h[0] as u16 | (h[1] as u16) << 8;
            let hwpid_version = h[2] as u16 | (h[3] as u16) << 8;
            let dpa_version = d[0] as u16 | (d[1] as u16) << 8;
            let os_build = o[2] as u16 | (o[3] as u16) << 8;
            let os_version = dpa::os_version_string(o[0], o[1]);

            pass.intern_product(
                *addr,
                hwpid,
                hwpid_version,
                os_build,
                &os_version,
                dpa_version,
            );
        }
        Ok(())
    }

    // Runs one selective memory-read sweep in batches, interleaving
    // the extra result whenever a batch spills past the send
    // response. Returns 4 bytes per target, in target order.

    async fn frc_collect(
        &self,
        access: &ExclusiveAccess,
        targets: &[u8],
        address: u16,
        req_pnum: u8,
        req_pcmd: u8,
    ) -> Result<Vec<u8>> {
        let mut data = vec![];

        for batch in targets.chunks(FRC_ENUM_BATCH) {
            let rsp = self
                .execute_parsed(
                    access,
                    embed::frc_memory_read_4b(
                        batch.iter().copied(),
                        address,
                        req_pnum,
                        req_pcmd,
                    ),
                )
                .await
                .and_then(|rsp| dpa::FrcData::parse(&rsp.pdata))?;

            // The first 4 bytes of FRC data belong to the
            // coordinator slot.

            data.extend_from_slice(&rsp.data[4..]);

            if batch.len() > FRC_ENUM_NO_EXTRA {
                let extra = self
                    .execute_parsed(access, embed::frc_extra_result())
                    .await?;

                data.extend_from_slice(&extra.pdata[..9.min(extra.pdata.len())]);
            }
        }

        if data.len() < targets.len() * 4 {
            return Err(Error::ProtocolError(
                "FRC enumeration data shorter than target set".into(),
            ));
        }
        Ok(data)
    }

    // -----------------------------------------------------------------
    // Products

    /// Resolves every interned product against the catalog: exact
    /// package, stored product, hwpid-0 fallback, then the DPA
    /// walk-down. Non-certified profiles (low nibble 0xF) bind the
    /// latest driver per peripheral the device itself declares.
    pub(super) async fn product_enumeration(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
    ) -> Result<()> {
        let addrs: Vec<u8> = pass.to_enumerate.iter().copied().collect();

        for addr in addrs {
            let Some(slot) = pass.device_product.get(&addr).copied()
            else {
                continue;
            };

            if pass.products[slot].resolved {
                continue;
            }

            let (hwpid, hwpid_version, os_build, dpa_version) = {
                let p = &pass.products[slot].product;

                (p.hwpid, p.hwpid_version, p.os_build, p.dpa_version)
            };

            if hwpid & 0x000F == 0x000F {
                self.resolve_noncertified(access, pass, addr, slot)
                    .await?;
                continue;
            }

            if let Some(package) = self.find_package(
                hwpid,
                hwpid_version,
                os_build,
                dpa_version,
                pass,
                slot,
            )? {
                self.apply_package(pass, slot, &package)?;
            } else {
                warn!(
                    "cannot find package for: nadr {} hwpid {} \
		     hwpidVer {} osBuild {:04X}, any DPA",
                    addr, hwpid, hwpid_version, os_build
                );
            }
        }
        Ok(())
    }

    // Exact package, stored product (adopting its driver links), the
    // hwpid-0 package for the same OS/DPA, then DPA versions walked
    // downward to the floor.

    fn find_package(
        &self,
        hwpid: u16,
        hwpid_version: u16,
        os_build: u16,
        dpa_version: u16,
        pass: &mut Pass,
        slot: usize,
    ) -> Result<Option<iqrfd_api::Package>> {
        if let Some(package) =
            self.cache.package(hwpid, hwpid_version, os_build, dpa_version)
        {
            return Ok(Some(package));
        }

        {
            let store = self.store.lock().unwrap();

            if let Some(db_product) = store.product_by_tuple(
                hwpid,
                hwpid_version,
                os_build,
                dpa_version,
            )? {
                let product = &mut pass.products[slot];

                product.product.handler_url = db_product.handler_url;
                product.product.handler_hash = db_product.handler_hash;
                product.product.custom_driver = db_product.custom_driver;
                product.product.package_id = db_product.package_id;
                product.product.name = db_product.name;
                product.drivers = store.product_driver_ids(db_product.id)?;
                product.resolved = true;
                return Ok(None);
            }
        }

        if let Some(package) =
            self.cache.package(0, 0, os_build, dpa_version)
        {
            return Ok(Some(package));
        }

        let mut dpa = dpa_version.saturating_sub(1);

        while dpa >= DPA_VERSION_FLOOR {
            if let Some(package) = self.cache.package(0, 0, os_build, dpa) {
                return Ok(Some(package));
            }
            dpa -= 1;
        }
        Ok(None)
    }

    fn apply_package(
        &self,
        pass: &mut Pass,
        slot: usize,
        package: &iqrfd_api::Package,
    ) -> Result<()> {
        {
            let product = &mut pass.products[slot];

            product.product.handler_url = package.handler_url.clone();
            product.product.handler_hash = package.handler_hash.clone();
            product.product.custom_driver = package.custom_driver.clone();
            product.product.package_id = Some(package.package_id);
        }

        let store = self.store.lock().unwrap();

        for item in &package.std_drivers {
            let id = match store
                .driver_by_peripheral_version(item.peripheral, item.version)?
            {
                Some(driver) => driver.id,
                None => store.insert_driver(&store::Driver {
                    id: 0,
                    name: item.name.clone(),
                    peripheral: item.peripheral,
                    version: item.version,
                    version_flags: item.version_flags,
                    code: item.code.clone(),
                    hash: item.hash.clone(),
                })?,
            };

            pass.products[slot].drivers.insert(id);
        }
        pass.products[slot].resolved = true;
        Ok(())
    }

    // Non-certified profile: adopt an existing stored product, or
    // bind the latest driver of every peripheral the device
    // declares, always including FRC when a sensor or light standard
    // is present.

    async fn resolve_noncertified(
        &self,
        access: &ExclusiveAccess,
        pass: &mut Pass,
        addr: u8,
        slot: usize,
    ) -> Result<()> {
        {
            let store = self.store.lock().unwrap();
            let p = &pass.products[slot].product;

            if let Some(db_product) = store.product_by_tuple(
                p.hwpid,
                p.hwpid_version,
                p.os_build,
                p.dpa_version,
            )? {
                pass.products[slot].drivers =
                    store.product_driver_ids(db_product.id)?;
                pass.products[slot].resolved = true;
                return Ok(());
            }
        }

        let mut pers = match pass.peripherals.get(&addr) {
            Some(pers) => pers.clone(),
            None => {
                let en = self
                    .execute_parsed(
                        access,
                        embed::peripheral_enumeration(addr as u16),
                    )
                    .await
                    .and_then(|rsp| dpa::PerEnum::parse(&rsp.pdata))?;

                en.peripherals()
            }
        };

        if (pers.contains(&(pnum::SENSOR as i16))
            || pers.contains(&(pnum::LIGHT as i16)))
            && !pers.contains(&(pnum::FRC as i16))
        {
            pers.insert(pnum::FRC as i16);
        }

        let store = self.store.lock().unwrap();

        for per in pers {
            let Some(candidate) = self.cache.latest_driver(per) else {
                continue;
            };

            let id = match store.driver_by_peripheral_version(
                candidate.peripheral,
                candidate.version,
            )? {
                Some(driver) => driver.id,
                None => store.insert_driver(&store::Driver {
                    id: 0,
                    name: candidate.name.clone(),
                    peripheral: candidate.peripheral,
                    version: candidate.version,
                    version_flags: candidate.version_flags,
                    code: candidate.code.clone(),
                    hash: candidate.hash.clone(),
                })?,
            };

            pass.products[slot].drivers.insert(id);
        }
        pass.products[slot].resolved = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Database reconciliation

    /// Applies the pass to the store in one transaction: deletions,
    /// product upserts with their driver links, then device upserts.
    /// A device row is updated in place; it is never deleted and
    /// recreated for a MID change.
    pub(super) fn update_database(&self, pass: &Pass) -> Result<()> {
        let store = self.store.lock().unwrap();

        store.with_transaction(|store| {
            for id in &pass.to_delete {
                store.remove_device(*id)?;
            }

            for addr in &pass.to_enumerate {
                let Some(slot) = pass.device_product.get(addr).copied()
                else {
                    continue;
                };
                let product = &pass.products[slot];
                let p = &product.product;

                let product_id = match store.product_by_tuple(
                    p.hwpid,
                    p.hwpid_version,
                    p.os_build,
                    p.dpa_version,
                )? {
                    Some(db_product) => db_product.id,
                    None => store.insert_product(p)?,
                };

                if product.resolved {
                    store
                        .set_product_drivers(product_id, &product.drivers)?;
                }

                let discovered = pass.discovered.contains(addr);
                let mid = pass.mids.get(addr).copied().unwrap_or(0);
                let vrn = if discovered {
                    pass.vrns.get(addr).copied().unwrap_or(0)
                } else {
                    0
                };
                let zone = if discovered {
                    pass.zones.get(addr).copied().unwrap_or(0)
                } else {
                    0
                };
                let parent = discovered
                    .then(|| pass.parents.get(addr).copied())
                    .flatten();

                match store.device_by_address(*addr)? {
                    None => {
                        store.insert_device(&store::Device::new(
                            *addr, discovered, mid, vrn, zone, parent,
                            product_id,
                        ))?;
                    }
                    Some(mut device) => {
                        device.discovered = discovered;
                        device.mid = mid;
                        device.vrn = vrn;
                        device.zone = zone;
                        device.parent = parent;
                        device.product_id = product_id;
                        store.update_device(&device)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Reloads the context of every product whose loaded driver-id
    /// set diverges from the database set. The coordinator's product
    /// always carries the latest driver of each peripheral.
    pub(super) fn load_product_drivers(&self) -> Result<()> {
        let (map, coordinator_pid) = {
            let store = self.store.lock().unwrap();

            (
                store.products_drivers_map()?,
                store.coordinator_product_id()?,
            )
        };

        for (product_id, db_drivers) in map {
            if !self.registry.needs_reload(product_id, &db_drivers) {
                continue;
            }

            let (drivers, custom, addresses) = {
                let store = self.store.lock().unwrap();
                let drivers = if Some(product_id) == coordinator_pid {
                    store.latest_drivers()?
                } else {
                    store.drivers_by_product(product_id)?
                };

                (
                    drivers,
                    store.product_custom_driver(product_id)?,
                    store.product_device_addresses(product_id)?,
                )
            };

            if let Err(e) = self.registry.load_product_context(
                product_id,
                &drivers,
                custom.as_deref(),
                &addresses,
            ) {
                warn!(
                    "failed to load drivers for context {}: {}",
                    product_id, e
                );
                continue;
            }
            debug!("reloaded context for product {}", product_id);
        }
        Ok(())
    }
}
