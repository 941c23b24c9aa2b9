use std::collections::HashMap;
use std::sync::Arc;

use ironzone_lib::ResourceRecord;
use tokio::sync::RwLock;

use crate::models::Soa;
use crate::{normalize_origin, ApplyCounts, ZoneDelta, ZoneStore};

struct MemZone {
    soa: Soa,
    records: Vec<ResourceRecord<'static>>,
}

/// Zones served straight from memory. Holds only the current state of
/// each zone, so it can answer full transfers but keeps no history for
/// incremental ones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    zones: Arc<RwLock<HashMap<String, MemZone>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub async fn zone_count(&self) -> usize {
        self.zones.read().await.len()
    }
}

impl ZoneStore for MemoryStore {
    async fn load_zone(&self, origin: &str) -> anyhow::Result<Option<Soa>> {
        let zones = self.zones.read().await;
        Ok(zones.get(&normalize_origin(origin)).map(|zone| zone.soa.clone()))
    }

    async fn load_records(&self, origin: &str) -> anyhow::Result<Vec<ResourceRecord<'static>>> {
        let zones = self.zones.read().await;
        Ok(zones
            .get(&normalize_origin(origin))
            .map(|zone| zone.records.clone())
            .unwrap_or_default())
    }

    async fn replace_zone<'a>(
        &'a self,
        soa: &'a ResourceRecord<'static>,
        records: &'a [ResourceRecord<'static>],
    ) -> anyhow::Result<ApplyCounts> {
        let soa_row = Soa::from_wire(soa)?;
        let mut zones = self.zones.write().await;

        let same = |a: &ResourceRecord<'_>, b: &ResourceRecord<'_>| {
            a.name.eq_ignore_ascii_case(&b.name) && a.resource_data == b.resource_data
        };
        let key =
            |rr: &ResourceRecord<'_>| (rr.name.to_ascii_lowercase(), rr.resource_data.get_record_type());
        let counts = match zones.get(&soa_row.origin) {
            Some(zone) => {
                let added = records
                    .iter()
                    .filter(|rr| !zone.records.iter().any(|have| same(have, rr)))
                    .map(|rr| key(rr))
                    .collect();
                let deleted = zone
                    .records
                    .iter()
                    .filter(|have| !records.iter().any(|rr| same(have, rr)))
                    .map(|rr| key(rr))
                    .collect();
                crate::count_changes(deleted, added)
            }
            None => ApplyCounts {
                added: records.len(),
                updated: 0,
                deleted: 0,
            },
        };

        zones.insert(
            soa_row.origin.clone(),
            MemZone {
                soa: soa_row,
                records: records.to_vec(),
            },
        );
        Ok(counts)
    }

    async fn changes_since(&self, _origin: &str, _since_serial: u32) -> anyhow::Result<Option<ZoneDelta>> {
        // No history is kept in memory
        Ok(None)
    }
}
