mod memory;
mod models;
mod sqlite;

use std::future::Future;

use ironzone_lib::{RecordType, ResourceRecord};
pub use memory::MemoryStore;
pub use models::{Model, Soa, TransferLog, TsigKeyRow, ZoneMaster, ZoneRecord};
pub use sqlite::{SlaveZone, SqliteStore};

/// Records that changed between two zone serials
#[derive(Debug, Default)]
pub struct ZoneDelta {
    pub deleted: Vec<ResourceRecord<'static>>,
    pub added: Vec<ResourceRecord<'static>>,
}

/// What a zone swap actually changed. A deletion and an addition that
/// share the owner name and record type pair up into one update.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyCounts {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Key a record changes under: lowercased owner name plus record type
type ChangeKey = (String, RecordType);

/// Folds raw deletions and additions into `ApplyCounts`, pairing each
/// deletion with an addition of the same key as a single update
fn count_changes(mut deleted: Vec<ChangeKey>, added: Vec<ChangeKey>) -> ApplyCounts {
    let mut counts = ApplyCounts {
        added: added.len(),
        updated: 0,
        deleted: deleted.len(),
    };
    for key in &added {
        if let Some(position) = deleted.iter().position(|have| have == key) {
            deleted.swap_remove(position);
            counts.added -= 1;
            counts.deleted -= 1;
            counts.updated += 1;
        }
    }
    counts
}

/// A place zones live in: the SQL database, the in-memory store, or both
/// behind a fan-out. Inbound transfers apply through this trait so every
/// backing store observes the same atomic zone swap.
pub trait ZoneStore: Send + Sync + 'static {
    /// Looks a zone up by origin
    fn load_zone(&self, origin: &str) -> impl Future<Output = anyhow::Result<Option<Soa>>> + Send;

    /// Returns the zone's current records, without the SOA
    fn load_records(&self, origin: &str) -> impl Future<Output = anyhow::Result<Vec<ResourceRecord<'static>>>> + Send;

    /// Atomically replaces the zone's contents with a transferred record
    /// set. `soa` is the transferred SOA RR and `records` everything else.
    fn replace_zone<'a>(
        &'a self,
        soa: &'a ResourceRecord<'static>,
        records: &'a [ResourceRecord<'static>],
    ) -> impl Future<Output = anyhow::Result<ApplyCounts>> + Send + 'a;

    /// Changes between `since_serial` and the zone's current serial.
    /// `Ok(None)` means this store keeps no usable history and the caller
    /// should fall back to a full transfer.
    fn changes_since(
        &self,
        origin: &str,
        since_serial: u32,
    ) -> impl Future<Output = anyhow::Result<Option<ZoneDelta>>> + Send;
}

/// Lowercases an origin and drops the trailing dot so that lookups are
/// insensitive to how the name arrived
pub fn normalize_origin(origin: &str) -> String {
    origin.trim_end_matches('.').to_ascii_lowercase()
}
