mod logging;
pub use logging::setup_logging;
mod acl;
pub use acl::TransferAcl;
mod server;
pub use server::XferServer;
mod cli;
pub use cli::Args;
mod app;
pub use app::App;
mod notify;
mod scheduler;
pub use scheduler::Scheduler;
mod transfer_logger;
pub use transfer_logger::TransferLogger;
pub mod xfr;

use ironzone_db::{ApplyCounts, MemoryStore, Soa, SqliteStore, TransferLog, ZoneDelta, ZoneStore};
use ironzone_lib::ResourceRecord;
use tokio::sync::mpsc::UnboundedSender;

/// Upper bound on how long a single outbound transfer may run
pub const MAX_TRANSFER_DURATION_SECS: u64 = 3600;
/// How many bytes an inbound transfer may occupy before it is aborted
pub const DEFAULT_MAX_INBOUND_TRANSFER_SIZE: usize = 64 * 1024 * 1024;

/// Shared server state: the zone database, the in-memory serving cache,
/// the transfer ACL and the log channel.
pub struct State {
    pub db: SqliteStore,
    pub cache: MemoryStore,
    pub acl: TransferAcl,
    pub require_tsig: bool,
    pub log_tx: UnboundedSender<TransferLog>,
    pub max_inbound_transfer_size: usize,
}

impl State {
    pub fn record_transfer(&self, log: TransferLog) {
        if self.log_tx.send(log).is_err() {
            tracing::debug!("transfer logger is gone, dropping a log entry");
        }
    }
}

/// Inbound transfers apply through the state so that the database and
/// the in-memory cache swap the zone in lockstep. Reads are answered
/// from the database, which is the copy that keeps history.
impl ZoneStore for State {
    async fn load_zone(&self, origin: &str) -> anyhow::Result<Option<Soa>> {
        self.db.load_zone(origin).await
    }

    async fn load_records(&self, origin: &str) -> anyhow::Result<Vec<ResourceRecord<'static>>> {
        self.db.load_records(origin).await
    }

    async fn replace_zone<'a>(
        &'a self,
        soa: &'a ResourceRecord<'static>,
        records: &'a [ResourceRecord<'static>],
    ) -> anyhow::Result<ApplyCounts> {
        let counts = self.db.replace_zone(soa, records).await?;
        self.cache.replace_zone(soa, records).await?;
        Ok(counts)
    }

    async fn changes_since(&self, origin: &str, since_serial: u32) -> anyhow::Result<Option<ZoneDelta>> {
        self.db.changes_since(origin, since_serial).await
    }
}
