use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use super::Model;

/// One row of the `zone_transfer_log` table: a finished inbound or
/// outbound transfer.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransferLog {
    pub id: u32,
    pub timestamp: u32,
    pub origin: String,
    /// "axfr-out", "ixfr-out", "axfr-in" or "ixfr-in"
    pub kind: String,
    pub peer: Option<String>,
    pub serial: u32,
    pub records: u32,
    /// Store-side changes of an inbound transfer; zero for outbound
    /// ones. A record whose data changed counts as updated, not as a
    /// deletion plus an addition.
    pub records_added: u32,
    pub records_updated: u32,
    pub records_deleted: u32,
    pub duration_ms: u32,
    pub status: String,
}

impl TransferLog {
    pub fn new(
        origin: &str,
        kind: &str,
        peer: Option<IpAddr>,
        serial: u32,
        records: u32,
        duration_ms: u32,
        status: &str,
    ) -> anyhow::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("bug: misconfigured time on the system")?
            .as_secs() as u32;

        Ok(TransferLog {
            id: 0,
            timestamp,
            origin: origin.to_owned(),
            kind: kind.to_owned(),
            peer: peer.map(|addr| addr.to_string()),
            serial,
            records,
            records_added: 0,
            records_updated: 0,
            records_deleted: 0,
            duration_ms,
            status: status.to_owned(),
        })
    }

    pub fn with_changes(mut self, added: u32, updated: u32, deleted: u32) -> Self {
        self.records_added = added;
        self.records_updated = updated;
        self.records_deleted = deleted;
        self
    }
}

impl Model for TransferLog {
    const NAME: &str = "TransferLog";

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64> {
        sqlx::query(
            "INSERT INTO zone_transfer_log (timestamp, origin, kind, peer, serial, records,
                records_added, records_updated, records_deleted, duration_ms, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(self.timestamp)
        .bind(&self.origin)
        .bind(&self.kind)
        .bind(&self.peer)
        .bind(self.serial)
        .bind(self.records)
        .bind(self.records_added)
        .bind(self.records_updated)
        .bind(self.records_deleted)
        .bind(self.duration_ms)
        .bind(&self.status)
        .execute(connection)
        .await
        .context("error while inserting a transfer log entry")
        .map(|result| result.rows_affected())
    }
}
