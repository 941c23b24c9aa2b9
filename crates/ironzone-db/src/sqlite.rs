use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use ironzone_lib::ResourceRecord;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{Model as _, Soa, TsigKeyRow, ZoneMaster, ZoneRecord};
use crate::{normalize_origin, ApplyCounts, ZoneDelta, ZoneStore};

/// A zone with at least one configured master: we are a slave for it
#[derive(Debug, Clone)]
pub struct SlaveZone {
    pub soa: Soa,
    pub masters: Vec<ZoneMaster>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    connection_pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: &Path) -> anyhow::Result<Self> {
        // Ensure that all directories exist
        tokio::fs::create_dir_all(path.parent().unwrap_or(Path::new("/")))
            .await
            .context("error while creating parent directories for the zone DB")?;

        let connect_options = SqliteConnectOptions::new().create_if_missing(true).filename(path);

        let connection_pool = SqlitePoolOptions::new()
            .min_connections(3)
            .max_connections(10)
            .max_lifetime(Duration::from_secs(60 * 60 * 8))
            .connect_with(connect_options)
            .await
            .context("error while opening a connection to SQLite DB")?;

        let store = SqliteStore { connection_pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// A private in-memory database. Useful in tests.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let connection_pool = SqlitePoolOptions::new()
            // Every connection would get its own empty database otherwise
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .context("error while opening an in-memory SQLite DB")?;

        let store = SqliteStore { connection_pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub async fn init_tables(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS soa (
                id INTEGER PRIMARY KEY,
                origin TEXT NOT NULL UNIQUE,
                ns TEXT NOT NULL,
                mbox TEXT NOT NULL,
                serial INTEGER NOT NULL,
                refresh INTEGER NOT NULL,
                retry INTEGER NOT NULL,
                expire INTEGER NOT NULL,
                minimum INTEGER NOT NULL,
                ttl INTEGER NOT NULL,
                xfer TEXT
            )",
        )
        .execute(&self.connection_pool)
        .await
        .context("error while initializing the 'soa' table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rr (
                id INTEGER PRIMARY KEY,
                zone INTEGER NOT NULL REFERENCES soa(id),
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                aux INTEGER NOT NULL DEFAULT 0,
                ttl INTEGER NOT NULL,
                serial INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&self.connection_pool)
        .await
        .context("error while initializing the 'rr' table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS rr_zone_serial ON rr (zone, serial)")
            .execute(&self.connection_pool)
            .await
            .context("error while creating the 'rr' index")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS zone_masters (
                id INTEGER PRIMARY KEY,
                zone INTEGER NOT NULL REFERENCES soa(id),
                address TEXT NOT NULL,
                tsig_key TEXT,
                last_check INTEGER,
                last_xfer INTEGER,
                transfer_failures INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.connection_pool)
        .await
        .context("error while initializing the 'zone_masters' table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tsig_keys (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                algorithm TEXT NOT NULL,
                secret TEXT NOT NULL
            )",
        )
        .execute(&self.connection_pool)
        .await
        .context("error while initializing the 'tsig_keys' table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS zone_transfer_log (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                origin TEXT NOT NULL,
                kind TEXT NOT NULL,
                peer TEXT,
                serial INTEGER NOT NULL,
                records INTEGER NOT NULL,
                records_added INTEGER NOT NULL DEFAULT 0,
                records_updated INTEGER NOT NULL DEFAULT 0,
                records_deleted INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
        )
        .execute(&self.connection_pool)
        .await
        .context("error while initializing the 'zone_transfer_log' table")?;

        Ok(())
    }

    pub async fn get_connection(&self) -> anyhow::Result<PoolConnection<Sqlite>> {
        self.connection_pool
            .acquire()
            .await
            .context("failed to acquire a connection from pool")
    }

    /// It is the responsibility of the caller to commit the transaction.
    pub async fn begin_transaction(&self) -> anyhow::Result<Transaction<Sqlite>> {
        self.connection_pool
            .begin()
            .await
            .context("failed to start a transaction")
    }

    pub async fn load_tsig_key(&self, name: &str) -> anyhow::Result<Option<TsigKeyRow>> {
        sqlx::query_as::<_, TsigKeyRow>("SELECT * FROM tsig_keys WHERE name = ?1 COLLATE NOCASE")
            .bind(name.trim_end_matches('.'))
            .fetch_optional(&self.connection_pool)
            .await
            .context("error while loading a TSIG key")
    }

    pub async fn load_zones(&self) -> anyhow::Result<Vec<Soa>> {
        sqlx::query_as::<_, Soa>("SELECT * FROM soa ORDER BY id")
            .fetch_all(&self.connection_pool)
            .await
            .context("error while loading zones")
    }

    /// Returns every zone that has at least one configured master
    pub async fn load_slave_zones(&self) -> anyhow::Result<Vec<SlaveZone>> {
        let zones = sqlx::query_as::<_, Soa>(
            "SELECT * FROM soa WHERE id IN (SELECT DISTINCT zone FROM zone_masters) ORDER BY id",
        )
        .fetch_all(&self.connection_pool)
        .await
        .context("error while loading slave zones")?;

        let mut slave_zones = Vec::with_capacity(zones.len());
        for soa in zones {
            let masters = sqlx::query_as::<_, ZoneMaster>("SELECT * FROM zone_masters WHERE zone = ?1 ORDER BY id")
                .bind(soa.id)
                .fetch_all(&self.connection_pool)
                .await
                .with_context(|| format!("error while loading masters for zone '{}'", soa.origin))?;
            slave_zones.push(SlaveZone { soa, masters });
        }

        Ok(slave_zones)
    }

    /// Stamps the master row after a SOA check or a completed transfer
    pub async fn touch_master(&self, master_id: u32, checked_at: u32, transferred: bool) -> anyhow::Result<()> {
        let query = if transferred {
            "UPDATE zone_masters SET last_check = ?1, last_xfer = ?1 WHERE id = ?2"
        } else {
            "UPDATE zone_masters SET last_check = ?1 WHERE id = ?2"
        };
        sqlx::query(query)
            .bind(checked_at)
            .bind(master_id)
            .execute(&self.connection_pool)
            .await
            .context("error while updating a zone master")?;
        Ok(())
    }

    /// Sets or clears a zone's own transfer ACL
    pub async fn set_zone_xfer(&self, origin: &str, rules: Option<&str>) -> anyhow::Result<()> {
        sqlx::query("UPDATE soa SET xfer = ?1 WHERE origin = ?2")
            .bind(rules)
            .bind(normalize_origin(origin))
            .execute(&self.connection_pool)
            .await
            .context("error while updating a zone's transfer ACL")?;
        Ok(())
    }

    /// Resets the failure counter on success and bumps it otherwise
    pub async fn note_transfer_result(&self, master_id: u32, success: bool) -> anyhow::Result<()> {
        let query = if success {
            "UPDATE zone_masters SET transfer_failures = 0 WHERE id = ?1"
        } else {
            "UPDATE zone_masters SET transfer_failures = transfer_failures + 1 WHERE id = ?1"
        };
        sqlx::query(query)
            .bind(master_id)
            .execute(&self.connection_pool)
            .await
            .context("error while updating a master's failure counter")?;
        Ok(())
    }

    async fn find_zone(&self, origin: &str) -> anyhow::Result<Option<Soa>> {
        sqlx::query_as::<_, Soa>("SELECT * FROM soa WHERE origin = ?1")
            .bind(normalize_origin(origin))
            .fetch_optional(&self.connection_pool)
            .await
            .context("error while looking a zone up")
    }
}

impl ZoneStore for SqliteStore {
    async fn load_zone(&self, origin: &str) -> anyhow::Result<Option<Soa>> {
        self.find_zone(origin).await
    }

    async fn load_records(&self, origin: &str) -> anyhow::Result<Vec<ResourceRecord<'static>>> {
        let Some(zone) = self.find_zone(origin).await? else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, ZoneRecord>("SELECT * FROM rr WHERE zone = ?1 AND active = 1 ORDER BY id")
            .bind(zone.id)
            .fetch_all(&self.connection_pool)
            .await
            .with_context(|| format!("error while loading records of zone '{}'", zone.origin))?;

        rows.iter().map(|row| row.to_wire()).collect()
    }

    async fn replace_zone<'a>(
        &'a self,
        soa: &'a ResourceRecord<'static>,
        records: &'a [ResourceRecord<'static>],
    ) -> anyhow::Result<ApplyCounts> {
        let incoming = Soa::from_wire(soa)?;
        let mut txn = self.begin_transaction().await?;

        let existing = sqlx::query_as::<_, Soa>("SELECT * FROM soa WHERE origin = ?1")
            .bind(&incoming.origin)
            .fetch_optional(&mut *txn)
            .await
            .context("error while looking a zone up")?;

        let zone_id = match existing {
            Some(zone) => {
                sqlx::query(
                    "UPDATE soa SET ns = ?1, mbox = ?2, serial = ?3, refresh = ?4,
                        retry = ?5, expire = ?6, minimum = ?7, ttl = ?8 WHERE id = ?9",
                )
                .bind(&incoming.ns)
                .bind(&incoming.mbox)
                .bind(incoming.serial)
                .bind(incoming.refresh)
                .bind(incoming.retry)
                .bind(incoming.expire)
                .bind(incoming.minimum)
                .bind(incoming.ttl)
                .bind(zone.id)
                .execute(&mut *txn)
                .await
                .context("error while updating the zone's SOA")?;
                zone.id
            }
            None => {
                incoming.bind_and_insert(&mut txn).await?;
                sqlx::query_scalar::<_, u32>("SELECT id FROM soa WHERE origin = ?1")
                    .bind(&incoming.origin)
                    .fetch_one(&mut *txn)
                    .await
                    .context("error while fetching the new zone's id")?
            }
        };

        let current = sqlx::query_as::<_, ZoneRecord>("SELECT * FROM rr WHERE zone = ?1 AND active = 1")
            .bind(zone_id)
            .fetch_all(&mut *txn)
            .await
            .context("error while loading the zone's current records")?;

        // Tombstone rows that aren't part of the transferred set anymore.
        // Untouched rows keep their original serial so that incremental
        // transfers only see real changes.
        let mut deleted = Vec::new();
        for row in &current {
            if !records.iter().any(|rr| row.matches_wire(rr)) {
                sqlx::query("UPDATE rr SET active = 0, serial = ?1 WHERE id = ?2")
                    .bind(incoming.serial)
                    .bind(row.id)
                    .execute(&mut *txn)
                    .await
                    .context("error while tombstoning a record")?;
                deleted.push((row.name.clone(), row.record_type()));
            }
        }

        let mut added = Vec::new();
        for rr in records {
            if !current.iter().any(|row| row.matches_wire(rr)) {
                ZoneRecord::from_wire(zone_id, incoming.serial, rr)?
                    .bind_and_insert(&mut txn)
                    .await?;
                added.push((rr.name.to_ascii_lowercase(), rr.resource_data.get_record_type()));
            }
        }

        txn.commit().await.context("error while committing the zone swap")?;
        Ok(crate::count_changes(deleted, added))
    }

    async fn changes_since(&self, origin: &str, since_serial: u32) -> anyhow::Result<Option<ZoneDelta>> {
        let Some(zone) = self.find_zone(origin).await? else {
            return Ok(None);
        };
        if since_serial >= zone.serial {
            return Ok(Some(ZoneDelta::default()));
        }

        let deleted = sqlx::query_as::<_, ZoneRecord>("SELECT * FROM rr WHERE zone = ?1 AND active = 0 AND serial > ?2 ORDER BY id")
            .bind(zone.id)
            .bind(since_serial)
            .fetch_all(&self.connection_pool)
            .await
            .context("error while loading deleted records")?;
        let added = sqlx::query_as::<_, ZoneRecord>("SELECT * FROM rr WHERE zone = ?1 AND active = 1 AND serial > ?2 ORDER BY id")
            .bind(zone.id)
            .bind(since_serial)
            .fetch_all(&self.connection_pool)
            .await
            .context("error while loading added records")?;

        let deleted = deleted.iter().map(|row| row.to_wire()).collect::<anyhow::Result<_>>()?;
        let added = added.iter().map(|row| row.to_wire()).collect::<anyhow::Result<_>>()?;

        Ok(Some(ZoneDelta { deleted, added }))
    }
}

#[cfg(test)]
mod tests {
    use ironzone_lib::{ResourceData, ResourceRecord};

    use super::*;

    fn soa_rr(serial: u32) -> ResourceRecord<'static> {
        ResourceRecord::new(
            "example.com",
            ResourceData::SOA {
                mname: "ns1.example.com".into(),
                rname: "hostmaster.example.com".into(),
                serial,
                refresh: 7200,
                retry: 1800,
                expire: 1209600,
                minimum: 300,
            },
            Some(300),
            None,
        )
        .into_owned()
    }

    fn a_rr(name: &str, address: &str) -> ResourceRecord<'static> {
        ResourceRecord::new(
            name,
            ResourceData::A {
                address: address.parse().unwrap(),
            },
            Some(300),
            None,
        )
        .into_owned()
    }

    #[tokio::test]
    async fn zone_swap_creates_and_updates() {
        let store = SqliteStore::open_in_memory().await.unwrap();

        let records = vec![a_rr("www.example.com", "1.2.3.4"), a_rr("ftp.example.com", "1.2.3.5")];
        let counts = store.replace_zone(&soa_rr(1), &records).await.unwrap();
        assert_eq!(counts.added, 2);
        assert_eq!(counts.updated, 0);
        assert_eq!(counts.deleted, 0);

        let zone = store.load_zone("Example.COM.").await.unwrap().unwrap();
        assert_eq!(zone.origin, "example.com");
        assert_eq!(zone.serial, 1);
        assert_eq!(store.load_records("example.com").await.unwrap().len(), 2);

        // Second transfer drops ftp and adds mail
        let records = vec![a_rr("www.example.com", "1.2.3.4"), a_rr("mail.example.com", "1.2.3.6")];
        let counts = store.replace_zone(&soa_rr(2), &records).await.unwrap();
        assert_eq!(counts.added, 1);
        assert_eq!(counts.updated, 0);
        assert_eq!(counts.deleted, 1);

        let zone = store.load_zone("example.com").await.unwrap().unwrap();
        assert_eq!(zone.serial, 2);
        let names: Vec<_> = store
            .load_records("example.com")
            .await
            .unwrap()
            .into_iter()
            .map(|rr| rr.name.into_owned())
            .collect();
        assert_eq!(names, vec!["www.example.com", "mail.example.com"]);

        // A record that only changed its data pairs up into one update
        let records = vec![a_rr("www.example.com", "5.6.7.8"), a_rr("mail.example.com", "1.2.3.6")];
        let counts = store.replace_zone(&soa_rr(3), &records).await.unwrap();
        assert_eq!(counts.added, 0);
        assert_eq!(counts.updated, 1);
        assert_eq!(counts.deleted, 0);
        assert_eq!(store.load_records("example.com").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tombstones_feed_incremental_history() {
        let store = SqliteStore::open_in_memory().await.unwrap();

        store
            .replace_zone(&soa_rr(1), &[a_rr("www.example.com", "1.2.3.4"), a_rr("ftp.example.com", "1.2.3.5")])
            .await
            .unwrap();
        store
            .replace_zone(&soa_rr(2), &[a_rr("www.example.com", "1.2.3.4"), a_rr("mail.example.com", "1.2.3.6")])
            .await
            .unwrap();

        let delta = store.changes_since("example.com", 1).await.unwrap().unwrap();
        assert_eq!(delta.deleted.len(), 1);
        assert_eq!(delta.deleted[0].name, "ftp.example.com");
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].name, "mail.example.com");

        // Unchanged rows keep their serial and stay out of the delta
        let delta = store.changes_since("example.com", 2).await.unwrap().unwrap();
        assert!(delta.deleted.is_empty() && delta.added.is_empty());

        // Unknown zones report no usable history
        assert!(store.changes_since("other.org", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tsig_key_lookup_ignores_case_and_dot() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO tsig_keys (name, algorithm, secret) VALUES ('transfer-key', 'hmac-sha256', 'c2VjcmV0')")
            .execute(&store.connection_pool)
            .await
            .unwrap();

        let key = store.load_tsig_key("Transfer-Key.").await.unwrap().unwrap();
        assert_eq!(key.algorithm, "hmac-sha256");
        assert!(store.load_tsig_key("missing").await.unwrap().is_none());
    }
}
