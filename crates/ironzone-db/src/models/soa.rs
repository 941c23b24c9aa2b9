use anyhow::Context as _;
use ironzone_lib::{ResourceData, ResourceRecord};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use super::Model;

/// One row of the `soa` table: a zone we are authoritative for.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Soa {
    pub id: u32,
    pub origin: String,
    pub ns: String,
    pub mbox: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    pub ttl: u32,
    /// Optional per-zone transfer ACL overriding the global one:
    /// comma-separated addresses, CIDR blocks or wildcard patterns
    pub xfer: Option<String>,
}

impl Soa {
    /// Builds the zone's SOA RR as it appears on the wire
    pub fn to_wire(&self) -> ResourceRecord<'static> {
        ResourceRecord {
            name: self.origin.clone().into(),
            class: ironzone_lib::IN_CLASS,
            ttl: self.ttl,
            resource_data: ResourceData::SOA {
                mname: self.ns.clone().into(),
                rname: self.mbox.clone().into(),
                serial: self.serial,
                refresh: self.refresh,
                retry: self.retry,
                expire: self.expire,
                minimum: self.minimum,
            },
        }
    }

    /// Builds a row from a transferred SOA RR
    pub fn from_wire(rr: &ResourceRecord<'_>) -> anyhow::Result<Self> {
        let ResourceData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } = &rr.resource_data
        else {
            anyhow::bail!("record '{}' is not a SOA", rr.name);
        };
        Ok(Soa {
            id: 0,
            origin: rr.name.to_ascii_lowercase(),
            ns: mname.clone().into_owned(),
            mbox: rname.clone().into_owned(),
            serial: *serial,
            refresh: *refresh,
            retry: *retry,
            expire: *expire,
            minimum: *minimum,
            ttl: rr.ttl,
            xfer: None,
        })
    }
}

impl Model for Soa {
    const NAME: &str = "Soa";

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64> {
        sqlx::query(
            "INSERT INTO soa (origin, ns, mbox, serial, refresh, retry, expire, minimum, ttl, xfer)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&self.origin)
        .bind(&self.ns)
        .bind(&self.mbox)
        .bind(self.serial)
        .bind(self.refresh)
        .bind(self.retry)
        .bind(self.expire)
        .bind(self.minimum)
        .bind(self.ttl)
        .bind(&self.xfer)
        .execute(connection)
        .await
        .context("error while inserting a zone")
        .map(|result| result.rows_affected())
    }
}
