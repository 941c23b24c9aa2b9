use anyhow::Context as _;
use ironzone_lib::{RecordType, ResourceData, ResourceRecord};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use super::Model;

/// One row of the `rr` table.
///
/// `serial` is the zone serial at which this row last changed and
/// `active` whether the record is part of the zone or a tombstone.
/// Together they form the change history that incremental transfers
/// are answered from.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ZoneRecord {
    pub id: u32,
    pub zone: u32,
    pub name: String,
    #[sqlx(rename = "type")]
    pub rtype: String,
    pub data: String,
    /// MX preference; 0 for every other type
    pub aux: u32,
    pub ttl: u32,
    pub serial: u32,
    pub active: bool,
}

impl ZoneRecord {
    pub fn from_wire(zone: u32, serial: u32, rr: &ResourceRecord<'_>) -> anyhow::Result<Self> {
        let (rtype, data, aux) = match &rr.resource_data {
            ResourceData::A { address } => ("A".to_owned(), address.to_string(), 0),
            ResourceData::NS { ns_domain_name } => ("NS".to_owned(), ns_domain_name.clone().into_owned(), 0),
            ResourceData::CNAME { cname } => ("CNAME".to_owned(), cname.clone().into_owned(), 0),
            ResourceData::PTR { ptr_domain_name } => ("PTR".to_owned(), ptr_domain_name.clone().into_owned(), 0),
            ResourceData::MX { preference, exchange } => {
                ("MX".to_owned(), exchange.clone().into_owned(), *preference as u32)
            }
            ResourceData::TXT { strings } => (
                "TXT".to_owned(),
                strings
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect::<Vec<_>>()
                    .join(""),
                0,
            ),
            ResourceData::AAAA { address } => ("AAAA".to_owned(), address.to_string(), 0),
            ResourceData::UNKNOWN { qtype, .. } => {
                (format!("TYPE{}", qtype), rr.resource_data.to_zone_text(), 0)
            }
            ResourceData::SOA { .. } => anyhow::bail!("SOA records belong to the 'soa' table"),
            ResourceData::TSIG { .. } => anyhow::bail!("TSIG is a meta record and can't be stored"),
        };

        Ok(ZoneRecord {
            id: 0,
            zone,
            name: rr.name.to_ascii_lowercase(),
            rtype,
            data,
            aux,
            ttl: rr.ttl,
            serial,
            active: true,
        })
    }

    pub fn to_wire(&self) -> anyhow::Result<ResourceRecord<'static>> {
        let resource_data = match self.rtype.as_str() {
            "A" => ResourceData::A {
                address: self
                    .data
                    .parse()
                    .with_context(|| format!("A record '{}': bad address '{}'", self.name, self.data))?,
            },
            "NS" => ResourceData::NS {
                ns_domain_name: self.data.clone().into(),
            },
            "CNAME" => ResourceData::CNAME {
                cname: self.data.clone().into(),
            },
            "PTR" => ResourceData::PTR {
                ptr_domain_name: self.data.clone().into(),
            },
            "MX" => ResourceData::MX {
                preference: self.aux as u16,
                exchange: self.data.clone().into(),
            },
            "TXT" => ResourceData::TXT {
                strings: self
                    .data
                    .as_bytes()
                    .chunks(255)
                    .map(|chunk| chunk.to_vec().into())
                    .collect(),
            },
            "AAAA" => ResourceData::AAAA {
                address: self
                    .data
                    .parse()
                    .with_context(|| format!("AAAA record '{}': bad address '{}'", self.name, self.data))?,
            },
            other => {
                let qtype: u16 = other
                    .strip_prefix("TYPE")
                    .and_then(|n| n.parse().ok())
                    .with_context(|| format!("record '{}': unsupported type '{}'", self.name, other))?;
                ResourceData::UNKNOWN {
                    qtype,
                    rdata: decode_hex(&self.data)
                        .with_context(|| format!("record '{}': bad hex rdata", self.name))?
                        .into(),
                }
            }
        };

        Ok(ResourceRecord {
            name: self.name.clone().into(),
            class: ironzone_lib::IN_CLASS,
            ttl: self.ttl,
            resource_data,
        })
    }

    /// True if `rr` carries the same record (name, type, data and TTL)
    pub fn matches_wire(&self, rr: &ResourceRecord<'_>) -> bool {
        let Ok(other) = ZoneRecord::from_wire(self.zone, self.serial, rr) else {
            return false;
        };
        self.name == other.name
            && self.rtype == other.rtype
            && self.data == other.data
            && self.aux == other.aux
            && self.ttl == other.ttl
    }

    pub fn record_type(&self) -> RecordType {
        match self.rtype.as_str() {
            "A" => RecordType::A,
            "NS" => RecordType::NS,
            "CNAME" => RecordType::CNAME,
            "PTR" => RecordType::PTR,
            "MX" => RecordType::MX,
            "TXT" => RecordType::TXT,
            "AAAA" => RecordType::AAAA,
            other => RecordType::UNKNOWN(
                other
                    .strip_prefix("TYPE")
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_default(),
            ),
        }
    }
}

fn decode_hex(data: &str) -> anyhow::Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        anyhow::bail!("odd number of hex digits");
    }
    (0..data.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(&data[idx..idx + 2], 16).context("invalid hex digit"))
        .collect()
}

impl Model for ZoneRecord {
    const NAME: &str = "ZoneRecord";

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64> {
        sqlx::query(
            "INSERT INTO rr (zone, name, type, data, aux, ttl, serial, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(self.zone)
        .bind(&self.name)
        .bind(&self.rtype)
        .bind(&self.data)
        .bind(self.aux)
        .bind(self.ttl)
        .bind(self.serial)
        .bind(self.active)
        .execute(connection)
        .await
        .context("error while inserting a record")
        .map(|result| result.rows_affected())
    }
}
