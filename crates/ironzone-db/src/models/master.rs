use anyhow::Context as _;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use super::Model;

/// One row of the `zone_masters` table: an upstream server a slave zone
/// is transferred from, in preference order.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ZoneMaster {
    pub id: u32,
    pub zone: u32,
    /// `host` or `host:port`; port 53 when omitted
    pub address: String,
    /// Name of the key in `tsig_keys` used to sign transfer requests
    pub tsig_key: Option<String>,
    pub last_check: Option<u32>,
    pub last_xfer: Option<u32>,
    /// Consecutive failed transfer attempts, reset on success
    pub transfer_failures: u32,
}

impl ZoneMaster {
    /// Resolvable `host:port` form of the address
    pub fn address_with_port(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // Bare IPv6 addresses get bracketed, everything else already
            // carries a port
            if self.address.parse::<std::net::Ipv6Addr>().is_ok() {
                return format!("[{}]:53", self.address);
            }
            self.address.clone()
        } else if self.address.starts_with('[') && !self.address.rsplit(']').next().unwrap_or("").contains(':') {
            format!("{}:53", self.address)
        } else if self.address.starts_with('[') {
            self.address.clone()
        } else {
            format!("{}:53", self.address)
        }
    }

    /// True if `ip` is this master's address. Only literal addresses can
    /// match; hostnames never do, so a NOTIFY from a master configured by
    /// name still has to wait for the refresh timer.
    pub fn matches_source(&self, ip: &std::net::IpAddr) -> bool {
        self.address_with_port()
            .parse::<std::net::SocketAddr>()
            .map(|addr| addr.ip() == *ip)
            .unwrap_or(false)
    }
}

impl Model for ZoneMaster {
    const NAME: &str = "ZoneMaster";

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64> {
        sqlx::query(
            "INSERT INTO zone_masters (zone, address, tsig_key, last_check, last_xfer, transfer_failures)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(self.zone)
        .bind(&self.address)
        .bind(&self.tsig_key)
        .bind(self.last_check)
        .bind(self.last_xfer)
        .bind(self.transfer_failures)
        .execute(connection)
        .await
        .context("error while inserting a zone master")
        .map(|result| result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(address: &str) -> ZoneMaster {
        ZoneMaster {
            id: 0,
            zone: 1,
            address: address.to_owned(),
            tsig_key: None,
            last_check: None,
            last_xfer: None,
            transfer_failures: 0,
        }
    }

    #[test]
    fn default_port_is_appended() {
        assert_eq!(master("192.0.2.1").address_with_port(), "192.0.2.1:53");
        assert_eq!(master("192.0.2.1:5353").address_with_port(), "192.0.2.1:5353");
        assert_eq!(master("master.example.com").address_with_port(), "master.example.com:53");
        assert_eq!(master("2001:db8::1").address_with_port(), "[2001:db8::1]:53");
        assert_eq!(master("[2001:db8::1]:5353").address_with_port(), "[2001:db8::1]:5353");
    }

    #[test]
    fn literal_sources_match_but_hostnames_do_not() {
        let ip: std::net::IpAddr = "192.0.2.1".parse().unwrap();
        assert!(master("192.0.2.1").matches_source(&ip));
        assert!(master("192.0.2.1:5353").matches_source(&ip));
        assert!(!master("192.0.2.2").matches_source(&ip));
        assert!(!master("master.example.com").matches_source(&ip));
    }
}
