use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ironzone_db::{SlaveZone, TransferLog, ZoneMaster};
use ironzone_tsig::{TsigAlgorithm, TsigKey};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use crate::notify::Notify;
use crate::xfr::{self, XferClientConfig};
use crate::State;

/// True if `remote` is ahead of `local` in serial number arithmetic
/// (RFC 1982)
fn serial_newer(remote: u32, local: u32) -> bool {
    remote != local && remote.wrapping_sub(local) < 1 << 31
}

/// Periodically walks the slave zones and pulls the ones whose refresh
/// timer ran out or whose master sent a NOTIFY
pub struct Scheduler {
    state: Arc<State>,
    check_interval: Duration,
    notify_rx: UnboundedReceiver<Notify>,
}

impl Scheduler {
    pub fn new(state: Arc<State>, check_interval: Duration, notify_rx: UnboundedReceiver<Notify>) -> Self {
        Scheduler {
            state,
            check_interval,
            notify_rx,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_due_zones().await {
                        tracing::warn!("zone maintenance pass failed: {:#}", e);
                    }
                }
                event = self.notify_rx.recv() => {
                    let Some(event) = event else {
                        // Server is gone
                        break;
                    };
                    if let Err(e) = self.handle_notify(event).await {
                        tracing::warn!("failed to act on a NOTIFY: {:#}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// One maintenance pass: check every master whose zone is due for a
    /// refresh
    async fn check_due_zones(&self) -> anyhow::Result<()> {
        let zones = self.state.db.load_slave_zones().await?;
        let now = xfr::unix_time()? as u32;

        for zone in &zones {
            for master in &zone.masters {
                let due = master
                    .last_check
                    .map(|last_check| now.saturating_sub(last_check) >= zone.soa.refresh)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                // Masters are tried in preference order: once one answers
                // the rest are left alone until the next refresh
                if self.check_master(zone, master).await {
                    break;
                }
            }
        }

        Ok(())
    }

    /// A NOTIFY skips the refresh timer, but only when it came from a
    /// configured master of the zone (RFC 1996 §3.10)
    async fn handle_notify(&self, event: Notify) -> anyhow::Result<()> {
        let origin = ironzone_db::normalize_origin(&event.origin);
        let zones = self.state.db.load_slave_zones().await?;
        let Some(zone) = zones.iter().find(|zone| zone.soa.origin == origin) else {
            tracing::debug!(origin, "ignoring a NOTIFY for a zone without masters");
            return Ok(());
        };

        let source = event.source.ip();
        let Some(master) = zone.masters.iter().find(|master| master.matches_source(&source)) else {
            tracing::warn!(origin, %source, "ignoring a NOTIFY from a host that is not a configured master");
            return Ok(());
        };

        self.check_master(zone, master).await;
        Ok(())
    }

    /// Queries one master for the zone's serial and transfers the zone if
    /// the master is ahead. Returns whether the master answered at all.
    async fn check_master(&self, zone: &SlaveZone, master: &ZoneMaster) -> bool {
        let origin = zone.soa.origin.as_str();
        let address = master.address_with_port();

        let config = match self.client_config(master).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(origin, address, "cannot build a transfer config: {:#}", e);
                return false;
            }
        };

        let remote_serial = match xfr::check_serial(origin, &address, &config).await {
            Ok(Some(serial)) => serial,
            Ok(None) => {
                tracing::debug!(origin, address, "master reported an error on the SOA check");
                self.touch_master(master, false).await;
                return true;
            }
            Err(e) => {
                tracing::warn!(origin, address, "SOA check failed: {}", e);
                return false;
            }
        };

        if !serial_newer(remote_serial, zone.soa.serial) {
            tracing::debug!(origin, address, serial = zone.soa.serial, "zone is up to date");
            self.touch_master(master, false).await;
            return true;
        }

        tracing::info!(
            origin,
            address,
            local_serial = zone.soa.serial,
            remote_serial,
            "zone is stale, starting a transfer"
        );
        let local_soa = zone.soa.to_wire();
        let incremental =
            xfr::try_incremental_transfer(origin, &address, &local_soa, &config, self.state.as_ref()).await;
        let result = match incremental {
            Ok(xfr::IxfrResponse::Applied(outcome)) => Ok(("ixfr-in", outcome)),
            Ok(xfr::IxfrResponse::UpToDate) => {
                tracing::debug!(origin, address, "master answered the IXFR query with our own serial");
                self.touch_master(master, false).await;
                return true;
            }
            other => {
                if let Err(e) = other {
                    tracing::debug!(origin, address, "incremental transfer failed, retrying in full: {}", e);
                }
                xfr::transfer_zone(origin, &address, &config, self.state.as_ref())
                    .await
                    .map(|outcome| ("axfr-in", outcome))
            }
        };
        match result {
            Ok((kind, outcome)) => {
                tracing::info!(
                    origin,
                    kind,
                    serial = outcome.new_serial,
                    records = outcome.records_received,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "zone transferred"
                );
                self.log_transfer(origin, kind, Some(&outcome), "success").await;
                self.touch_master(master, true).await;
                self.note_result(master, true).await;
            }
            Err(e) => {
                tracing::warn!(origin, address, "zone transfer failed: {}", e);
                self.log_transfer(origin, "axfr-in", None, e.status()).await;
                self.note_result(master, false).await;
            }
        }
        true
    }

    /// Loads the master's TSIG key, if it has one configured
    async fn client_config(&self, master: &ZoneMaster) -> anyhow::Result<XferClientConfig> {
        let tsig_key = match master.tsig_key.as_deref() {
            Some(name) => {
                let row = self
                    .state
                    .db
                    .load_tsig_key(name)
                    .await?
                    .with_context(|| format!("TSIG key '{}' is not in the key table", name))?;
                let algorithm = TsigAlgorithm::from_name(&row.algorithm)
                    .with_context(|| format!("key '{}' uses an unknown algorithm '{}'", row.name, row.algorithm))?;
                Some(TsigKey::new(&row.name, algorithm, &row.secret)?)
            }
            None => None,
        };
        Ok(XferClientConfig {
            max_total_bytes: self.state.max_inbound_transfer_size,
            tsig_key,
            ..XferClientConfig::default()
        })
    }

    async fn touch_master(&self, master: &ZoneMaster, transferred: bool) {
        let now = match xfr::unix_time() {
            Ok(now) => now as u32,
            Err(_) => return,
        };
        if let Err(e) = self.state.db.touch_master(master.id, now, transferred).await {
            tracing::warn!("failed to update a master's check timestamp: {:#}", e);
        }
    }

    async fn note_result(&self, master: &ZoneMaster, success: bool) {
        if let Err(e) = self.state.db.note_transfer_result(master.id, success).await {
            tracing::warn!("failed to update a master's failure counter: {:#}", e);
        }
    }

    async fn log_transfer(&self, origin: &str, kind: &str, outcome: Option<&xfr::XferOutcome>, status: &str) {
        let (serial, records, added, updated, deleted, duration_ms) = match outcome {
            Some(outcome) => (
                outcome.new_serial,
                outcome.records_received as u32,
                outcome.records_added as u32,
                outcome.records_updated as u32,
                outcome.records_deleted as u32,
                outcome.duration.as_millis() as u32,
            ),
            None => (0, 0, 0, 0, 0, 0),
        };
        match TransferLog::new(origin, kind, None, serial, records, duration_ms, status) {
            Ok(log) => self.state.record_transfer(log.with_changes(added, updated, deleted)),
            Err(e) => tracing::debug!("failed to build a transfer log entry: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_comparison_wraps_around() {
        assert!(serial_newer(2, 1));
        assert!(!serial_newer(1, 2));
        assert!(!serial_newer(5, 5));
        // RFC 1982 wrap-around
        assert!(serial_newer(5, u32::MAX - 5));
        assert!(!serial_newer(u32::MAX - 5, 5));
    }
}
