use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ironzone_db::{MemoryStore, SqliteStore, ZoneStore as _};
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinSet;

use crate::transfer_logger::TransferLogger;
use crate::{Args, Scheduler, State, TransferAcl, XferServer};

pub struct App;

impl App {
    pub async fn run_until_completion(args: Args) -> anyhow::Result<()> {
        let bind_addr = SocketAddr::new(args.host, args.port);

        let db = SqliteStore::new(&args.db_path)
            .await
            .context("failed to establish an SQLite DB connection")?;

        // Serve from memory, with the database as the durable copy
        let cache = MemoryStore::new();
        preload_cache(&db, &cache).await.context("failed to preload zones")?;

        let acl = TransferAcl::parse(&args.allow_transfer).context("failed to parse the transfer ACL")?;
        if acl.is_empty() {
            tracing::warn!("transfer ACL is empty, every transfer request will be refused");
        }

        // Channel for transfer logs
        let (log_tx, log_rx) = unbounded_channel();
        let transfer_logger = TransferLogger::new(log_rx, db.clone());

        let state = Arc::new(State {
            db,
            cache,
            acl,
            require_tsig: args.require_tsig,
            log_tx,
            max_inbound_transfer_size: args.max_inbound_transfer_size,
        });

        let (notify_tx, notify_rx) = unbounded_channel();
        let mut server = XferServer::new(bind_addr, state.clone(), notify_tx)
            .await
            .context("failed to instantiate the transfer server")?;

        let mut tasks = JoinSet::new();
        server.add_workers(args.max_parallel_connections).await;
        tasks.spawn(async move { server.block_until_completion().await });
        tasks.spawn(transfer_logger.watch_for_logs());
        if !args.disable_scheduler {
            let scheduler = Scheduler::new(state, Duration::from_secs(args.check_interval), notify_rx);
            tasks.spawn(scheduler.run());
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result.context("failed to execute a task")? {
                tracing::debug!("Error: {:#}", e);
            }
        }

        Ok(())
    }
}

/// Loads every zone the database knows about into the in-memory store
async fn preload_cache(db: &SqliteStore, cache: &MemoryStore) -> anyhow::Result<()> {
    let zones = db.load_zones().await?;
    for zone in &zones {
        let records = db
            .load_records(&zone.origin)
            .await
            .with_context(|| format!("loading records of zone '{}'", zone.origin))?;
        cache
            .replace_zone(&zone.to_wire(), &records)
            .await
            .with_context(|| format!("caching zone '{}'", zone.origin))?;
    }
    tracing::info!("loaded {} zones from the database", zones.len());
    Ok(())
}
