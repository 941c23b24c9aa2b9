mod master;
mod record;
mod soa;
mod transfer_log;
mod tsig_key;

use anyhow::Context as _;
pub use master::ZoneMaster;
pub use record::ZoneRecord;
use serde::Serialize;
pub use soa::Soa;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, SqliteConnection};
pub use transfer_log::TransferLog;
pub use tsig_key::TsigKeyRow;

pub trait Model: Serialize + for<'a> FromRow<'a, SqliteRow> {
    const NAME: &str;

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64>;

    async fn insert_into(&self, connection: &mut SqliteConnection) -> anyhow::Result<()> {
        let affected_rows = self
            .bind_and_insert(connection)
            .await
            .with_context(|| format!("error while inserting a {}", Self::NAME))?;

        if affected_rows != 1 {
            anyhow::bail!(
                "error while inserting a {}: wrong number of inserted rows {}",
                Self::NAME,
                affected_rows
            )
        }

        Ok(())
    }
}
