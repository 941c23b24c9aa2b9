use anyhow::Context as _;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use super::Model;

/// One row of the `tsig_keys` table. The secret is stored base64-encoded.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TsigKeyRow {
    pub id: u32,
    pub name: String,
    pub algorithm: String,
    pub secret: String,
}

impl Model for TsigKeyRow {
    const NAME: &str = "TsigKeyRow";

    async fn bind_and_insert(&self, connection: &mut SqliteConnection) -> anyhow::Result<u64> {
        sqlx::query("INSERT INTO tsig_keys (name, algorithm, secret) VALUES (?1, ?2, ?3)")
            .bind(&self.name)
            .bind(&self.algorithm)
            .bind(&self.secret)
            .execute(connection)
            .await
            .context("error while inserting a TSIG key")
            .map(|result| result.rows_affected())
    }
}
