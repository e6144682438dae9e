//! Scoped transaction runner.
//!
//! `in_tx` is the only way application code opens a write transaction: the
//! handle is lent to the closure and never escapes it. Commit on `Ok`,
//! rollback on `Err`; an sqlx transaction also rolls back on drop, which
//! covers panics and cancelled futures. Nested runners are not supported —
//! composition happens at the aggregate layer.

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};

/// The transaction context every repository function accepts.
pub type Tx = Transaction<'static, Postgres>;

pub async fn in_tx<T, F>(pool: &PgPool, f: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T>>,
{
    let mut tx = pool.begin().await.context("begin transaction")?;

    match f(&mut tx).await {
        Ok(val) => {
            tx.commit().await.context("commit transaction")?;
            Ok(val)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
