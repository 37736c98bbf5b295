//! Database transactions opened by a session.

use std::time::Instant;

use relmap_core::{Connection, Result, TransactionId};

/// An open transaction on the session's connection.
///
/// Consumed by [`commit`](Self::commit) or [`rollback`](Self::rollback), so a
/// finished transaction cannot be ended twice.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    started: Instant,
}

impl Transaction {
    #[tracing::instrument(level = "debug", skip(conn))]
    pub(crate) fn begin(conn: &dyn Connection) -> Result<Self> {
        conn.begin()?;
        let id = TransactionId::next();
        tracing::info!(transaction = %id, "Beginning transaction");
        Ok(Self {
            id,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[tracing::instrument(level = "debug", skip(self, conn), fields(transaction = %self.id))]
    pub(crate) fn commit(self, conn: &dyn Connection) -> Result<()> {
        conn.commit()?;
        tracing::info!(
            elapsed_ms = self.started.elapsed().as_millis(),
            "Committed transaction"
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, conn), fields(transaction = %self.id))]
    pub(crate) fn rollback(self, conn: &dyn Connection) -> Result<()> {
        conn.rollback()?;
        tracing::info!(
            elapsed_ms = self.started.elapsed().as_millis(),
            "Rolled back transaction"
        );
        Ok(())
    }
}
