//! Chunked batch writes with resubmission of unprocessed items.

use treemeta_kv::{Item, PrimaryKey, TableClient, WriteRequest};

use crate::error::StoreResult;
use crate::retry::RetryInvoker;

const OPERATION: &str = "batchWrite";

/// Splits write sets into backend-sized batches and drives each batch until
/// the backend has processed all of it.
///
/// Whole-call failures go through the invoker's retry policy; a batch the
/// backend accepts only partially is resubmitted (remainder only) after an
/// exponential backoff, until nothing is left or the budget runs out.
pub struct BatchWriteExecutor<'a> {
    client: &'a dyn TableClient,
    invoker: &'a RetryInvoker,
    limit: usize,
}

impl<'a> BatchWriteExecutor<'a> {
    pub fn new(client: &'a dyn TableClient, invoker: &'a RetryInvoker, limit: usize) -> Self {
        Self {
            client,
            invoker,
            limit: limit.max(1),
        }
    }

    /// Write all deletions and puts, deletions first within each batch.
    /// Returns the number of requests written.
    pub async fn write(
        &self,
        keys_to_delete: Vec<PrimaryKey>,
        items_to_put: Vec<Item>,
    ) -> StoreResult<usize> {
        let total = keys_to_delete.len() + items_to_put.len();
        let mut deletes = keys_to_delete.into_iter();
        let mut puts = items_to_put.into_iter();
        let mut written = 0;

        while written < total {
            let mut chunk: Vec<WriteRequest> = Vec::with_capacity(self.limit);
            chunk.extend(deletes.by_ref().take(self.limit).map(WriteRequest::Delete));
            let room = self.limit - chunk.len();
            if room > 0 {
                chunk.extend(puts.by_ref().take(room).map(WriteRequest::Put));
            }
            written += chunk.len();
            self.write_chunk(chunk).await?;
        }

        tracing::trace!(
            "Wrote {} requests to table {} in batches of {}",
            written,
            self.invoker.table(),
            self.limit
        );
        Ok(written)
    }

    async fn write_chunk(&self, chunk: Vec<WriteRequest>) -> StoreResult<()> {
        let table = self.invoker.table();
        let mut outcome = self
            .invoker
            .retry(OPERATION, table, true, || {
                self.client.batch_write(table, chunk.clone())
            })
            .await?;

        let mut retry_count = 0;
        while !outcome.unprocessed.is_empty() {
            let unprocessed = std::mem::take(&mut outcome.unprocessed);
            self.invoker
                .backoff_unprocessed(OPERATION, table, retry_count, unprocessed.len())
                .await?;
            retry_count += 1;
            outcome = self
                .invoker
                .retry(OPERATION, table, true, || {
                    self.client.batch_write(table, unprocessed.clone())
                })
                .await?;
        }
        Ok(())
    }
}
