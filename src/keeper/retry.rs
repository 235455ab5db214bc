//! Retry queue drain.
//!
//! Failed work lands on a shared list; every keeper periodically pops a
//! bounded slice, re-processes the records it owns under the current
//! distribution, and puts the rest back for their owners.

use crate::coordination::{keys, CoordStore};
use crate::fleet::WorkSharder;
use crate::ingest::IngestionEngine;
use crate::models::RetryRecord;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_DRAIN_PER_TICK: usize = 100;

pub struct RetryDrainer {
    store: Arc<dyn CoordStore>,
    engine: Arc<IngestionEngine>,
    sharder: Arc<WorkSharder>,
    keeper_id: String,
}

impl RetryDrainer {
    pub fn new(
        store: Arc<dyn CoordStore>,
        engine: Arc<IngestionEngine>,
        sharder: Arc<WorkSharder>,
        keeper_id: String,
    ) -> Self {
        Self {
            store,
            engine,
            sharder,
            keeper_id,
        }
    }

    pub async fn drain_once(&self) -> Result<()> {
        let owned: Option<HashSet<String>> = self
            .sharder
            .load_current()
            .await?
            .and_then(|mut map| map.remove(&self.keeper_id))
            .map(|markets| markets.into_iter().collect());

        let mut foreign = Vec::new();
        let mut drained = 0usize;
        while drained < MAX_DRAIN_PER_TICK {
            let Some(bytes) = self.store.list_pop(keys::RETRY_QUEUE).await? else {
                break;
            };
            drained += 1;

            let record: RetryRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable retry record");
                    continue;
                }
            };

            // With no published distribution yet, a single keeper owns it all.
            let mine = owned
                .as_ref()
                .map_or(true, |set| set.contains(&record.market_id));
            if !mine {
                foreign.push(bytes);
                continue;
            }

            match self.engine.verse_of(&record.market_id) {
                Some(verse_id) => {
                    debug!(market = %record.market_id, "re-processing retried market");
                    self.engine
                        .update_verse(verse_id, Some(&record.market_id))
                        .await;
                }
                None => {
                    // Market not in our universe yet; the next full sync will
                    // cover it.
                    debug!(market = %record.market_id, "retry for unknown market dropped");
                }
            }
        }

        // Records owned by other keepers go back on the queue.
        for bytes in foreign {
            self.store.list_push(keys::RETRY_QUEUE, &bytes).await?;
        }
        Ok(())
    }
}
