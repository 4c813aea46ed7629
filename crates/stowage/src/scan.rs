use crate::connector::{Connector, EnumerationFilters};
use crate::db::{InventoryStore, Item, ScanStatistics};
use crate::error::{Result, StowageError};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const INSERT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub scan_id: String,
    pub items_added: usize,
    pub statistics: ScanStatistics,
}

/// Enumerate `root` on `connector` into a new scan.
///
/// Items are inserted in batches of [`INSERT_BATCH_SIZE`], each in its own
/// transaction. A cancelled or failed enumeration leaves the scan
/// incomplete; items already inserted stay queryable.
pub async fn scan_provider<D>(
    connector: &dyn Connector,
    store: &Arc<Mutex<D>>,
    root: &str,
    filters: &EnumerationFilters,
    cancel: &CancellationToken,
) -> Result<ScanOutcome>
where
    D: InventoryStore + Send,
{
    let provider_ids = vec![connector.provider_id().to_string()];
    let scan_id = lock(store).create_scan(&provider_ids)?;
    log::info!(
        "Scan {} started for {} at '{}'",
        scan_id,
        connector.provider_id(),
        root
    );

    let mut stream = connector.enumerate(root, filters, cancel.clone()).await?;
    let mut batch: Vec<Item> = Vec::with_capacity(INSERT_BATCH_SIZE);
    let mut items_added = 0;

    while let Some(next) = stream.next().await {
        let item = match next {
            Ok(item) => item,
            Err(e) => {
                if items_added + batch.len() > 0 {
                    log::warn!(
                        "Scan {} stopped after {} items: {}",
                        scan_id,
                        items_added + batch.len(),
                        e
                    );
                }
                if !batch.is_empty() {
                    items_added += lock(store).add_items(&scan_id, &batch)?;
                }
                return Err(e);
            }
        };

        batch.push(item);
        if batch.len() >= INSERT_BATCH_SIZE {
            items_added += lock(store).add_items(&scan_id, &batch)?;
            batch.clear();
            log::debug!("Scan {}: {} items stored", scan_id, items_added);
        }
    }

    if !batch.is_empty() {
        items_added += lock(store).add_items(&scan_id, &batch)?;
    }

    if cancel.is_cancelled() {
        return Err(StowageError::Cancelled);
    }

    let statistics = lock(store).complete_scan(&scan_id)?;
    log::info!(
        "Scan {} completed: {} items ({} files, {} folders)",
        scan_id,
        statistics.total_items,
        statistics.total_files,
        statistics.total_folders
    );

    Ok(ScanOutcome {
        scan_id,
        items_added,
        statistics,
    })
}

fn lock<D>(store: &Arc<Mutex<D>>) -> std::sync::MutexGuard<'_, D> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
