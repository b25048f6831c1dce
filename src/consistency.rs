//! Keeps `document_chunks` in step with `files`: cascade deletes, orphan
//! sweeps and repair of chunks that lost their parent reference.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::models::FileFilter;
use crate::db::{Database, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub before: usize,
    pub after: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Chunks whose parent reference was backfilled.
    pub repaired: usize,
    /// Source labels with zero or several same-named files.
    pub unfixable: Vec<String>,
}

pub struct ConsistencyManager {
    db: Arc<Database>,
}

impl ConsistencyManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Delete one file and its chunks. Returns whether the file existed.
    pub fn delete_file(&self, file_id: &str) -> Result<bool> {
        let ids = vec![file_id.to_string()];
        self.cascade(&ids);
        Ok(self.db.delete_files(&ids)? > 0)
    }

    /// Delete every file matching `filter` together with its chunks.
    pub fn delete_files(&self, filter: &FileFilter) -> Result<usize> {
        let ids = self.db.find_file_ids(filter)?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.cascade(&ids);
        let deleted = self.db.delete_files(&ids)?;
        info!(deleted, "files deleted");
        Ok(deleted)
    }

    /// Chunk removal ahead of a file delete. Failures are logged; anything
    /// left behind is picked up by the orphan sweep.
    fn cascade(&self, file_ids: &[String]) {
        match self.db.delete_chunks_for_files(file_ids) {
            Ok(removed) => debug!(files = file_ids.len(), removed, "chunks cascaded"),
            Err(e) => error!(error = %e, files = file_ids.len(), "chunk cascade failed"),
        }
    }

    /// Delete chunks whose non-null parent is not a live file.
    pub fn sweep_orphans(&self) -> Result<SweepReport> {
        let chunks = self.db.list_chunks()?;
        let live = self.db.live_file_ids()?;
        let orphans: Vec<String> = chunks
            .iter()
            .filter(|c| c.file_id.as_ref().is_some_and(|id| !live.contains(id)))
            .map(|c| c.id.clone())
            .collect();

        let before = chunks.len();
        let deleted = self.db.delete_chunks(&orphans)?;
        let report = SweepReport {
            before,
            after: self.db.count_chunks()?,
            deleted,
        };
        if deleted > 0 {
            info!(before = report.before, after = report.after, deleted, "orphan chunks swept");
        } else {
            debug!(chunks = before, "no orphan chunks");
        }
        Ok(report)
    }

    /// Backfill null parent references where the source label names exactly
    /// one file.
    pub fn repair_null_references(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        for (source, count) in self.db.null_reference_sources()? {
            let matches = self.db.find_file_ids(&FileFilter::Name(source.clone()))?;
            match matches.as_slice() {
                [file_id] => {
                    report.repaired += self.db.backfill_chunk_file_id(&source, file_id)?;
                }
                _ => {
                    warn!(
                        source = %source,
                        chunks = count,
                        candidates = matches.len(),
                        "cannot repair chunk references"
                    );
                    report.unfixable.push(source);
                }
            }
        }
        if report.repaired > 0 {
            info!(repaired = report.repaired, "chunk references repaired");
        }
        Ok(report)
    }

    pub fn delete_all_embeddings(&self) -> Result<usize> {
        let deleted = self.db.delete_all_chunks()?;
        info!(deleted, "all embeddings deleted");
        Ok(deleted)
    }

    /// Run the orphan sweep every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Skip the first immediate tick.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_orphans() {
                            warn!(error = %e, "scheduled orphan sweep failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("orphan sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}
