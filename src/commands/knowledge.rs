use std::path::Path;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consistency::{RepairReport, SweepReport};
use crate::db::models::{File, FileFilter};
use crate::doc_processor;
use crate::{AppState, Error, Result};

/// Store a document in two phases: metadata, then content. If attaching the
/// content fails the metadata row is removed again.
pub fn upload_document(
    state: &AppState,
    name: &str,
    media_type: Option<&str>,
    content: &[u8],
) -> Result<File> {
    let media_type = media_type
        .or_else(|| doc_processor::media_type_for(Path::new(name)))
        .ok_or_else(|| Error::InvalidInput(format!("unsupported document type: {name}")))?;

    let file = state
        .db
        .insert_file_metadata(name, media_type, Some(content.len() as i64))?;
    match state.db.attach_file_content(&file.id, content) {
        Ok(true) => {}
        Ok(false) => {
            discard_upload(state, &file.id);
            return Err(Error::NotFound(file.id));
        }
        Err(e) => {
            discard_upload(state, &file.id);
            return Err(e.into());
        }
    }

    info!(file_id = %file.id, name, size = content.len(), "document uploaded");
    state
        .db
        .get_file(&file.id)?
        .ok_or_else(|| Error::NotFound(file.id.clone()))
}

fn discard_upload(state: &AppState, file_id: &str) {
    if let Err(e) = state.db.delete_files(&[file_id.to_string()]) {
        error!(file_id, error = %e, "failed to remove incomplete upload");
    }
}

/// Read a document from disk and upload it.
pub fn upload_document_from_path(state: &AppState, path: &Path) -> Result<File> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let content = std::fs::read(path)?;
    upload_document(state, &name, None, &content)
}

/// Chunk and embed a stored document.
pub async fn store_embeddings(state: &AppState, uuid: &str) -> Result<String> {
    state.ingestion.ingest(uuid).await?;
    Ok("Embeddings stored successfully!".to_string())
}

/// Remove every stored chunk.
pub fn delete_embeddings(state: &AppState) -> Result<String> {
    state.consistency.delete_all_embeddings()?;
    Ok("Success!".to_string())
}

pub fn list_documents(state: &AppState) -> Result<Vec<File>> {
    Ok(state.db.list_files()?)
}

pub fn download_document(state: &AppState, id: &str) -> Result<(File, Vec<u8>)> {
    let file = state
        .db
        .get_file(id)?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    let content = state
        .db
        .get_file_content(id)?
        .ok_or_else(|| Error::NotFound(format!("content of {id}")))?;
    Ok((file, content))
}

pub fn delete_document(state: &AppState, id: &str) -> Result<()> {
    if !state.consistency.delete_file(id)? {
        return Err(Error::NotFound(id.to_string()));
    }
    Ok(())
}

pub fn delete_documents(state: &AppState, filter: &FileFilter) -> Result<usize> {
    Ok(state.consistency.delete_files(filter)?)
}

pub fn sweep_orphans(state: &AppState) -> Result<SweepReport> {
    Ok(state.consistency.sweep_orphans()?)
}

pub fn repair_chunk_references(state: &AppState) -> Result<RepairReport> {
    Ok(state.consistency.repair_null_references()?)
}

/// Start the periodic orphan sweep. `every` overrides
/// `maintenance.sweep_interval_secs`.
pub fn start_orphan_sweeper(
    state: &AppState,
    every: Option<Duration>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = every
        .unwrap_or(Duration::from_secs(state.config.maintenance.sweep_interval_secs))
        .max(Duration::from_secs(1));
    info!(every_secs = every.as_secs(), "orphan sweeper started");
    state.consistency.clone().spawn_sweeper(every, cancel)
}
