use super::models::{DocumentChunk, File, FileFilter, NewChunk};
use super::{now_timestamp, Database, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

const FILE_COLUMNS: &str =
    "id, name, media_type, size, content IS NOT NULL, created_at";
const CHUNK_COLUMNS: &str =
    "id, file_id, text_chunk, metadata_column, page, embedding, created_at";

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        name: row.get(1)?,
        media_type: row.get(2)?,
        size: row.get(3)?,
        has_content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<DocumentChunk> {
    Ok(DocumentChunk {
        id: row.get(0)?,
        file_id: row.get(1)?,
        text: row.get(2)?,
        source: row.get(3)?,
        page: row.get(4)?,
        embedding: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Database {
    // ── Files ──

    /// First phase of file creation: metadata only, content still NULL.
    pub fn insert_file_metadata(
        &self,
        name: &str,
        media_type: &str,
        size: Option<i64>,
    ) -> Result<File> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO files (id, name, media_type, size, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, media_type, size, now_timestamp()],
        )?;
        let file = conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
            params![id],
            row_to_file,
        )?;
        Ok(file)
    }

    /// Second phase of file creation. Returns false if the file does not exist.
    pub fn attach_file_content(&self, id: &str, content: &[u8]) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE files SET content = ?1, size = ?2 WHERE id = ?3",
            params![content, content.len() as i64, id],
        )?;
        Ok(updated == 1)
    }

    pub fn get_file(&self, id: &str) -> Result<Option<File>> {
        let conn = self.lock()?;
        let file = conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    /// Binary content of a file; `None` when the file or its content is missing.
    pub fn get_file_content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let content: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT content FROM files WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.flatten())
    }

    pub fn list_files(&self) -> Result<Vec<File>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_file)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn find_file_ids(&self, filter: &FileFilter) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let (sql, args): (String, Vec<String>) = match filter {
            FileFilter::All => ("SELECT id FROM files".into(), vec![]),
            FileFilter::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(vec![]);
                }
                (
                    format!("SELECT id FROM files WHERE id IN ({})", placeholders(ids.len())),
                    ids.clone(),
                )
            }
            FileFilter::Name(name) => (
                "SELECT id FROM files WHERE name = ?1".into(),
                vec![name.clone()],
            ),
            FileFilter::MediaType(media_type) => (
                "SELECT id FROM files WHERE media_type = ?1".into(),
                vec![media_type.clone()],
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = args.iter().map(|a| a as &dyn ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn live_file_ids(&self) -> Result<HashSet<String>> {
        Ok(self.find_file_ids(&FileFilter::All)?.into_iter().collect())
    }

    pub fn delete_files(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let sql = format!("DELETE FROM files WHERE id IN ({})", placeholders(ids.len()));
        let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
        Ok(conn.execute(&sql, params.as_slice())?)
    }

    // ── Chunks ──

    /// Swaps the chunk set of a file in one transaction: chunks referencing the
    /// file id or carrying its name label are removed, then `chunks` inserted.
    pub fn replace_chunks(
        &self,
        file_id: &str,
        source: &str,
        chunks: &[NewChunk],
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM document_chunks WHERE file_id = ?1 OR metadata_column = ?2",
            params![file_id, source],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO document_chunks (id, file_id, text_chunk, metadata_column, page, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let now = now_timestamp();
            for chunk in chunks {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    file_id,
                    chunk.text,
                    source,
                    chunk.page,
                    chunk.embedding,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    /// Inserts a single chunk with an arbitrary parent reference.
    pub fn insert_chunk(
        &self,
        file_id: Option<&str>,
        source: &str,
        chunk: &NewChunk,
    ) -> Result<String> {
        let conn = self.lock()?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO document_chunks (id, file_id, text_chunk, metadata_column, page, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, file_id, chunk.text, source, chunk.page, chunk.embedding, now_timestamp()],
        )?;
        Ok(id)
    }

    pub fn list_chunks(&self) -> Result<Vec<DocumentChunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM document_chunks ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map([], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn chunks_for_file(&self, file_id: &str) -> Result<Vec<DocumentChunk>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM document_chunks WHERE file_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![file_id], row_to_chunk)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM document_chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn delete_chunks_for_files(&self, file_ids: &[String]) -> Result<usize> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        let sql = format!(
            "DELETE FROM document_chunks WHERE file_id IN ({})",
            placeholders(file_ids.len())
        );
        let params: Vec<&dyn ToSql> = file_ids.iter().map(|id| id as &dyn ToSql).collect();
        Ok(conn.execute(&sql, params.as_slice())?)
    }

    pub fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM document_chunks WHERE id = ?1")?;
            for id in chunk_ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn delete_all_chunks(&self) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM document_chunks", [])?)
    }

    /// Distinct source labels of chunks whose parent reference is NULL.
    pub fn null_reference_sources(&self) -> Result<Vec<(String, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT metadata_column, COUNT(*) FROM document_chunks WHERE file_id IS NULL GROUP BY metadata_column ORDER BY metadata_column",
        )?;
        let rows = stmt.query_map([], |row| {
            let count: i64 = row.get(1)?;
            Ok((row.get(0)?, count as usize))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sets the parent of every NULL-parent chunk labelled `source`.
    pub fn backfill_chunk_file_id(&self, source: &str, file_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE document_chunks SET file_id = ?1 WHERE file_id IS NULL AND metadata_column = ?2",
            params![file_id, source],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, page: Option<u32>) -> NewChunk {
        NewChunk {
            text: text.to_string(),
            page,
            embedding: vec![1, 0, 0, 0, 0, 0, 128, 63],
        }
    }

    #[test]
    fn two_phase_file_creation() {
        let db = Database::open_in_memory().unwrap();
        let file = db.insert_file_metadata("manual.pdf", "application/pdf", None).unwrap();
        assert!(!file.has_content);
        assert!(db.get_file_content(&file.id).unwrap().is_none());

        assert!(db.attach_file_content(&file.id, b"%PDF-1.4").unwrap());
        let file = db.get_file(&file.id).unwrap().unwrap();
        assert!(file.has_content);
        assert_eq!(file.size, Some(8));
        assert_eq!(db.get_file_content(&file.id).unwrap().unwrap(), b"%PDF-1.4");

        assert!(!db.attach_file_content("missing", b"x").unwrap());
    }

    #[test]
    fn replace_chunks_swaps_whole_set() {
        let db = Database::open_in_memory().unwrap();
        let file = db.insert_file_metadata("a.txt", "text/plain", None).unwrap();
        db.replace_chunks(&file.id, "a.txt", &[chunk("one", Some(1)), chunk("two", Some(1))])
            .unwrap();
        db.replace_chunks(&file.id, "a.txt", &[chunk("three", Some(2))]).unwrap();

        let chunks = db.chunks_for_file(&file.id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "three");
        assert_eq!(chunks[0].page, Some(2));
        assert_eq!(chunks[0].source, "a.txt");
    }

    #[test]
    fn replace_chunks_also_clears_label_matches() {
        let db = Database::open_in_memory().unwrap();
        let file = db.insert_file_metadata("a.txt", "text/plain", None).unwrap();
        db.insert_chunk(None, "a.txt", &chunk("stale", None)).unwrap();
        db.replace_chunks(&file.id, "a.txt", &[chunk("fresh", None)]).unwrap();
        let texts: Vec<String> = db.list_chunks().unwrap().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["fresh"]);
    }

    #[test]
    fn find_file_ids_by_filter() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_file_metadata("a.pdf", "application/pdf", None).unwrap();
        let b = db.insert_file_metadata("b.txt", "text/plain", None).unwrap();

        assert_eq!(db.find_file_ids(&FileFilter::All).unwrap().len(), 2);
        assert_eq!(
            db.find_file_ids(&FileFilter::Name("b.txt".into())).unwrap(),
            vec![b.id.clone()]
        );
        assert_eq!(
            db.find_file_ids(&FileFilter::MediaType("application/pdf".into())).unwrap(),
            vec![a.id.clone()]
        );
        assert_eq!(
            db.find_file_ids(&FileFilter::Ids(vec![a.id.clone(), "nope".into()])).unwrap(),
            vec![a.id]
        );
        assert!(db.find_file_ids(&FileFilter::Ids(vec![])).unwrap().is_empty());
    }

    #[test]
    fn null_reference_grouping_and_backfill() {
        let db = Database::open_in_memory().unwrap();
        db.insert_chunk(None, "a.pdf", &chunk("1", None)).unwrap();
        db.insert_chunk(None, "a.pdf", &chunk("2", None)).unwrap();
        db.insert_chunk(None, "b.pdf", &chunk("3", None)).unwrap();

        let groups = db.null_reference_sources().unwrap();
        assert_eq!(groups, vec![("a.pdf".to_string(), 2), ("b.pdf".to_string(), 1)]);

        assert_eq!(db.backfill_chunk_file_id("a.pdf", "file-a").unwrap(), 2);
        assert_eq!(db.null_reference_sources().unwrap().len(), 1);
    }
}
