//! DuckDB-backed persistence for cellmesh: the flip/flop secondary store and the central
//! entity table, both driven by a dedicated worker thread.

#[cfg(target_os = "windows")]
#[link(name = "rstrtmgr")]
unsafe extern "system" {}

use cellmesh_core::{
    ActiveBuffer, CellError, CompletionSender, DbId, EntityDatabase, EntityTypeId, SecondaryRow,
    SecondaryStore, Tick, WriteCompletion, WriteRequest,
};
use duckdb::{Connection, Transaction, params};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ACTIVE_BUFFER_KEY: &str = "active_buffer";

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("storage worker error: {0}")]
    Worker(String),
    #[error("encoding error: {0}")]
    Encode(String),
}

impl From<StorageError> for CellError {
    fn from(err: StorageError) -> Self {
        CellError::Storage(err.to_string())
    }
}

/// Central entity row, as stored by the last successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub db_id: DbId,
    pub type_id: EntityTypeId,
    pub entity: u32,
    pub blob: Vec<u8>,
}

/// Owner of the DuckDB connection. Secondary rows are buffered until `commit`.
pub struct EntityStore {
    conn: Connection,
    active: ActiveBuffer,
    pending: Vec<SecondaryRow>,
}

impl EntityStore {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let mut store = Self {
            conn,
            active: ActiveBuffer::A,
            pending: Vec::new(),
        };
        store.initialize_schema()?;
        store.active = store.read_active_buffer()?;
        Ok(store)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        for buffer in [ActiveBuffer::A, ActiveBuffer::B] {
            self.conn.execute(
                &format!(
                    "create table if not exists {} (
                        db_id bigint not null,
                        type_id integer not null,
                        tick bigint not null,
                        blob blob not null
                    )",
                    buffer.table_name()
                ),
                [],
            )?;
        }
        self.conn.execute(
            "create table if not exists meta (
                key text primary key,
                value text not null
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists entities (
                db_id bigint primary key,
                type_id integer not null,
                entity_id bigint not null,
                blob blob not null
            )",
            [],
        )?;
        self.conn.execute(
            "insert or ignore into meta (key, value) values (?, ?)",
            params![ACTIVE_BUFFER_KEY, ActiveBuffer::A.as_str()],
        )?;
        Ok(())
    }

    fn read_active_buffer(&self) -> Result<ActiveBuffer, StorageError> {
        let raw: String = self.conn.query_row(
            "select value from meta where key = ?",
            params![ACTIVE_BUFFER_KEY],
            |row| row.get(0),
        )?;
        ActiveBuffer::parse(&raw)
            .ok_or_else(|| StorageError::Encode(format!("unknown active buffer '{raw}'")))
    }

    /// Table currently receiving secondary rows.
    #[must_use]
    pub fn active_buffer(&self) -> ActiveBuffer {
        self.active
    }

    /// Queue a secondary row for the next commit.
    pub fn write_secondary(&mut self, row: SecondaryRow) {
        self.pending.push(row);
    }

    /// Rows buffered since the last commit.
    #[must_use]
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// Write buffered rows into the active table. With `should_flip`, the other table is
    /// cleared and becomes active afterwards; the table just committed stays intact.
    pub fn commit(&mut self, should_flip: bool) -> Result<(), StorageError> {
        let table = self.active.table_name();
        let next = self.active.flipped();
        let tx = self.conn.transaction()?;
        Self::insert_secondary(&tx, table, &self.pending)?;
        if should_flip {
            tx.execute(&format!("delete from {}", next.table_name()), [])?;
            tx.execute(
                "update meta set value = ? where key = ?",
                params![next.as_str(), ACTIVE_BUFFER_KEY],
            )?;
        }
        tx.commit()?;
        debug!(rows = self.pending.len(), table, flipped = should_flip, "secondary batch committed");
        self.pending.clear();
        if should_flip {
            self.active = next;
        }
        Ok(())
    }

    fn insert_secondary(
        tx: &Transaction<'_>,
        table: &str,
        rows: &[SecondaryRow],
    ) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(&format!(
            "insert into {table} (db_id, type_id, tick, blob) values (?, ?, ?, ?)"
        ))?;
        for row in rows {
            stmt.execute(params![
                db_id_column(row.db_id)?,
                i32::from(row.type_id.0),
                tick_column(row.tick)?,
                row.blob,
            ])?;
        }
        Ok(())
    }

    /// Upsert the central row for a persisted entity.
    pub fn write_entity(&mut self, request: &WriteRequest) -> Result<(), StorageError> {
        if !request.db_id.is_persisted() {
            return Err(StorageError::Encode(format!(
                "entity {} has no database id",
                request.entity
            )));
        }
        self.conn.execute(
            "insert or replace into entities (db_id, type_id, entity_id, blob) values (?, ?, ?, ?)",
            params![
                db_id_column(request.db_id)?,
                i32::from(request.type_id.0),
                i64::from(request.entity.0),
                request.blob,
            ],
        )?;
        Ok(())
    }

    /// Number of committed rows in `buffer`.
    pub fn secondary_count(&self, buffer: ActiveBuffer) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            &format!("select count(*) from {}", buffer.table_name()),
            [],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|err| StorageError::Encode(err.to_string()))
    }

    /// Latest secondary blob for `db_id` across both tables.
    pub fn latest_secondary(&self, db_id: DbId) -> Result<Option<(Tick, Vec<u8>)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select tick, blob from (
                select tick, blob from entities_a where db_id = ?
                union all
                select tick, blob from entities_b where db_id = ?
             ) order by tick desc limit 1",
        )?;
        let id = db_id_column(db_id)?;
        let mut rows = stmt.query(params![id, id])?;
        match rows.next()? {
            Some(row) => {
                let tick: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let tick = u64::try_from(tick).map_err(|err| StorageError::Encode(err.to_string()))?;
                Ok(Some((Tick(tick), blob)))
            }
            None => Ok(None),
        }
    }

    pub fn load_entity(&self, db_id: DbId) -> Result<Option<StoredEntity>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select type_id, entity_id, blob from entities where db_id = ?")?;
        let mut rows = stmt.query(params![db_id_column(db_id)?])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let type_id: i32 = row.get(0)?;
        let entity: i64 = row.get(1)?;
        let blob: Vec<u8> = row.get(2)?;
        Ok(Some(StoredEntity {
            db_id,
            type_id: EntityTypeId(
                u16::try_from(type_id).map_err(|err| StorageError::Encode(err.to_string()))?,
            ),
            entity: u32::try_from(entity).map_err(|err| StorageError::Encode(err.to_string()))?,
            blob,
        }))
    }

    pub fn entity_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("select count(*) from entities", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|err| StorageError::Encode(err.to_string()))
    }
}

impl Drop for EntityStore {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(err) = self.commit(false) {
            error!(error = %err, rows = self.pending.len(), "secondary rows lost on close");
        }
    }
}

fn db_id_column(db_id: DbId) -> Result<i64, StorageError> {
    i64::try_from(db_id.0).map_err(|_| StorageError::Encode(format!("db id {} out of range", db_id.0)))
}

fn tick_column(tick: Tick) -> Result<i64, StorageError> {
    i64::try_from(tick.0).map_err(|_| StorageError::Encode(format!("tick {} out of range", tick.0)))
}

#[derive(Debug)]
enum StorageCommand {
    Secondary(SecondaryRow),
    Commit { flip: bool },
    Write {
        request: WriteRequest,
        completions: CompletionSender,
    },
    Shutdown,
}

/// Owner of the storage worker thread. The connection lives on the worker; everything else
/// talks to it through [`StorageHandle`]s, and database write outcomes come back through the
/// process's completion queue.
pub struct StoragePipeline {
    tx: mpsc::Sender<StorageCommand>,
    worker: Option<thread::JoinHandle<EntityStore>>,
}

impl StoragePipeline {
    /// Open `path` and start the worker.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_store(EntityStore::open(path)?)
    }

    pub fn from_store(store: EntityStore) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel::<StorageCommand>();
        let worker = thread::Builder::new()
            .name("cellmesh-storage-worker".into())
            .spawn(move || run_worker(store, &rx))
            .map_err(|err| {
                StorageError::Worker(format!("failed to spawn storage worker thread: {err}"))
            })?;
        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    /// Enqueue-only handle usable as both the secondary store and the entity database.
    #[must_use]
    pub fn handle(&self) -> StorageHandle {
        StorageHandle {
            tx: self.tx.clone(),
        }
    }

    /// Finish queued commands, stop the worker and hand back the store.
    pub fn close(mut self) -> Result<EntityStore, StorageError> {
        let _ = self.tx.send(StorageCommand::Shutdown);
        let worker = self
            .worker
            .take()
            .ok_or_else(|| StorageError::Worker("storage worker already joined".into()))?;
        worker
            .join()
            .map_err(|_| StorageError::Worker("storage worker thread panicked".into()))
    }
}

impl Drop for StoragePipeline {
    fn drop(&mut self) {
        let _ = self.tx.send(StorageCommand::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("storage worker thread panicked");
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    fn send(&self, command: StorageCommand) -> Result<(), CellError> {
        self.tx
            .send(command)
            .map_err(|_| StorageError::Worker("storage worker has stopped".into()).into())
    }
}

fn run_worker(mut store: EntityStore, rx: &mpsc::Receiver<StorageCommand>) -> EntityStore {
    while let Ok(command) = rx.recv() {
        match command {
            StorageCommand::Secondary(row) => store.write_secondary(row),
            StorageCommand::Commit { flip } => {
                if let Err(err) = store.commit(flip) {
                    warn!(error = %err, "secondary commit failed");
                }
            }
            StorageCommand::Write {
                request,
                completions,
            } => {
                let result = store
                    .write_entity(&request)
                    .map_err(|err| CellError::WriteFailed {
                        entity: request.entity,
                        reason: err.to_string(),
                    });
                if let Err(err) = &result {
                    warn!(entity = %request.entity, error = %err, "entity write failed");
                }
                if !completions.complete(WriteCompletion::for_request(&request, result)) {
                    debug!(entity = %request.entity, "completion dropped; process gone");
                }
            }
            StorageCommand::Shutdown => break,
        }
    }
    info!(pending = store.pending_rows(), "storage worker stopping");
    store
}

impl SecondaryStore for StorageHandle {
    fn write_entity(&mut self, row: SecondaryRow) -> Result<(), CellError> {
        self.send(StorageCommand::Secondary(row))
    }

    fn commit(&mut self, should_flip: bool) -> Result<(), CellError> {
        self.send(StorageCommand::Commit { flip: should_flip })
    }
}

impl EntityDatabase for StorageHandle {
    fn write_entity(
        &mut self,
        request: WriteRequest,
        completions: CompletionSender,
    ) -> Result<(), CellError> {
        self.send(StorageCommand::Write {
            request,
            completions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmesh_core::{EntityId, WritePurpose, WriteTicket};

    fn row(db_id: u64, tick: u64) -> SecondaryRow {
        SecondaryRow {
            db_id: DbId(db_id),
            type_id: EntityTypeId(2),
            tick: Tick(tick),
            blob: vec![db_id as u8, tick as u8],
        }
    }

    #[test]
    fn commit_writes_the_active_table_and_flip_clears_the_other() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = EntityStore::open_in_memory()?;
        assert_eq!(store.active_buffer(), ActiveBuffer::A);
        store.write_secondary(row(1, 1));
        store.write_secondary(row(2, 1));
        store.commit(true)?;
        assert_eq!(store.secondary_count(ActiveBuffer::A)?, 2);
        assert_eq!(store.active_buffer(), ActiveBuffer::B);

        store.write_secondary(row(1, 5));
        store.commit(false)?;
        assert_eq!(store.secondary_count(ActiveBuffer::B)?, 1);
        assert_eq!(store.secondary_count(ActiveBuffer::A)?, 2);
        assert_eq!(store.latest_secondary(DbId(1))?, Some((Tick(5), vec![1, 5])));

        store.commit(true)?;
        assert_eq!(store.active_buffer(), ActiveBuffer::A);
        assert_eq!(store.secondary_count(ActiveBuffer::A)?, 0);
        assert_eq!(store.secondary_count(ActiveBuffer::B)?, 1);
        Ok(())
    }

    #[test]
    fn central_rows_are_upserted() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = EntityStore::open_in_memory()?;
        let mut request = WriteRequest {
            ticket: WriteTicket(1),
            entity: EntityId(4),
            db_id: DbId(40),
            type_id: EntityTypeId(3),
            purpose: WritePurpose::Archive,
            blob: vec![1],
        };
        store.write_entity(&request)?;
        request.blob = vec![2, 2];
        store.write_entity(&request)?;
        assert_eq!(store.entity_count()?, 1);
        let stored = store.load_entity(DbId(40))?.expect("row");
        assert_eq!(stored.blob, vec![2, 2]);
        assert_eq!(stored.entity, 4);
        assert_eq!(stored.type_id, EntityTypeId(3));
        assert!(store.load_entity(DbId(41))?.is_none());
        Ok(())
    }

    #[test]
    fn unpersisted_entities_are_refused() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = EntityStore::open_in_memory()?;
        let request = WriteRequest {
            ticket: WriteTicket(1),
            entity: EntityId(4),
            db_id: DbId::NONE,
            type_id: EntityTypeId(0),
            purpose: WritePurpose::Shutdown,
            blob: Vec::new(),
        };
        assert!(matches!(store.write_entity(&request), Err(StorageError::Encode(_))));
        Ok(())
    }
}
