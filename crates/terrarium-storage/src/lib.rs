//! DuckDB-backed snapshot port for Terrarium.
//!
//! Saves are transactional delete-and-insert passes, so a reader never
//! observes a partially written snapshot and the latest writer always
//! wins. Event appends are buffered and flushed on a threshold, on
//! demand, and on drop.

use duckdb::{Connection, params};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use terrarium_core::{
    Cell, DisplayColor, Marker, RobotId, RobotRecord, SnapshotError, SnapshotPort, TerritoryCell,
    Tick,
};
use thiserror::Error;
use tracing::warn;

const DEFAULT_EVENT_BUFFER: usize = 64;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StorageError> for SnapshotError {
    fn from(err: StorageError) -> Self {
        SnapshotError::backend(err)
    }
}

/// DuckDB-backed snapshot store with buffered event writes.
pub struct Storage {
    conn: Connection,
    event_buffer: Vec<(i64, String)>,
    event_flush_threshold: usize,
    event_seq: i64,
}

impl Storage {
    /// Open or create a database at `path` with default buffering.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, DEFAULT_EVENT_BUFFER)
    }

    /// Open an in-memory database (used by tests and demos).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?, DEFAULT_EVENT_BUFFER)
    }

    /// Open with an explicit event flush threshold.
    pub fn with_event_threshold(path: &str, threshold: usize) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, threshold.max(1))
    }

    fn from_connection(conn: Connection, threshold: usize) -> Result<Self, StorageError> {
        let mut storage = Self {
            conn,
            event_buffer: Vec::new(),
            event_flush_threshold: threshold,
            event_seq: 0,
        };
        storage.initialize_schema()?;
        storage.event_seq = storage.max_event_seq()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists robots (
                id bigint primary key,
                name text,
                icon text,
                color text,
                x integer,
                y integer,
                energy integer,
                age bigint,
                max_energy integer
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists territory (
                x integer,
                y integer,
                owner bigint,
                owner_name text,
                owner_color text,
                claimed_at bigint,
                strength bigint,
                siege_by bigint,
                siege_progress bigint,
                primary key (x, y)
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists markers (
                seq bigint primary key,
                x integer,
                y integer,
                symbol text,
                color text,
                placed_at bigint
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists events (
                seq bigint primary key,
                tick bigint,
                message text
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists meta (
                key text primary key,
                value bigint
            )",
            [],
        )?;
        self.conn.execute(
            "insert into meta (key, value)
             select 'tick_count', 0
             where not exists (select 1 from meta where key = 'tick_count')",
            [],
        )?;
        Ok(())
    }

    fn max_event_seq(&mut self) -> Result<i64, StorageError> {
        let seq = self
            .conn
            .query_row("select coalesce(max(seq), 0) from events", [], |row| {
                row.get::<_, i64>(0)
            })?;
        Ok(seq)
    }

    fn parse_color(raw: &str) -> Result<DisplayColor, StorageError> {
        DisplayColor::from_str(raw).map_err(|err| StorageError::Corrupt(err.to_string()))
    }

    fn parse_icon(raw: &str) -> Result<char, StorageError> {
        raw.chars()
            .next()
            .ok_or_else(|| StorageError::Corrupt("empty icon".into()))
    }

    fn load_registry_rows(&mut self) -> Result<BTreeMap<RobotId, RobotRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select id, name, icon, color, x, y, energy, age, max_energy from robots order by id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, i32>(5)?,
                row.get::<_, i32>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i32>(8)?,
            ))
        })?;

        let mut registry = BTreeMap::new();
        for row in rows {
            let (id, name, icon, color, x, y, energy, age, max_energy) = row?;
            registry.insert(
                RobotId(id as u64),
                RobotRecord {
                    name,
                    icon: Self::parse_icon(&icon)?,
                    color: Self::parse_color(&color)?,
                    pos: Cell::new(x, y),
                    energy,
                    age: age as u32,
                    max_energy,
                },
            );
        }
        Ok(registry)
    }

    fn save_registry_rows(
        &mut self,
        registry: &BTreeMap<RobotId, RobotRecord>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("delete from robots", [])?;
        {
            let mut stmt = tx.prepare(
                "insert into robots (id, name, icon, color, x, y, energy, age, max_energy)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (id, record) in registry {
                stmt.execute(params![
                    id.0 as i64,
                    record.name,
                    record.icon.to_string(),
                    record.color.as_str(),
                    record.pos.x,
                    record.pos.y,
                    record.energy,
                    i64::from(record.age),
                    record.max_energy,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_territory_rows(&mut self) -> Result<BTreeMap<Cell, TerritoryCell>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select x, y, owner, owner_name, owner_color, claimed_at, strength,
                    siege_by, siege_progress
             from territory order by x, y",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;

        let mut territory = BTreeMap::new();
        for row in rows {
            let (x, y, owner, owner_name, owner_color, claimed_at, strength, siege_by, progress) =
                row?;
            territory.insert(
                Cell::new(x, y),
                TerritoryCell {
                    owner: RobotId(owner as u64),
                    owner_name,
                    owner_color: Self::parse_color(&owner_color)?,
                    claimed_at: Tick(claimed_at as u64),
                    strength: strength as u32,
                    siege_by: siege_by.map(|id| RobotId(id as u64)),
                    siege_progress: progress as u32,
                },
            );
        }
        Ok(territory)
    }

    fn save_territory_rows(
        &mut self,
        territory: &BTreeMap<Cell, TerritoryCell>,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("delete from territory", [])?;
        {
            let mut stmt = tx.prepare(
                "insert into territory (x, y, owner, owner_name, owner_color, claimed_at,
                                        strength, siege_by, siege_progress)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for (at, cell) in territory {
                stmt.execute(params![
                    at.x,
                    at.y,
                    cell.owner.0 as i64,
                    cell.owner_name,
                    cell.owner_color.as_str(),
                    cell.claimed_at.0 as i64,
                    i64::from(cell.strength),
                    cell.siege_by.map(|id| id.0 as i64),
                    i64::from(cell.siege_progress),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_marker_rows(&mut self) -> Result<Vec<Marker>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("select x, y, symbol, color, placed_at from markers order by seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i32>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut markers = Vec::new();
        for row in rows {
            let (x, y, symbol, color, placed_at) = row?;
            markers.push(Marker {
                at: Cell::new(x, y),
                symbol: Self::parse_icon(&symbol)?,
                color: Self::parse_color(&color)?,
                placed_at: Tick(placed_at as u64),
            });
        }
        Ok(markers)
    }

    fn save_marker_rows(&mut self, markers: &[Marker]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("delete from markers", [])?;
        {
            let mut stmt = tx.prepare(
                "insert into markers (seq, x, y, symbol, color, placed_at)
                 values (?, ?, ?, ?, ?, ?)",
            )?;
            for (seq, marker) in markers.iter().enumerate() {
                stmt.execute(params![
                    seq as i64,
                    marker.at.x,
                    marker.at.y,
                    marker.symbol.to_string(),
                    marker.color.as_str(),
                    marker.placed_at.0 as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn buffer_event(&mut self, tick: Tick, message: &str) -> Result<(), StorageError> {
        self.event_buffer.push((tick.0 as i64, message.to_string()));
        if self.event_buffer.len() >= self.event_flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered events out immediately.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.event_buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.event_buffer);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("insert into events (seq, tick, message) values (?, ?, ?)")?;
            for (tick, message) in &pending {
                self.event_seq += 1;
                stmt.execute(params![self.event_seq, tick, message])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The most recent `limit` event lines, oldest first.
    pub fn recent_events(&mut self, limit: usize) -> Result<Vec<(Tick, String)>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select tick, message from (
                 select seq, tick, message from events order by seq desc limit ?
             ) as recent order by seq",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (tick, message) = row?;
            events.push((Tick(tick as u64), message));
        }
        Ok(events)
    }

    fn read_tick_value(&mut self) -> Result<Tick, StorageError> {
        let value = self.conn.query_row(
            "select value from meta where key = 'tick_count'",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(Tick(value as u64))
    }

    fn increment_tick_value(&mut self) -> Result<Tick, StorageError> {
        self.conn
            .execute("update meta set value = value + 1 where key = 'tick_count'", [])?;
        self.read_tick_value()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush events on drop");
        }
    }
}

impl SnapshotPort for Storage {
    fn load_registry(&mut self) -> Result<BTreeMap<RobotId, RobotRecord>, SnapshotError> {
        self.load_registry_rows().map_err(Into::into)
    }

    fn save_registry(
        &mut self,
        registry: &BTreeMap<RobotId, RobotRecord>,
    ) -> Result<(), SnapshotError> {
        self.save_registry_rows(registry).map_err(Into::into)
    }

    fn load_territory(&mut self) -> Result<BTreeMap<Cell, TerritoryCell>, SnapshotError> {
        self.load_territory_rows().map_err(Into::into)
    }

    fn save_territory(
        &mut self,
        territory: &BTreeMap<Cell, TerritoryCell>,
    ) -> Result<(), SnapshotError> {
        self.save_territory_rows(territory).map_err(Into::into)
    }

    fn load_markers(&mut self) -> Result<Vec<Marker>, SnapshotError> {
        self.load_marker_rows().map_err(Into::into)
    }

    fn save_markers(&mut self, markers: &[Marker]) -> Result<(), SnapshotError> {
        self.save_marker_rows(markers).map_err(Into::into)
    }

    fn append_event(&mut self, tick: Tick, message: &str) -> Result<(), SnapshotError> {
        self.buffer_event(tick, message).map_err(Into::into)
    }

    fn read_tick(&mut self) -> Result<Tick, SnapshotError> {
        self.read_tick_value().map_err(Into::into)
    }

    fn increment_tick(&mut self) -> Result<Tick, SnapshotError> {
        self.increment_tick_value().map_err(Into::into)
    }
}

/// Shared handle over a storage instance so an application can keep
/// querying (event tails, flushes) while the world owns the port.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<Mutex<Storage>>,
}

impl SharedStorage {
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    /// Clone of the shared handle for analytics queries.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<Storage>> {
        Arc::clone(&self.inner)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Storage) -> Result<R, StorageError>) -> Result<R, SnapshotError> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard).map_err(Into::into)
    }
}

impl SnapshotPort for SharedStorage {
    fn load_registry(&mut self) -> Result<BTreeMap<RobotId, RobotRecord>, SnapshotError> {
        self.with(Storage::load_registry_rows)
    }

    fn save_registry(
        &mut self,
        registry: &BTreeMap<RobotId, RobotRecord>,
    ) -> Result<(), SnapshotError> {
        self.with(|storage| storage.save_registry_rows(registry))
    }

    fn load_territory(&mut self) -> Result<BTreeMap<Cell, TerritoryCell>, SnapshotError> {
        self.with(Storage::load_territory_rows)
    }

    fn save_territory(
        &mut self,
        territory: &BTreeMap<Cell, TerritoryCell>,
    ) -> Result<(), SnapshotError> {
        self.with(|storage| storage.save_territory_rows(territory))
    }

    fn load_markers(&mut self) -> Result<Vec<Marker>, SnapshotError> {
        self.with(Storage::load_marker_rows)
    }

    fn save_markers(&mut self, markers: &[Marker]) -> Result<(), SnapshotError> {
        self.with(|storage| storage.save_marker_rows(markers))
    }

    fn append_event(&mut self, tick: Tick, message: &str) -> Result<(), SnapshotError> {
        self.with(|storage| storage.buffer_event(tick, message))
    }

    fn read_tick(&mut self) -> Result<Tick, SnapshotError> {
        self.with(Storage::read_tick_value)
    }

    fn increment_tick(&mut self) -> Result<Tick, SnapshotError> {
        self.with(Storage::increment_tick_value)
    }
}
