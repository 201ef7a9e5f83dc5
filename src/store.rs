//! Append-only SQLite store for raw readings.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::pollutant::Pollutant;
use crate::reading::{RawReading, TimeRange};
use crate::source::{ReadingSource, SourceError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row in reading store: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    pub inserted: u64,
    pub already_present: u64,
    pub unparseable: u64,
}

/// Readings are keyed by (pollutant, location, observed_at) and never
/// updated once stored.
pub struct ReadingStore {
    conn: Connection,
}

impl ReadingStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS readings (
                pollutant TEXT NOT NULL,
                location TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                ts_ms_utc INTEGER NOT NULL,
                value REAL NOT NULL,
                unit TEXT NOT NULL,
                UNIQUE (pollutant, location, observed_at)
            );
            CREATE INDEX IF NOT EXISTS readings_pollutant_ts
                ON readings (pollutant, ts_ms_utc);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn insert_readings(&mut self, readings: &[RawReading]) -> Result<InsertReport, StoreError> {
        let mut report = InsertReport::default();
        if readings.is_empty() {
            return Ok(report);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO readings (
                    pollutant,
                    location,
                    observed_at,
                    ts_ms_utc,
                    value,
                    unit
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;

            for raw in readings {
                let reading = match raw.parse() {
                    Ok(reading) => reading,
                    Err(err) => {
                        report.unparseable += 1;
                        warn!(
                            component = "store",
                            event = "store.reading_rejected",
                            pollutant = raw.pollutant.as_str(),
                            location = %raw.location,
                            error = %err
                        );
                        continue;
                    }
                };
                let changed = stmt.execute(params![
                    raw.pollutant.as_str(),
                    raw.location,
                    raw.observed_at,
                    reading.ts_ms_utc,
                    reading.value,
                    raw.unit,
                ])?;
                if changed == 0 {
                    report.already_present += 1;
                } else {
                    report.inserted += 1;
                }
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.insert",
            inserted = report.inserted,
            already_present = report.already_present,
            unparseable = report.unparseable
        );
        Ok(report)
    }

    /// Readings for `pollutant` inside `range`, in insertion order.
    pub fn fetch(
        &self,
        pollutant: Pollutant,
        range: &TimeRange,
    ) -> Result<Vec<RawReading>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT pollutant, observed_at, value, unit, location
            FROM readings
            WHERE pollutant = ?1
              AND ts_ms_utc >= ?2
              AND ts_ms_utc < ?3
            ORDER BY rowid ASC
            ",
        )?;
        let mut rows = stmt.query(params![
            pollutant.as_str(),
            range.start_ts_ms_utc,
            range.end_ts_ms_utc_exclusive
        ])?;

        let mut readings = Vec::new();
        while let Some(row) = rows.next()? {
            let code: String = row.get(0)?;
            readings.push(RawReading {
                pollutant: Pollutant::parse(&code)
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?,
                observed_at: row.get(1)?,
                value: row.get(2)?,
                unit: row.get(3)?,
                location: row.get(4)?,
            });
        }
        Ok(readings)
    }

    pub fn latest_ts_ms_utc(&self, pollutant: Pollutant) -> Result<Option<i64>, StoreError> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(ts_ms_utc) FROM readings WHERE pollutant = ?1",
                params![pollutant.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }

    pub fn count(&self, pollutant: Pollutant) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM readings WHERE pollutant = ?1",
            params![pollutant.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl ReadingSource for ReadingStore {
    fn fetch(
        &self,
        pollutant: Pollutant,
        range: &TimeRange,
    ) -> Result<Vec<RawReading>, SourceError> {
        Ok(ReadingStore::fetch(self, pollutant, range)?)
    }
}
