//! Durable log store for sensor samples and publish confirmations.
//!
//! Backed by SQLite. Two append-only tables: `sensor_history` holds every
//! reading the acquisition daemon delivers, `post_history` holds one row per
//! confirmed broker publish. The latest `post_history` row for the sensor
//! topic is the high-water mark the redelivery resolver resumes from.
//!
//! Replay boundary: `samples_after` is strict `>`. A sample whose timestamp
//! equals the recorded high-water mark is already covered by that record and
//! must not be read again.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// A sensor reading value, numeric or textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Text(String),
}

/// One timestamped sensor reading. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor: String,
    pub value: SampleValue,
    pub ts: i64,
}

/// Durable proof that `topic` was published up to `sample_ts`.
///
/// Written exactly once per confirmed publish, never mutated or deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub topic: String,
    pub payload_len: usize,
    pub sample_ts: i64,
    pub real_ts: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("failed to encode sample value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// SQLite-backed append-only store.
///
/// The rusqlite `Connection` is not `Sync`, so it sits behind a `Mutex`.
/// All access happens from the service task; the lock is never contended.
pub struct LogStore {
    conn: Mutex<Connection>,
}

impl LogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(|source| StoreError::Open {
            path: path.as_ref().display().to_string(),
            source,
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sensor_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor TEXT NOT NULL,
                value TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sensor_ts ON sensor_history(ts)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS post_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                len INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                real_ts INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_post_topic ON post_history(topic)",
            [],
        )?;

        Ok(())
    }

    pub fn append_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let value = serde_json::to_string(&sample.value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sensor_history (sensor, value, ts) VALUES (?1, ?2, ?3)",
            params![sample.sensor, value, sample.ts],
        )?;
        Ok(())
    }

    pub fn append_post_record(&self, record: &PostRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO post_history (topic, len, ts, real_ts) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.topic,
                record.payload_len as i64,
                record.sample_ts,
                record.real_ts
            ],
        )?;
        Ok(())
    }

    /// Most recent publish confirmation for `topic`, by insertion order.
    pub fn latest_post_record(&self, topic: &str) -> Result<Option<PostRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT topic, len, ts, real_ts FROM post_history
             WHERE topic = ?1 ORDER BY id DESC LIMIT 1",
        )?;

        let mut rows = stmt.query_map([topic], |row| {
            Ok(PostRecord {
                topic: row.get(0)?,
                payload_len: row.get::<_, i64>(1)? as usize,
                sample_ts: row.get(2)?,
                real_ts: row.get(3)?,
            })
        })?;

        rows.next().transpose().map_err(StoreError::from)
    }

    /// Samples strictly newer than `ts`, ascending, at most `limit` rows.
    ///
    /// Each call is a fresh query, not a live cursor, so a restarted replay
    /// pass tolerates rows inserted in between.
    pub fn samples_after(&self, ts: i64, limit: usize) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sensor, value, ts FROM sensor_history
             WHERE ts > ?1 ORDER BY ts ASC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![ts, limit as i64], |row| {
            let sensor: String = row.get(0)?;
            let value: String = row.get(1)?;
            let ts: i64 = row.get(2)?;
            Ok((sensor, value, ts))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (sensor, value, ts) = row?;
            let value: SampleValue = serde_json::from_str(&value)?;
            samples.push(Sample { sensor, value, ts });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sensor: &str, value: f64, ts: i64) -> Sample {
        Sample {
            sensor: sensor.to_string(),
            value: SampleValue::Number(value),
            ts,
        }
    }

    #[test]
    fn append_and_read_back_ascending() {
        let store = LogStore::open_in_memory().unwrap();

        // Inserted out of order on purpose.
        store.append_sample(&sample("DI1", 1.0, 130)).unwrap();
        store.append_sample(&sample("DI1", 2.0, 100)).unwrap();
        store.append_sample(&sample("DI2", 3.0, 160)).unwrap();

        let samples = store.samples_after(0, 30).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].ts, 100);
        assert_eq!(samples[1].ts, 130);
        assert_eq!(samples[2].ts, 160);
    }

    #[test]
    fn samples_after_is_strict() {
        let store = LogStore::open_in_memory().unwrap();
        store.append_sample(&sample("DI1", 1.0, 100)).unwrap();
        store.append_sample(&sample("DI1", 2.0, 130)).unwrap();

        // The boundary sample is covered by its PostRecord and must not
        // be returned again.
        let samples = store.samples_after(100, 30).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].ts, 130);
    }

    #[test]
    fn samples_after_respects_limit() {
        let store = LogStore::open_in_memory().unwrap();
        for i in 0..40 {
            store.append_sample(&sample("DI1", i as f64, 100 + i)).unwrap();
        }

        let page = store.samples_after(0, 30).unwrap();
        assert_eq!(page.len(), 30);
        assert_eq!(page.last().unwrap().ts, 129);
    }

    #[test]
    fn latest_post_record_per_topic() {
        let store = LogStore::open_in_memory().unwrap();
        assert!(store.latest_post_record("a/sensors/dev").unwrap().is_none());

        store
            .append_post_record(&PostRecord {
                topic: "a/sensors/dev".to_string(),
                payload_len: 10,
                sample_ts: 100,
                real_ts: 1000,
            })
            .unwrap();
        store
            .append_post_record(&PostRecord {
                topic: "a/config/sensors/dev".to_string(),
                payload_len: 5,
                sample_ts: 999,
                real_ts: 1001,
            })
            .unwrap();
        store
            .append_post_record(&PostRecord {
                topic: "a/sensors/dev".to_string(),
                payload_len: 20,
                sample_ts: 160,
                real_ts: 1002,
            })
            .unwrap();

        let latest = store.latest_post_record("a/sensors/dev").unwrap().unwrap();
        assert_eq!(latest.sample_ts, 160);
        assert_eq!(latest.payload_len, 20);
    }

    #[test]
    fn text_values_survive_round_trip() {
        let store = LogStore::open_in_memory().unwrap();
        store
            .append_sample(&Sample {
                sensor: "DI3".to_string(),
                value: SampleValue::Text("open".to_string()),
                ts: 42,
            })
            .unwrap();

        let samples = store.samples_after(0, 10).unwrap();
        assert_eq!(samples[0].value, SampleValue::Text("open".to_string()));
    }
}
