//! Event stream, listener, checkpoint, and event-buffer storage

use chrono::Utc;
use rusqlite::{params, types::Type, OptionalExtension, Row};
use serde_json::Value;

use super::{fmt_ts, parse_json, parse_ts};
use crate::models::{EventStreamSpec, ListenerSpec, StreamEvent};
use crate::persistence::{Database, StoreResult};

const STREAM_COLUMNS: &str =
    "id, name, stream_type, filter, batch_size, batch_timeout_ms, suspended, created_at";

fn stream_from_row(row: &Row<'_>) -> rusqlite::Result<EventStreamSpec> {
    let stream_type: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(EventStreamSpec {
        id: row.get(0)?,
        name: row.get(1)?,
        stream_type: stream_type
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        filter: row.get(3)?,
        batch_size: row.get::<_, i64>(4)? as usize,
        batch_timeout_ms: row.get::<_, i64>(5)? as u64,
        suspended: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(7, &created_at)?,
    })
}

fn listener_from_row(row: &Row<'_>) -> rusqlite::Result<ListenerSpec> {
    let created_at: String = row.get(3)?;
    Ok(ListenerSpec {
        id: row.get(0)?,
        stream_id: row.get(1)?,
        filter: row.get(2)?,
        created_at: parse_ts(3, &created_at)?,
    })
}

impl Database {
    pub fn write_stream(&self, spec: &EventStreamSpec) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO event_streams
             (id, name, stream_type, filter, batch_size, batch_timeout_ms, suspended, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               filter = excluded.filter,
               batch_size = excluded.batch_size,
               batch_timeout_ms = excluded.batch_timeout_ms,
               suspended = excluded.suspended",
            params![
                spec.id,
                spec.name,
                spec.stream_type.to_string(),
                spec.filter,
                spec.batch_size as i64,
                spec.batch_timeout_ms as i64,
                spec.suspended as i64,
                fmt_ts(&spec.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_stream(&self, id: &str) -> StoreResult<Option<EventStreamSpec>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM event_streams WHERE id = ?1",
            STREAM_COLUMNS
        ))?;
        Ok(stmt.query_row([id], stream_from_row).optional()?)
    }

    pub fn get_stream_by_name(&self, name: &str) -> StoreResult<Option<EventStreamSpec>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM event_streams WHERE name = ?1",
            STREAM_COLUMNS
        ))?;
        Ok(stmt.query_row([name], stream_from_row).optional()?)
    }

    pub fn list_streams(&self) -> StoreResult<Vec<EventStreamSpec>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM event_streams ORDER BY created_at, id",
            STREAM_COLUMNS
        ))?;
        let rows = stmt.query_map([], stream_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_stream(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn();
        let rows = conn.execute("DELETE FROM event_streams WHERE id = ?1", [id])?;
        conn.execute("DELETE FROM stream_listeners WHERE stream_id = ?1", [id])?;
        conn.execute("DELETE FROM stream_checkpoints WHERE stream_id = ?1", [id])?;
        conn.execute("DELETE FROM stream_events WHERE stream_id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub fn write_listener(&self, listener: &ListenerSpec) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO stream_listeners (id, stream_id, filter, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET filter = excluded.filter",
            params![
                listener.id,
                listener.stream_id,
                listener.filter,
                fmt_ts(&listener.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_listeners(&self, stream_id: &str) -> StoreResult<Vec<ListenerSpec>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, stream_id, filter, created_at FROM stream_listeners
             WHERE stream_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([stream_id], listener_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_listener(&self, stream_id: &str, listener_id: &str) -> StoreResult<bool> {
        let rows = self.conn().execute(
            "DELETE FROM stream_listeners WHERE stream_id = ?1 AND id = ?2",
            params![stream_id, listener_id],
        )?;
        Ok(rows > 0)
    }

    pub fn write_checkpoint(&self, stream_id: &str, checkpoint: i64) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO stream_checkpoints (stream_id, checkpoint, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(stream_id) DO UPDATE SET
               checkpoint = excluded.checkpoint,
               updated_at = excluded.updated_at",
            params![stream_id, checkpoint, fmt_ts(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_checkpoint(&self, stream_id: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn();
        let cp = conn
            .query_row(
                "SELECT checkpoint FROM stream_checkpoints WHERE stream_id = ?1",
                [stream_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cp)
    }

    pub fn append_stream_event(&self, stream_id: &str, payload: &Value) -> StoreResult<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO stream_events (stream_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![stream_id, serde_json::to_string(payload)?, fmt_ts(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_stream_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<StreamEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM stream_events
             WHERE stream_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![stream_id, after, limit as i64], |row| {
            let payload: String = row.get(1)?;
            Ok(StreamEvent {
                checkpoint: row.get(0)?,
                payload: parse_json(1, &payload)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
