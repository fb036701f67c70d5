//! Database queries for the session record store.
//!
//! Internal query implementations over the raw `SQLite` connection. All
//! functions here are private to the crate and exposed through the public
//! async API in the parent module.

use std::str::FromStr as _;
use std::time::Duration;

use rusqlite::{params, Connection, Row};

use crate::models::{
    NewRollRecord, Player, PlayerId, RollRecord, RollType, SessionId,
};
use crate::SessionDbError;

pub(crate) fn migrate(connection: &Connection) -> Result<(), SessionDbError> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY NOT NULL,
            created INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS players (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            joined_at INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_players_session ON players(session_id);
        CREATE TABLE IF NOT EXISTS rolls (
            session_id TEXT NOT NULL,
            id INTEGER NOT NULL,
            player_id INTEGER NOT NULL,
            player_name TEXT NOT NULL,
            roll_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            total INTEGER NOT NULL,
            result_text TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (session_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_rolls_session_timestamp
            ON rolls(session_id, timestamp);
        ",
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn as_player(row: &Row<'_>) -> rusqlite::Result<Player> {
    Ok(Player {
        id: row.get("id")?,
        name: row.get("name")?,
        joined_at: row.get("joined_at")?,
        last_seen: row.get("last_seen")?,
        is_active: row.get("is_active")?,
    })
}

fn as_roll_record(row: &Row<'_>) -> rusqlite::Result<RollRecord> {
    let roll_type: String = row.get("roll_type")?;
    let payload: String = row.get("payload")?;

    Ok(RollRecord {
        id: row.get("id")?,
        player_id: row.get("player_id")?,
        player_name: row.get("player_name")?,
        roll_type: RollType::from_str(&roll_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        total: row.get("total")?,
        result_text: row.get("result_text")?,
        timestamp: row.get("timestamp")?,
    })
}

pub(crate) fn create_session(
    connection: &Connection,
    session_id: &SessionId,
) -> Result<(), SessionDbError> {
    connection.execute(
        "INSERT INTO sessions (id, created) VALUES (?1, ?2)
         ON CONFLICT(id) DO NOTHING",
        params![session_id.as_str(), now_millis()],
    )?;

    Ok(())
}

pub(crate) fn upsert_player(
    connection: &Connection,
    session_id: &SessionId,
    player_id: Option<PlayerId>,
    name: &str,
) -> Result<Player, SessionDbError> {
    let now = now_millis();

    let id = if let Some(id) = player_id {
        connection.execute(
            "UPDATE players SET name = ?1, last_seen = ?2, is_active = 1
             WHERE id = ?3 AND session_id = ?4",
            params![name, now, id, session_id.as_str()],
        )?;
        id
    } else {
        connection.execute(
            "INSERT INTO players (session_id, name, joined_at, last_seen, is_active)
             VALUES (?1, ?2, ?3, ?3, 1)",
            params![session_id.as_str(), name, now],
        )?;
        connection.last_insert_rowid()
    };

    Ok(connection.query_row(
        "SELECT id, name, joined_at, last_seen, is_active FROM players WHERE id = ?1",
        params![id],
        as_player,
    )?)
}

pub(crate) fn touch_player(
    connection: &Connection,
    player_id: PlayerId,
) -> Result<(), SessionDbError> {
    connection.execute(
        "UPDATE players SET last_seen = ?1 WHERE id = ?2",
        params![now_millis(), player_id],
    )?;

    Ok(())
}

/// Append-only: assigns the next monotonic per-session id. The coordinator is
/// the only writer for its session, so `MAX(id) + 1` cannot race.
pub(crate) fn append_roll(
    connection: &Connection,
    session_id: &SessionId,
    roll: &NewRollRecord,
) -> Result<RollRecord, SessionDbError> {
    let payload = serde_json::to_string(&roll.payload)?;
    let timestamp = now_millis();

    let id = connection.query_row(
        "INSERT INTO rolls (
            session_id, id, player_id, player_name, roll_type, payload,
            total, result_text, timestamp
         )
         VALUES (
            ?1,
            (SELECT COALESCE(MAX(id), 0) + 1 FROM rolls WHERE session_id = ?1),
            ?2, ?3, ?4, ?5, ?6, ?7, ?8
         )
         RETURNING id",
        params![
            session_id.as_str(),
            roll.player_id,
            roll.player_name,
            roll.roll_type.as_ref(),
            payload,
            roll.total,
            roll.result_text,
            timestamp,
        ],
        |row| row.get(0),
    )?;

    Ok(RollRecord {
        id,
        player_id: roll.player_id,
        player_name: roll.player_name.clone(),
        roll_type: roll.roll_type,
        payload: roll.payload.clone(),
        total: roll.total,
        result_text: roll.result_text.clone(),
        timestamp,
    })
}

pub(crate) fn list_roster(
    connection: &Connection,
    session_id: &SessionId,
) -> Result<Vec<Player>, SessionDbError> {
    let mut statement = connection.prepare(
        "SELECT id, name, joined_at, last_seen, is_active FROM players
         WHERE session_id = ?1
         ORDER BY joined_at, id",
    )?;

    let players = statement
        .query_map(params![session_id.as_str()], as_player)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(players)
}

pub(crate) fn list_recent_rolls(
    connection: &Connection,
    session_id: &SessionId,
    limit: usize,
    max_age: Duration,
) -> Result<Vec<RollRecord>, SessionDbError> {
    let cutoff = now_millis().saturating_sub(i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX));

    let mut statement = connection.prepare(
        "SELECT id, player_id, player_name, roll_type, payload, total, result_text, timestamp
         FROM rolls
         WHERE session_id = ?1 AND timestamp >= ?2
         ORDER BY id DESC
         LIMIT ?3",
    )?;

    let mut rolls = statement
        .query_map(
            params![session_id.as_str(), cutoff, i64::try_from(limit).unwrap_or(i64::MAX)],
            as_roll_record,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // newest-first query bounds the window; replay goes out in commit order
    rolls.reverse();

    Ok(rolls)
}

pub(crate) fn mark_inactive(
    connection: &Connection,
    player_id: PlayerId,
) -> Result<(), SessionDbError> {
    connection.execute(
        "UPDATE players SET is_active = 0, last_seen = ?1 WHERE id = ?2",
        params![now_millis(), player_id],
    )?;

    Ok(())
}

pub(crate) fn mark_session_inactive(
    connection: &Connection,
    session_id: &SessionId,
) -> Result<(), SessionDbError> {
    connection.execute(
        "UPDATE players SET is_active = 0 WHERE session_id = ?1",
        params![session_id.as_str()],
    )?;

    Ok(())
}

pub(crate) fn purge_older_than(
    connection: &Connection,
    age: Duration,
) -> Result<usize, SessionDbError> {
    let cutoff = now_millis().saturating_sub(i64::try_from(age.as_millis()).unwrap_or(i64::MAX));

    Ok(connection.execute(
        "DELETE FROM rolls WHERE timestamp < ?1",
        params![cutoff],
    )?)
}
