//! Durable per-session storage for `DiceBox`: the player roster and the
//! append-only roll log.
//!
//! The store is the only writer of persisted state. Coordinator instances are
//! torn down on inactivity, but rows written here survive until the retention
//! sweep, so a recreated coordinator rehydrates from this crate.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod db;
pub mod models;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::{NewRollRecord, Player, PlayerId, RollRecord, SessionId};

/// Errors returned by the record store.
#[derive(Debug, Error)]
pub enum SessionDbError {
    /// Database error
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// JSON serialization/deserialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Handle to the session record store.
///
/// Cheap to clone; all clones share one underlying connection.
#[derive(Debug, Clone)]
pub struct SessionDb {
    connection: Arc<Mutex<Connection>>,
}

impl SessionDb {
    /// Open (creating if necessary) the store at `path` and run migrations.
    ///
    /// # Errors
    ///
    /// * If the database cannot be opened or migrated
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionDbError> {
        log::debug!("Opening record store at {:?}", path.as_ref());
        Self::init(Connection::open(path)?)
    }

    /// Open a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// * If the database cannot be initialized
    pub fn open_in_memory() -> Result<Self, SessionDbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, SessionDbError> {
        db::migrate(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }
}

/// Idempotently create the durable row for `session_id`.
///
/// # Errors
///
/// * If a database error occurs
pub async fn create_session(db: &SessionDb, session_id: &SessionId) -> Result<(), SessionDbError> {
    let connection = db.connection.lock().await;
    db::create_session(&connection, session_id)
}

/// Insert a new player (`player_id` = `None`, id assigned by the store) or
/// rename and reactivate an existing one.
///
/// # Errors
///
/// * If a database error occurs
pub async fn upsert_player(
    db: &SessionDb,
    session_id: &SessionId,
    player_id: Option<PlayerId>,
    name: &str,
) -> Result<Player, SessionDbError> {
    let connection = db.connection.lock().await;
    db::upsert_player(&connection, session_id, player_id, name)
}

/// Refresh a player's `last_seen` timestamp.
///
/// # Errors
///
/// * If a database error occurs
pub async fn touch_player(db: &SessionDb, player_id: PlayerId) -> Result<(), SessionDbError> {
    let connection = db.connection.lock().await;
    db::touch_player(&connection, player_id)
}

/// Append a roll to the session log, assigning the next monotonic record id
/// and the timestamp. Historical records are never updated or deleted here.
///
/// # Errors
///
/// * If a database error occurs
pub async fn append_roll(
    db: &SessionDb,
    session_id: &SessionId,
    roll: &NewRollRecord,
) -> Result<RollRecord, SessionDbError> {
    let connection = db.connection.lock().await;
    db::append_roll(&connection, session_id, roll)
}

/// All players ever seen in the session, active flag included.
///
/// # Errors
///
/// * If a database error occurs
pub async fn list_roster(
    db: &SessionDb,
    session_id: &SessionId,
) -> Result<Vec<Player>, SessionDbError> {
    let connection = db.connection.lock().await;
    db::list_roster(&connection, session_id)
}

/// The replay window: the newest `limit` records no older than `max_age`, in
/// commit (ascending id) order.
///
/// # Errors
///
/// * If a database error occurs
pub async fn list_recent_rolls(
    db: &SessionDb,
    session_id: &SessionId,
    limit: usize,
    max_age: Duration,
) -> Result<Vec<RollRecord>, SessionDbError> {
    let connection = db.connection.lock().await;
    db::list_recent_rolls(&connection, session_id, limit, max_age)
}

/// Mark a single player inactive.
///
/// # Errors
///
/// * If a database error occurs
pub async fn mark_inactive(db: &SessionDb, player_id: PlayerId) -> Result<(), SessionDbError> {
    let connection = db.connection.lock().await;
    db::mark_inactive(&connection, player_id)
}

/// Mark every player in the session inactive. Runs when a coordinator is
/// (re)created so active flags from a previous process never survive.
///
/// # Errors
///
/// * If a database error occurs
pub async fn mark_session_inactive(
    db: &SessionDb,
    session_id: &SessionId,
) -> Result<(), SessionDbError> {
    let connection = db.connection.lock().await;
    db::mark_session_inactive(&connection, session_id)
}

/// Delete roll records strictly older than `age`. Returns the purged count.
///
/// # Errors
///
/// * If a database error occurs
pub async fn purge_older_than(db: &SessionDb, age: Duration) -> Result<usize, SessionDbError> {
    let connection = db.connection.lock().await;
    db::purge_older_than(&connection, age)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::RollType;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn test_db() -> SessionDb {
        SessionDb::open_in_memory().expect("in-memory database")
    }

    fn session(id: &str) -> SessionId {
        SessionId::parse(id).expect("valid session id")
    }

    fn check_roll(player: &Player, total: i64) -> NewRollRecord {
        NewRollRecord {
            player_id: player.id,
            player_name: player.name.clone(),
            roll_type: RollType::Check,
            payload: json!({"hopeValue": total - 7, "fearValue": 7}),
            total,
            result_text: format!("{total} with Hope"),
        }
    }

    async fn backdate_rolls(db: &SessionDb, delta_millis: i64) {
        let connection = db.connection.lock().await;
        connection
            .execute(
                "UPDATE rolls SET timestamp = timestamp - ?1",
                rusqlite::params![delta_millis],
            )
            .expect("backdate");
    }

    #[test_log::test(tokio::test)]
    async fn append_roll_assigns_monotonic_ids_per_session() {
        let db = test_db();
        let first = session("AB12CD");
        let second = session("ZZ99ZZ");
        create_session(&db, &first).await.unwrap();
        create_session(&db, &second).await.unwrap();

        let one = upsert_player(&db, &first, None, "Rowan").await.unwrap();
        let two = upsert_player(&db, &second, None, "Kit").await.unwrap();

        // interleave sessions; each keeps its own counter
        assert_eq!(append_roll(&db, &first, &check_roll(&one, 10)).await.unwrap().id, 1);
        assert_eq!(append_roll(&db, &second, &check_roll(&two, 11)).await.unwrap().id, 1);
        assert_eq!(append_roll(&db, &first, &check_roll(&one, 12)).await.unwrap().id, 2);
        assert_eq!(append_roll(&db, &first, &check_roll(&one, 13)).await.unwrap().id, 3);
        assert_eq!(append_roll(&db, &second, &check_roll(&two, 14)).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn replay_window_is_bounded_by_limit() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();
        let player = upsert_player(&db, &session_id, None, "Rowan").await.unwrap();

        for i in 0..60 {
            append_roll(&db, &session_id, &check_roll(&player, i)).await.unwrap();
        }

        let rolls = list_recent_rolls(&db, &session_id, 50, DAY).await.unwrap();

        assert_eq!(rolls.len(), 50);
        assert_eq!(rolls.first().unwrap().id, 11);
        assert_eq!(rolls.last().unwrap().id, 60);
        assert!(rolls.windows(2).all(|pair| pair[0].id < pair[1].id));
    }

    #[tokio::test]
    async fn replay_window_excludes_rolls_older_than_max_age() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();
        let player = upsert_player(&db, &session_id, None, "Rowan").await.unwrap();

        append_roll(&db, &session_id, &check_roll(&player, 9)).await.unwrap();
        backdate_rolls(&db, 25 * 60 * 60 * 1000).await;
        let recent = append_roll(&db, &session_id, &check_roll(&player, 15)).await.unwrap();

        let rolls = list_recent_rolls(&db, &session_id, 50, DAY).await.unwrap();

        assert_eq!(rolls.len(), 1);
        assert_eq!(rolls[0].id, recent.id);
    }

    #[tokio::test]
    async fn upsert_player_renames_and_reactivates() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();

        let player = upsert_player(&db, &session_id, None, "Player").await.unwrap();
        assert!(player.is_active);

        mark_inactive(&db, player.id).await.unwrap();
        let roster = list_roster(&db, &session_id).await.unwrap();
        assert!(!roster[0].is_active);

        let renamed = upsert_player(&db, &session_id, Some(player.id), "Rowan")
            .await
            .unwrap();
        assert_eq!(renamed.id, player.id);
        assert_eq!(renamed.name, "Rowan");
        assert!(renamed.is_active);
    }

    #[tokio::test]
    async fn mark_session_inactive_clears_active_flags() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();
        upsert_player(&db, &session_id, None, "Rowan").await.unwrap();
        upsert_player(&db, &session_id, None, "Kit").await.unwrap();

        mark_session_inactive(&db, &session_id).await.unwrap();

        let roster = list_roster(&db, &session_id).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert!(roster.iter().all(|player| !player.is_active));
    }

    #[test_log::test(tokio::test)]
    async fn purge_only_removes_rolls_older_than_cutoff() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();
        let player = upsert_player(&db, &session_id, None, "Rowan").await.unwrap();

        append_roll(&db, &session_id, &check_roll(&player, 9)).await.unwrap();
        backdate_rolls(&db, 25 * 60 * 60 * 1000).await;
        let recent = append_roll(&db, &session_id, &check_roll(&player, 15)).await.unwrap();

        let purged = purge_older_than(&db, DAY).await.unwrap();
        assert_eq!(purged, 1);

        // the most recent roll is younger than the cutoff and survives even
        // though its player may have left
        mark_inactive(&db, player.id).await.unwrap();
        let purged = purge_older_than(&db, DAY).await.unwrap();
        assert_eq!(purged, 0);

        let rolls = list_recent_rolls(&db, &session_id, 50, DAY).await.unwrap();
        assert_eq!(rolls.len(), 1);
        assert_eq!(rolls[0].id, recent.id);
    }

    #[tokio::test]
    async fn roll_payload_round_trips_verbatim() {
        let db = test_db();
        let session_id = session("AB12CD");
        create_session(&db, &session_id).await.unwrap();
        let player = upsert_player(&db, &session_id, None, "Rowan").await.unwrap();

        let payload = json!({
            "hopeValue": 8,
            "fearValue": 7,
            "modifier": 0,
            "clientTag": "kept-as-is",
        });
        append_roll(
            &db,
            &session_id,
            &NewRollRecord {
                player_id: player.id,
                player_name: player.name.clone(),
                roll_type: RollType::Check,
                payload: payload.clone(),
                total: 15,
                result_text: "15 with Hope".into(),
            },
        )
        .await
        .unwrap();

        let rolls = list_recent_rolls(&db, &session_id, 50, DAY).await.unwrap();
        assert_eq!(rolls[0].payload, payload);
        assert_eq!(rolls[0].total, 15);
    }
}
