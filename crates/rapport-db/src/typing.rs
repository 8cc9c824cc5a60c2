//! Typing presence. Markers are upserted with a start time and filtered by
//! freshness on every read; nothing expires them in the background except
//! the optional storage sweep.

use chrono::{DateTime, Duration, Utc};
use tracing::trace;
use uuid::Uuid;

use rapport_types::models::{Profile, TypingMarker};

use crate::conversations::{query_membership, require_active};
use crate::directory::ParticipantDirectory;
use crate::models::{parse_ts, parse_uuid, to_sql_ts};
use crate::{Database, StoreError, StoreResult};

/// Markers older than this are invisible to readers.
pub const TYPING_FRESHNESS_SECS: i64 = 5;

impl Database {
    pub fn set_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<TypingMarker> {
        self.with_conn_mut(|conn| {
            require_active(conn, conversation_id, user_id)?;
            conn.execute(
                "INSERT INTO typing_markers (conversation_id, user_id, started_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (conversation_id, user_id) DO UPDATE SET started_at = excluded.started_at",
                rusqlite::params![conversation_id.to_string(), user_id.to_string(), to_sql_ts(now)],
            )?;
            trace!("{} typing in {}", user_id, conversation_id);

            let user = conn.profile(user_id)?.unwrap_or_else(|| Profile::unknown(user_id));
            Ok(TypingMarker {
                conversation_id,
                user,
                started_at: now,
            })
        })
    }

    /// Remove the caller's marker. Returns whether one existed.
    pub fn clear_typing(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<bool> {
        self.with_conn_mut(|conn| {
            query_membership(conn, conversation_id, user_id)?.ok_or(StoreError::NotAParticipant)?;
            let removed = conn.execute(
                "DELETE FROM typing_markers WHERE conversation_id = ?1 AND user_id = ?2",
                [conversation_id.to_string(), user_id.to_string()],
            )?;
            Ok(removed > 0)
        })
    }

    /// Fresh markers of other active participants.
    pub fn list_typing(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<TypingMarker>> {
        self.with_conn(|conn| {
            require_active(conn, conversation_id, requester)?;

            let cutoff = now - Duration::seconds(TYPING_FRESHNESS_SECS);
            let mut stmt = conn.prepare(
                "SELECT t.user_id, t.started_at FROM typing_markers t
                 JOIN memberships m
                   ON m.conversation_id = t.conversation_id AND m.user_id = t.user_id
                 WHERE t.conversation_id = ?1 AND t.user_id != ?2
                   AND t.started_at > ?3 AND m.status = 'active'
                 ORDER BY t.started_at",
            )?;
            let rows = stmt
                .query_map(
                    [conversation_id.to_string(), requester.to_string(), to_sql_ts(cutoff)],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let ids = rows
                .iter()
                .map(|(id, _)| parse_uuid(id))
                .collect::<StoreResult<Vec<_>>>()?;
            let profiles = conn.profiles(&ids)?;

            rows.into_iter()
                .zip(ids)
                .map(|((_, started_at), user_id)| {
                    Ok(TypingMarker {
                        conversation_id,
                        user: profiles
                            .get(&user_id)
                            .cloned()
                            .unwrap_or_else(|| Profile::unknown(user_id)),
                        started_at: parse_ts(&started_at)?,
                    })
                })
                .collect()
        })
    }

    /// Delete markers older than `max_age`. Storage hygiene only.
    pub fn sweep_typing(&self, now: DateTime<Utc>, max_age: Duration) -> StoreResult<usize> {
        self.with_conn_mut(|conn| {
            Ok(conn.execute(
                "DELETE FROM typing_markers WHERE started_at < ?1",
                [to_sql_ts(now - max_age)],
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn readers_see_only_fresh_foreign_markers() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let carol = testing::user(&db, "carol");
        let group = db.create_group(alice, &[bob, carol], None, None, t0()).unwrap();

        db.set_typing(group.id, alice, t0()).unwrap();
        db.set_typing(group.id, bob, t0() + Duration::seconds(3)).unwrap();

        let seen = db.list_typing(group.id, alice, t0() + Duration::seconds(4)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].user.id, bob);
        assert_eq!(seen[0].user.display_name, "BOB");

        let by_carol = db.list_typing(group.id, carol, t0() + Duration::seconds(4)).unwrap();
        assert_eq!(by_carol.len(), 2);

        // Exactly five seconds old is already stale.
        let stale = db.list_typing(group.id, carol, t0() + Duration::seconds(8)).unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn upsert_replaces_and_clear_is_idempotent() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let (c, _) = db.create_or_get_direct(alice, bob, t0()).unwrap();

        db.set_typing(c.id, bob, t0()).unwrap();
        db.set_typing(c.id, bob, t0() + Duration::seconds(10)).unwrap();
        let seen = db.list_typing(c.id, alice, t0() + Duration::seconds(12)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].started_at, t0() + Duration::seconds(10));

        assert!(db.clear_typing(c.id, bob).unwrap());
        assert!(!db.clear_typing(c.id, bob).unwrap());
        assert!(db.list_typing(c.id, alice, t0() + Duration::seconds(12)).unwrap().is_empty());
    }

    #[test]
    fn typing_requires_membership() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let eve = testing::user(&db, "eve");
        let (c, _) = db.create_or_get_direct(alice, bob, t0()).unwrap();

        assert!(matches!(db.set_typing(c.id, eve, t0()), Err(StoreError::NotAParticipant)));
        assert!(matches!(db.list_typing(c.id, eve, t0()), Err(StoreError::NotAParticipant)));
        assert!(matches!(db.clear_typing(c.id, eve), Err(StoreError::NotAParticipant)));
    }

    #[test]
    fn sweep_reclaims_old_rows() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let (c, _) = db.create_or_get_direct(alice, bob, t0()).unwrap();

        db.set_typing(c.id, alice, t0()).unwrap();
        db.set_typing(c.id, bob, t0() + Duration::seconds(90)).unwrap();

        let removed = db
            .sweep_typing(t0() + Duration::seconds(100), Duration::seconds(60))
            .unwrap();
        assert_eq!(removed, 1);
    }
}
