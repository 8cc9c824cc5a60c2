use std::collections::HashMap;

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use rapport_types::models::Profile;

use crate::models::{OptionalExt, UserRow, parse_uuid, to_sql_ts};
use crate::{Database, StoreResult};

/// Resolves user identifiers to display profiles. Read-only; never touches
/// conversation state. Stores resolve profiles only through this trait, on
/// the connection they already hold.
pub trait ParticipantDirectory {
    fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>>;

    /// Batch lookup. Unknown ids resolve to [`Profile::unknown`].
    fn profiles(&self, user_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Profile>>;
}

impl ParticipantDirectory for Connection {
    fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>> {
        query_profile(self, user_id)
    }

    fn profiles(&self, user_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Profile>> {
        query_profiles(self, user_ids)
    }
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        display_name: &str,
    ) -> StoreResult<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.to_string(),
                    username,
                    password_hash,
                    display_name,
                    to_sql_ts(Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, password, display_name, avatar_ref, created_at
                 FROM users WHERE username = ?1",
                [username],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password: row.get(2)?,
                        display_name: row.get(3)?,
                        avatar_ref: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }
}

fn query_profile(conn: &Connection, user_id: Uuid) -> StoreResult<Option<Profile>> {
    let row = conn
        .query_row(
            "SELECT id, display_name, username, avatar_ref FROM users WHERE id = ?1",
            [user_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, display_name, handle, avatar_ref)| {
        Ok(Profile {
            id: parse_uuid(&id)?,
            display_name,
            handle,
            avatar_ref,
        })
    })
    .transpose()
}

fn query_profiles(
    conn: &Connection,
    user_ids: &[Uuid],
) -> StoreResult<HashMap<Uuid, Profile>> {
    let mut profiles = HashMap::with_capacity(user_ids.len());
    if user_ids.is_empty() {
        return Ok(profiles);
    }

    let placeholders: Vec<String> = (1..=user_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT id, display_name, username, avatar_ref FROM users WHERE id IN ({})",
        placeholders.join(", ")
    );

    let ids: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, display_name, handle, avatar_ref) in rows {
        let id = parse_uuid(&id)?;
        profiles.insert(
            id,
            Profile {
                id,
                display_name,
                handle,
                avatar_ref,
            },
        );
    }

    for id in user_ids {
        profiles.entry(*id).or_insert_with(|| Profile::unknown(*id));
    }

    Ok(profiles)
}

/// First id that has no directory entry, if any.
pub(crate) fn first_unknown_user(conn: &Connection, user_ids: &[Uuid]) -> StoreResult<Option<Uuid>> {
    for id in user_ids {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            [id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(Some(*id));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn resolves_known_and_unknown_profiles() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let ghost = Uuid::new_v4();

        let (profile, missing, batch) = db
            .with_conn(|conn| {
                Ok((conn.profile(alice)?, conn.profile(ghost)?, conn.profiles(&[alice, ghost])?))
            })
            .unwrap();
        let profile = profile.unwrap();
        assert_eq!(profile.handle, "alice");
        assert_eq!(profile.display_name, "ALICE");
        assert!(missing.is_none());

        assert_eq!(batch[&alice].handle, "alice");
        assert_eq!(batch[&ghost], Profile::unknown(ghost));
    }

    #[test]
    fn finds_login_row_by_username() {
        let db = testing::db();
        let id = testing::user(&db, "bob");
        let row = db.get_user_by_username("bob").unwrap().unwrap();
        assert_eq!(row.id, id.to_string());
        assert!(db.get_user_by_username("carol").unwrap().is_none());
    }
}
