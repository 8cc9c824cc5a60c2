//! Conversation store: conversation records, participant membership and
//! group settings.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use rapport_types::api::UpdateConversationRequest;
use rapport_types::models::{
    Conversation, ConversationKind, MemberStatus, Membership, Message, Profile, Role, SystemEvent,
};

use crate::directory::{ParticipantDirectory, first_unknown_user};
use crate::messages::append_system_message;
use crate::models::{CONVERSATION_COLUMNS, ConversationRow, MembershipRow, OptionalExt, to_sql_ts};
use crate::receipts::query_unread_count;
use crate::{Database, StoreError, StoreResult};

pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Order-independent key for the participant pair of a direct conversation.
pub fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

impl Database {
    /// Membership row for `(conversation, user)` in any status.
    pub fn check_membership(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<Membership> {
        self.with_conn(|conn| {
            query_membership(conn, conversation_id, user_id)?.ok_or(StoreError::NotAParticipant)
        })
    }

    /// Return the direct conversation between `a` and `b`, creating it when
    /// absent. The boolean is true when this call created it.
    pub fn create_or_get_direct(
        &self,
        a: Uuid,
        b: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Conversation, bool)> {
        if a == b {
            return Err(StoreError::invalid("cannot open a direct conversation with yourself"));
        }

        let attempt = self.with_conn_mut(|conn| {
            if let Some(unknown) = first_unknown_user(conn, &[a, b])? {
                return Err(StoreError::not_found(format!("user {}", unknown)));
            }
            if let Some(existing) = find_direct(conn, a, b)? {
                return Ok((existing, false));
            }

            let id = Uuid::new_v4();
            let ts = to_sql_ts(now);
            conn.execute(
                "INSERT INTO conversations
                    (id, kind, created_by, direct_key, last_activity_at, created_at)
                 VALUES (?1, 'direct', ?2, ?3, ?4, ?4)",
                rusqlite::params![id.to_string(), a.to_string(), direct_key(a, b), ts],
            )?;
            insert_membership(conn, id, a, Role::Owner, now)?;
            insert_membership(conn, id, b, Role::Member, now)?;

            let conversation = query_conversation(conn, id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            Ok((conversation, true))
        });

        match attempt {
            Ok((conversation, created)) => {
                if created {
                    info!("Direct conversation {} created for {} and {}", conversation.id, a, b);
                }
                Ok((conversation, created))
            }
            // Lost the race to a concurrent creator on another handle: either
            // the pair constraint rejected our insert or the winner still held
            // the write lock. The winner's row is the answer.
            Err(e) if e.is_unique_violation() || e.is_busy() => {
                warn!("Direct conversation race for {} and {}, resolving by lookup", a, b);
                self.with_conn(|conn| {
                    let existing = conn
                        .query_row(
                            &format!(
                                "SELECT {} FROM conversations WHERE direct_key = ?1",
                                CONVERSATION_COLUMNS
                            ),
                            [direct_key(a, b)],
                            ConversationRow::from_row,
                        )
                        .optional()?
                        .ok_or_else(|| StoreError::Conflict("direct conversation".into()))?;
                    Ok((existing.into_model()?, false))
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn create_group(
        &self,
        creator: Uuid,
        participant_ids: &[Uuid],
        name: Option<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let mut members: Vec<Uuid> = Vec::with_capacity(participant_ids.len());
        for id in participant_ids {
            if *id != creator && !members.contains(id) {
                members.push(*id);
            }
        }
        if members.is_empty() {
            return Err(StoreError::invalid("a group needs at least one other participant"));
        }
        let name = name.map(validate_name).transpose()?;
        let description = description.map(validate_description).transpose()?.flatten();

        self.with_conn_mut(|conn| {
            let mut everyone = members.clone();
            everyone.push(creator);
            if let Some(unknown) = first_unknown_user(conn, &everyone)? {
                return Err(StoreError::not_found(format!("user {}", unknown)));
            }

            let id = Uuid::new_v4();
            let ts = to_sql_ts(now);
            conn.execute(
                "INSERT INTO conversations
                    (id, kind, name, description, created_by, last_activity_at, created_at)
                 VALUES (?1, 'group', ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![id.to_string(), name, description, creator.to_string(), ts],
            )?;
            insert_membership(conn, id, creator, Role::Owner, now)?;
            for member in &members {
                insert_membership(conn, id, *member, Role::Member, now)?;
            }

            let actor = display_name(conn, creator)?;
            let content = match &name {
                Some(n) => format!("{} created the group \"{}\"", actor, n),
                None => format!("{} created the group", actor),
            };
            append_system_message(conn, id, creator, content, SystemEvent::ConversationCreated, now)?;

            info!("Group {} created by {} with {} members", id, creator, members.len());
            query_conversation(conn, id)?.ok_or_else(|| StoreError::not_found("conversation"))
        })
    }

    /// Change name/description/avatar of a group. Owner or admin only. A name
    /// change appends a `system` message, which is returned alongside.
    pub fn update_settings(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        update: &UpdateConversationRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<(Conversation, Option<Message>)> {
        let new_name = update.name.clone().map(validate_name).transpose()?;
        let new_description = update
            .description
            .clone()
            .map(validate_description)
            .transpose()?;

        self.with_conn_mut(|conn| {
            let conversation = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            if conversation.kind != ConversationKind::Group {
                return Err(StoreError::forbidden("only group conversations have settings"));
            }
            let membership = require_active(conn, conversation_id, actor)?;
            if !membership.role.can_manage() {
                return Err(StoreError::forbidden("only the owner or an admin can change settings"));
            }
            if update.is_empty() {
                return Err(StoreError::invalid("no settings to update"));
            }

            let cid = conversation_id.to_string();
            if let Some(name) = &new_name {
                conn.execute(
                    "UPDATE conversations SET name = ?1 WHERE id = ?2",
                    rusqlite::params![name, cid],
                )?;
            }
            if let Some(description) = &new_description {
                conn.execute(
                    "UPDATE conversations SET description = ?1 WHERE id = ?2",
                    rusqlite::params![description, cid],
                )?;
            }
            if let Some(avatar_ref) = &update.avatar_ref {
                let avatar_ref = Some(avatar_ref.trim()).filter(|a| !a.is_empty());
                conn.execute(
                    "UPDATE conversations SET avatar_ref = ?1 WHERE id = ?2",
                    rusqlite::params![avatar_ref, cid],
                )?;
            }

            let renamed = match new_name {
                Some(name) if conversation.name.as_deref() != Some(name.as_str()) => {
                    let content = format!(
                        "{} renamed the conversation to \"{}\"",
                        display_name(conn, actor)?,
                        name
                    );
                    let event = SystemEvent::ConversationRenamed {
                        old_name: conversation.name.clone(),
                        new_name: name,
                    };
                    Some(append_system_message(conn, conversation_id, actor, content, event, now)?)
                }
                _ => None,
            };

            info!("Conversation {} settings updated by {}", conversation_id, actor);
            let updated = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            Ok((updated, renamed))
        })
    }

    /// Conversation plus every membership (any status) with profiles.
    pub fn get_conversation(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
    ) -> StoreResult<(Conversation, Vec<(Membership, Profile)>)> {
        self.with_conn(|conn| {
            require_active(conn, conversation_id, actor)?;
            let conversation = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;

            let memberships = query_memberships(conn, conversation_id)?;
            let ids: Vec<Uuid> = memberships.iter().map(|m| m.user_id).collect();
            let profiles = conn.profiles(&ids)?;
            let participants = memberships
                .into_iter()
                .map(|m| {
                    let profile = profiles
                        .get(&m.user_id)
                        .cloned()
                        .unwrap_or_else(|| Profile::unknown(m.user_id));
                    (m, profile)
                })
                .collect();

            Ok((conversation, participants))
        })
    }

    /// The user's active conversations, most recently active first, with
    /// their unread counts.
    pub fn list_conversations(&self, user_id: Uuid) -> StoreResult<Vec<(Conversation, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations
                 WHERE id IN (
                     SELECT conversation_id FROM memberships
                     WHERE user_id = ?1 AND status = 'active'
                 )
                 ORDER BY last_activity_at DESC",
                CONVERSATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([user_id.to_string()], ConversationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|row| {
                    let conversation = row.into_model()?;
                    let unread = query_unread_count(conn, conversation.id, user_id)?;
                    Ok((conversation, unread))
                })
                .collect()
        })
    }

    /// Ids of everyone currently active in the conversation.
    pub fn active_participant_ids(&self, conversation_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.with_conn(|conn| {
            Ok(query_memberships(conn, conversation_id)?
                .into_iter()
                .filter(Membership::is_active)
                .map(|m| m.user_id)
                .collect())
        })
    }

    /// Add (or re-activate) group members. Owner or admin only.
    pub fn add_participants(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> StoreResult<(Conversation, Message)> {
        self.with_conn_mut(|conn| {
            let conversation = require_group(conn, conversation_id)?;
            let membership = require_active(conn, conversation_id, actor)?;
            if !membership.role.can_manage() {
                return Err(StoreError::forbidden("only the owner or an admin can add participants"));
            }
            if let Some(unknown) = first_unknown_user(conn, user_ids)? {
                return Err(StoreError::not_found(format!("user {}", unknown)));
            }

            let mut added = Vec::new();
            for user_id in user_ids {
                if added.contains(user_id) {
                    continue;
                }
                match query_membership(conn, conversation_id, *user_id)? {
                    Some(existing) if existing.is_active() => continue,
                    Some(_) => {
                        conn.execute(
                            "UPDATE memberships SET role = 'member', status = 'active', joined_at = ?1
                             WHERE conversation_id = ?2 AND user_id = ?3",
                            rusqlite::params![
                                to_sql_ts(now),
                                conversation_id.to_string(),
                                user_id.to_string()
                            ],
                        )?;
                    }
                    None => insert_membership(conn, conversation_id, *user_id, Role::Member, now)?,
                }
                added.push(*user_id);
            }
            if added.is_empty() {
                return Err(StoreError::invalid("everyone listed is already a participant"));
            }

            let profiles = conn.profiles(&added)?;
            let names: Vec<&str> = added
                .iter()
                .filter_map(|id| profiles.get(id).map(|p| p.display_name.as_str()))
                .collect();
            let content = format!("{} added {}", display_name(conn, actor)?, names.join(", "));
            let event = SystemEvent::ParticipantsAdded { user_ids: added.clone() };
            let message = append_system_message(conn, conversation_id, actor, content, event, now)?;

            info!("{} added {} participants to {}", actor, added.len(), conversation.id);
            let updated = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            Ok((updated, message))
        })
    }

    /// Remove a group member. Owners may remove anyone but themselves;
    /// admins may only remove plain members.
    pub fn remove_participant(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        target: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Conversation, Message)> {
        if actor == target {
            return self.leave_conversation(conversation_id, actor, now);
        }

        self.with_conn_mut(|conn| {
            require_group(conn, conversation_id)?;
            let membership = require_active(conn, conversation_id, actor)?;
            let target_membership = query_membership(conn, conversation_id, target)?
                .filter(Membership::is_active)
                .ok_or_else(|| StoreError::not_found("participant"))?;

            let permitted = match (membership.role, target_membership.role) {
                (_, Role::Owner) => false,
                (Role::Owner, _) => true,
                (Role::Admin, Role::Member) => true,
                _ => false,
            };
            if !permitted {
                return Err(StoreError::forbidden("not allowed to remove this participant"));
            }

            set_status(conn, conversation_id, target, MemberStatus::Removed)?;
            clear_typing_marker(conn, conversation_id, target)?;

            let content = format!(
                "{} removed {}",
                display_name(conn, actor)?,
                display_name(conn, target)?
            );
            let event = SystemEvent::ParticipantRemoved { user_id: target };
            let message = append_system_message(conn, conversation_id, actor, content, event, now)?;

            info!("{} removed {} from {}", actor, target, conversation_id);
            let updated = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            Ok((updated, message))
        })
    }

    /// Leave a group. The owner cannot leave since ownership does not transfer.
    pub fn leave_conversation(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<(Conversation, Message)> {
        self.with_conn_mut(|conn| {
            require_group(conn, conversation_id)?;
            let membership = require_active(conn, conversation_id, actor)?;
            if membership.role == Role::Owner {
                return Err(StoreError::forbidden("the owner cannot leave the group"));
            }

            // Announce while still a participant, then flip the status.
            let content = format!("{} left the conversation", display_name(conn, actor)?);
            let event = SystemEvent::ParticipantLeft { user_id: actor };
            let message = append_system_message(conn, conversation_id, actor, content, event, now)?;

            set_status(conn, conversation_id, actor, MemberStatus::Left)?;
            clear_typing_marker(conn, conversation_id, actor)?;

            info!("{} left {}", actor, conversation_id);
            let updated = query_conversation(conn, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation"))?;
            Ok((updated, message))
        })
    }

    /// Promote or demote a member. Owner only; `owner` itself is never
    /// assigned or taken away here.
    pub fn set_role(
        &self,
        conversation_id: Uuid,
        actor: Uuid,
        target: Uuid,
        role: Role,
    ) -> StoreResult<Membership> {
        if role == Role::Owner {
            return Err(StoreError::forbidden("ownership cannot be transferred"));
        }

        self.with_conn_mut(|conn| {
            require_group(conn, conversation_id)?;
            let membership = require_active(conn, conversation_id, actor)?;
            if membership.role != Role::Owner {
                return Err(StoreError::forbidden("only the owner can change roles"));
            }
            let target_membership = query_membership(conn, conversation_id, target)?
                .filter(Membership::is_active)
                .ok_or_else(|| StoreError::not_found("participant"))?;
            if target_membership.role == Role::Owner {
                return Err(StoreError::forbidden("ownership cannot be transferred"));
            }

            conn.execute(
                "UPDATE memberships SET role = ?1 WHERE conversation_id = ?2 AND user_id = ?3",
                rusqlite::params![role.as_str(), conversation_id.to_string(), target.to_string()],
            )?;
            info!("{} set role of {} in {} to {}", actor, target, conversation_id, role);

            query_membership(conn, conversation_id, target)?
                .ok_or_else(|| StoreError::not_found("participant"))
        })
    }
}

/// Fail closed unless `user_id` is an active participant.
pub(crate) fn require_active(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> StoreResult<Membership> {
    query_membership(conn, conversation_id, user_id)?
        .filter(Membership::is_active)
        .ok_or(StoreError::NotAParticipant)
}

fn require_group(conn: &Connection, conversation_id: Uuid) -> StoreResult<Conversation> {
    let conversation = query_conversation(conn, conversation_id)?
        .ok_or_else(|| StoreError::not_found("conversation"))?;
    if conversation.kind != ConversationKind::Group {
        return Err(StoreError::forbidden("direct conversations have a fixed participant pair"));
    }
    Ok(conversation)
}

pub(crate) fn query_conversation(conn: &Connection, id: Uuid) -> StoreResult<Option<Conversation>> {
    conn.query_row(
        &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
        [id.to_string()],
        ConversationRow::from_row,
    )
    .optional()?
    .map(ConversationRow::into_model)
    .transpose()
}

pub(crate) fn query_membership(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> StoreResult<Option<Membership>> {
    conn.query_row(
        "SELECT conversation_id, user_id, role, status, joined_at
         FROM memberships WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id.to_string(), user_id.to_string()],
        MembershipRow::from_row,
    )
    .optional()?
    .map(MembershipRow::into_model)
    .transpose()
}

fn query_memberships(conn: &Connection, conversation_id: Uuid) -> StoreResult<Vec<Membership>> {
    let mut stmt = conn.prepare(
        "SELECT conversation_id, user_id, role, status, joined_at
         FROM memberships WHERE conversation_id = ?1
         ORDER BY joined_at, user_id",
    )?;
    let rows = stmt
        .query_map([conversation_id.to_string()], MembershipRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(MembershipRow::into_model).collect()
}

/// Direct conversation whose membership is exactly the pair `a`, `b`.
fn find_direct(conn: &Connection, a: Uuid, b: Uuid) -> StoreResult<Option<Conversation>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM conversations c
             WHERE c.kind = 'direct'
               AND c.id IN (SELECT conversation_id FROM memberships WHERE user_id = ?1)
               AND c.id IN (SELECT conversation_id FROM memberships WHERE user_id = ?2)
               AND (SELECT COUNT(*) FROM memberships m WHERE m.conversation_id = c.id) = 2
             LIMIT 1",
            CONVERSATION_COLUMNS
        ),
        [a.to_string(), b.to_string()],
        ConversationRow::from_row,
    )
    .optional()?
    .map(ConversationRow::into_model)
    .transpose()
}

fn insert_membership(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
    role: Role,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO memberships (conversation_id, user_id, role, status, joined_at)
         VALUES (?1, ?2, ?3, 'active', ?4)",
        rusqlite::params![
            conversation_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            to_sql_ts(now)
        ],
    )?;
    Ok(())
}

fn set_status(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
    status: MemberStatus,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE memberships SET status = ?1 WHERE conversation_id = ?2 AND user_id = ?3",
        rusqlite::params![status.as_str(), conversation_id.to_string(), user_id.to_string()],
    )?;
    Ok(())
}

fn clear_typing_marker(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM typing_markers WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id.to_string(), user_id.to_string()],
    )?;
    Ok(())
}

fn display_name(conn: &Connection, user_id: Uuid) -> StoreResult<String> {
    Ok(conn.profile(user_id)?
        .unwrap_or_else(|| Profile::unknown(user_id))
        .display_name)
}

fn validate_name(name: String) -> StoreResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::invalid("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(StoreError::invalid(format!("name exceeds {} characters", MAX_NAME_CHARS)));
    }
    Ok(trimmed.to_string())
}

/// Blank descriptions clear the field.
fn validate_description(description: String) -> StoreResult<Option<String>> {
    let trimmed = description.trim();
    if trimmed.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(StoreError::invalid(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    Ok(Some(trimmed.to_string()).filter(|d| !d.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Page;
    use crate::testing;
    use chrono::TimeZone;
    use rapport_types::models::MessageKind;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn direct_is_idempotent_in_both_orders() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");

        let (first, created) = db.create_or_get_direct(alice, bob, t0()).unwrap();
        assert!(created);
        let (again, created_again) = db.create_or_get_direct(alice, bob, t0()).unwrap();
        let (flipped, created_flipped) = db.create_or_get_direct(bob, alice, t0()).unwrap();
        assert!(!created_again && !created_flipped);
        assert_eq!(first.id, again.id);
        assert_eq!(first.id, flipped.id);

        let active = db.active_participant_ids(first.id).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(db.check_membership(first.id, alice).unwrap().role, Role::Owner);
        assert_eq!(db.check_membership(first.id, bob).unwrap().role, Role::Member);
    }

    #[test]
    fn concurrent_direct_creation_yields_one_conversation() {
        let db = std::sync::Arc::new(testing::db());
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                std::thread::spawn(move || {
                    let (x, y) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
                    db.create_or_get_direct(x, y, t0()).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(c, _)| c.id == results[0].0.id));
    }

    #[test]
    fn direct_creation_races_across_handles_on_one_file() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rapport.db");
        let first = Database::open(&path).unwrap();
        let pairs: Vec<(Uuid, Uuid)> = (0..10)
            .map(|i| {
                (
                    testing::user(&first, &format!("left{}", i)),
                    testing::user(&first, &format!("right{}", i)),
                )
            })
            .collect();

        let mut handles = vec![Arc::new(first)];
        for _ in 0..3 {
            handles.push(Arc::new(Database::open(&path).unwrap()));
        }

        for (a, b) in pairs {
            let barrier = Arc::new(Barrier::new(handles.len()));
            let threads: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(i, db)| {
                    let db = db.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
                        barrier.wait();
                        db.create_or_get_direct(x, y, t0())
                    })
                })
                .collect();
            let results: Vec<_> = threads
                .into_iter()
                .map(|t| t.join().unwrap().unwrap())
                .collect();

            assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
            assert!(results.iter().all(|(c, _)| c.id == results[0].0.id));
        }
    }

    #[test]
    fn foreign_key_failures_are_not_races() {
        let db = testing::db();
        let err = db
            .with_conn_mut(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, kind, created_by, last_activity_at, created_at)
                     VALUES (?1, 'group', ?2, ?3, ?3)",
                    rusqlite::params![
                        Uuid::new_v4().to_string(),
                        Uuid::new_v4().to_string(),
                        to_sql_ts(t0())
                    ],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(!err.is_unique_violation());
        assert!(!err.is_busy());
    }

    #[test]
    fn direct_rejects_self_and_strangers() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        assert!(matches!(db.create_or_get_direct(alice, alice, t0()), Err(StoreError::Invalid(_))));
        assert!(matches!(
            db.create_or_get_direct(alice, Uuid::new_v4(), t0()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn unique_pair_constraint_backs_the_lookup() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        db.create_or_get_direct(alice, bob, t0()).unwrap();

        let err = db
            .with_conn_mut(|conn| {
                conn.execute(
                    "INSERT INTO conversations (id, kind, created_by, direct_key, last_activity_at, created_at)
                     VALUES (?1, 'direct', ?2, ?3, ?4, ?4)",
                    rusqlite::params![
                        Uuid::new_v4().to_string(),
                        bob.to_string(),
                        direct_key(bob, alice),
                        to_sql_ts(t0())
                    ],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn group_creation_assigns_roles_and_announces() {
        let db = testing::db();
        let owner = testing::user(&db, "owner");
        let a = testing::user(&db, "a");
        let b = testing::user(&db, "b");

        let group = db
            .create_group(owner, &[a, b, a, owner], Some("  Study pod  ".into()), None, t0())
            .unwrap();
        assert_eq!(group.kind, ConversationKind::Group);
        assert_eq!(group.name.as_deref(), Some("Study pod"));

        let (_, participants) = db.get_conversation(group.id, a).unwrap();
        assert_eq!(participants.len(), 3);
        let owners = participants.iter().filter(|(m, _)| m.role == Role::Owner).count();
        assert_eq!(owners, 1);

        let history = db.list_messages(group.id, a, &Page::default()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, MessageKind::System);
        assert_eq!(history[0].metadata, Some(SystemEvent::ConversationCreated));

        assert!(matches!(db.create_group(owner, &[owner], None, None, t0()), Err(StoreError::Invalid(_))));
        assert!(matches!(
            db.create_group(owner, &[Uuid::new_v4()], None, None, t0()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn settings_require_group_and_manager_role() {
        let db = testing::db();
        let owner = testing::user(&db, "owner");
        let member = testing::user(&db, "member");
        let group = db.create_group(owner, &[member], Some("old".into()), None, t0()).unwrap();
        let (direct, _) = db.create_or_get_direct(owner, member, t0()).unwrap();

        let rename = UpdateConversationRequest {
            name: Some("new".into()),
            ..Default::default()
        };

        assert!(matches!(
            db.update_settings(direct.id, owner, &rename, t0()),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.update_settings(group.id, member, &rename, t0()),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.update_settings(Uuid::new_v4(), owner, &rename, t0()),
            Err(StoreError::NotFound(_))
        ));

        let (updated, system) = db.update_settings(group.id, owner, &rename, t0()).unwrap();
        assert_eq!(updated.name.as_deref(), Some("new"));
        let system = system.unwrap();
        assert_eq!(system.kind, MessageKind::System);
        assert_eq!(
            system.metadata,
            Some(SystemEvent::ConversationRenamed {
                old_name: Some("old".into()),
                new_name: "new".into()
            })
        );
        assert_eq!(updated.last_message_preview, system.content);

        // Same name again: no new system message.
        let (_, none) = db.update_settings(group.id, owner, &rename, t0()).unwrap();
        assert!(none.is_none());

        // Promoted admins may edit too.
        db.set_role(group.id, owner, member, Role::Admin).unwrap();
        let describe = UpdateConversationRequest {
            description: Some("weekly sync".into()),
            ..Default::default()
        };
        let (updated, none) = db.update_settings(group.id, member, &describe, t0()).unwrap();
        assert_eq!(updated.description.as_deref(), Some("weekly sync"));
        assert!(none.is_none());
    }

    #[test]
    fn membership_changes() {
        let db = testing::db();
        let owner = testing::user(&db, "owner");
        let admin = testing::user(&db, "admin");
        let member = testing::user(&db, "member");
        let late = testing::user(&db, "late");
        let group = db.create_group(owner, &[admin, member], None, None, t0()).unwrap();
        db.set_role(group.id, owner, admin, Role::Admin).unwrap();

        assert!(matches!(
            db.remove_participant(group.id, member, admin, t0()),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.remove_participant(group.id, admin, owner, t0()),
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            db.set_role(group.id, owner, admin, Role::Owner),
            Err(StoreError::Forbidden(_))
        ));

        db.add_participants(group.id, admin, &[late], t0()).unwrap();
        assert!(db.check_membership(group.id, late).unwrap().is_active());

        db.remove_participant(group.id, admin, member, t0()).unwrap();
        assert_eq!(db.check_membership(group.id, member).unwrap().status, MemberStatus::Removed);
        assert!(matches!(
            db.list_messages(group.id, member, &Page::default()),
            Err(StoreError::NotAParticipant)
        ));

        db.leave_conversation(group.id, late, t0()).unwrap();
        assert_eq!(db.check_membership(group.id, late).unwrap().status, MemberStatus::Left);
        assert!(matches!(
            db.leave_conversation(group.id, owner, t0()),
            Err(StoreError::Forbidden(_))
        ));

        // Re-adding a removed member re-activates them.
        db.add_participants(group.id, owner, &[member], t0()).unwrap();
        let membership = db.check_membership(group.id, member).unwrap();
        assert!(membership.is_active());
        assert_eq!(membership.role, Role::Member);

        let listed: Vec<Uuid> = db.list_conversations(late).unwrap().into_iter().map(|(c, _)| c.id).collect();
        assert!(listed.is_empty());
    }

    #[test]
    fn conversation_list_orders_by_activity() {
        let db = testing::db();
        let alice = testing::user(&db, "alice");
        let bob = testing::user(&db, "bob");
        let carol = testing::user(&db, "carol");

        let (with_bob, _) = db.create_or_get_direct(alice, bob, t0()).unwrap();
        let (with_carol, _) = db.create_or_get_direct(alice, carol, t0()).unwrap();

        let later = t0() + chrono::Duration::minutes(1);
        db.append_message(
            crate::messages::NewMessage {
                conversation_id: with_bob.id,
                sender_id: bob,
                content: Some("ping".into()),
                kind: MessageKind::Text,
                reply_to: None,
                attachments: Vec::new(),
            },
            later,
        )
        .unwrap();

        let listed = db.list_conversations(alice).unwrap();
        assert_eq!(listed[0].0.id, with_bob.id);
        assert_eq!(listed[0].1, 1);
        assert_eq!(listed[1].0.id, with_carol.id);
        assert_eq!(listed[1].1, 0);
    }
}
