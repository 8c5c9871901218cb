use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use courier_shared::protocol::Message;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ReadTarget, StoredMessage, User};

/// The persistence contract of the delivery path.
///
/// Both queries return newest first. `append_message` is idempotent on
/// `message_id` and reports whether the message was new.
pub trait MessageLog {
    fn find_messages_by_sender(&self, user_id: &str) -> Result<Vec<StoredMessage>>;

    fn find_messages_by_receiver(&self, user_id: &str) -> Result<Vec<StoredMessage>>;

    fn append_message(&self, message: &Message) -> Result<bool>;

    /// Returns the number of messages flipped to read.
    fn mark_read(&self, target: &ReadTarget) -> Result<usize>;

    /// Addresses of everyone `user_id` has exchanged messages with.
    fn counterpart_addresses(&self, user_id: &str) -> Result<Vec<String>>;
}

const SELECT_MESSAGES: &str = "
    SELECT m.message_id, m.timestamp, m.sender_id, m.sender_address, m.sender_name,
           m.receiver_id, m.receiver_address, m.content, m.read, u.display_name
    FROM messages m
    LEFT JOIN users u ON u.user_id = m.receiver_id";

impl MessageLog for Database {
    fn find_messages_by_sender(&self, user_id: &str) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "{SELECT_MESSAGES} WHERE m.sender_id = ?1 ORDER BY m.timestamp DESC, m.rowid DESC"
        );
        self.query_messages(&sql, user_id)
    }

    fn find_messages_by_receiver(&self, user_id: &str) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "{SELECT_MESSAGES} WHERE m.receiver_id = ?1 ORDER BY m.timestamp DESC, m.rowid DESC"
        );
        self.query_messages(&sql, user_id)
    }

    fn append_message(&self, message: &Message) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages
                (message_id, timestamp, sender_id, sender_address, sender_name,
                 receiver_id, receiver_address, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.message_id,
                to_sql_timestamp(message.timestamp),
                message.sender_id,
                message.sender_address,
                message.sender_name,
                message.receiver_id,
                message.receiver_address,
                message.content,
            ],
        )? > 0;

        if inserted {
            let now = Utc::now().to_rfc3339();
            upsert_user(&tx, &message.sender_id, &message.sender_address, &message.sender_name, &now)?;
            upsert_user(&tx, &message.receiver_id, &message.receiver_address, "", &now)?;
        } else {
            tracing::debug!(message_id = %message.message_id, "duplicate message ignored");
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn mark_read(&self, target: &ReadTarget) -> Result<usize> {
        let affected = match target {
            ReadTarget::Message(message_id) => self.conn().execute(
                "UPDATE messages SET read = 1 WHERE message_id = ?1 AND read = 0",
                params![message_id],
            )?,
            ReadTarget::AllFor(user_id) => self.conn().execute(
                "UPDATE messages SET read = 1 WHERE receiver_id = ?1 AND read = 0",
                params![user_id],
            )?,
        };
        Ok(affected)
    }

    fn counterpart_addresses(&self, user_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT receiver_address FROM messages WHERE sender_id = ?1
             UNION
             SELECT sender_address FROM messages WHERE receiver_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;

        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row?);
        }
        Ok(addresses)
    }
}

impl Database {
    pub fn get_message_by_id(&self, message_id: &str) -> Result<StoredMessage> {
        let sql = format!("{SELECT_MESSAGES} WHERE m.message_id = ?1");
        self.conn()
            .query_row(&sql, params![message_id], row_to_stored_message)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, address, display_name, updated_at FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, address, display_name, updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();

        Ok(Some(User {
            user_id,
            address,
            display_name,
            updated_at,
        }))
    }

    fn query_messages(&self, sql: &str, user_id: &str) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params![user_id], row_to_stored_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn upsert_user(
    conn: &rusqlite::Connection,
    user_id: &str,
    address: &str,
    display_name: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO users (user_id, address, display_name, updated_at)
         VALUES (?1, ?2, NULLIF(?3, ''), ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             address = excluded.address,
             display_name = COALESCE(excluded.display_name, users.display_name),
             updated_at = excluded.updated_at",
        params![user_id, address, display_name, now],
    )?;
    Ok(())
}

fn to_sql_timestamp(timestamp: u64) -> i64 {
    i64::try_from(timestamp).unwrap_or(i64::MAX)
}

fn row_to_stored_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let timestamp: Option<i64> = row.get(1)?;

    let message = Message {
        message_id: row.get(0)?,
        timestamp: timestamp.and_then(|t| u64::try_from(t).ok()).unwrap_or(0),
        sender_id: row.get(2)?,
        sender_address: row.get(3)?,
        sender_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        receiver_id: row.get(5)?,
        receiver_address: row.get(6)?,
        content: row.get(7)?,
    };

    Ok(StoredMessage {
        message,
        read: row.get::<_, i64>(8)? != 0,
        receiver_name: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: u64, from: (&str, &str), to: (&str, &str), content: &str) -> Message {
        Message {
            timestamp: ts,
            sender_id: from.0.into(),
            sender_address: from.1.into(),
            sender_name: String::new(),
            receiver_id: to.0.into(),
            receiver_address: to.1.into(),
            content: content.into(),
            message_id: id.into(),
        }
    }

    const U: (&str, &str) = ("u", "0xu");
    const A: (&str, &str) = ("a", "0xa");
    const B: (&str, &str) = ("b", "0xb");

    #[test]
    fn test_append_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let m = msg("1-aaaaaaaa", 1, U, A, "hi");

        assert!(db.append_message(&m).unwrap());
        assert!(!db.append_message(&m).unwrap());
        assert_eq!(db.find_messages_by_sender("u").unwrap().len(), 1);
    }

    #[test]
    fn test_queries_are_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&msg("5-aaaaaaaa", 5, U, A, "old")).unwrap();
        db.append_message(&msg("9-aaaaaaaa", 9, U, B, "new")).unwrap();
        db.append_message(&msg("7-aaaaaaaa", 7, A, U, "in")).unwrap();

        let sent: Vec<_> = db
            .find_messages_by_sender("u")
            .unwrap()
            .into_iter()
            .map(|s| s.message.content)
            .collect();
        assert_eq!(sent, ["new", "old"]);

        let received = db.find_messages_by_receiver("u").unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.content, "in");
        assert!(!received[0].read);
    }

    #[test]
    fn test_mark_read() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&msg("1-aaaaaaaa", 1, A, U, "one")).unwrap();
        db.append_message(&msg("2-aaaaaaaa", 2, B, U, "two")).unwrap();
        db.append_message(&msg("3-aaaaaaaa", 3, A, U, "three")).unwrap();

        assert_eq!(db.mark_read(&ReadTarget::Message("2-aaaaaaaa".into())).unwrap(), 1);
        assert!(db.get_message_by_id("2-aaaaaaaa").unwrap().read);
        assert!(!db.get_message_by_id("1-aaaaaaaa").unwrap().read);

        assert_eq!(db.mark_read(&ReadTarget::AllFor("u".into())).unwrap(), 2);
        assert!(db.find_messages_by_receiver("u").unwrap().iter().all(|m| m.read));
        assert_eq!(db.mark_read(&ReadTarget::AllFor("u".into())).unwrap(), 0);
    }

    #[test]
    fn test_missing_message_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_message_by_id("nope"), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_users_keep_last_known_name() {
        let db = Database::open_in_memory().unwrap();
        let mut named = msg("1-aaaaaaaa", 1, A, U, "hi");
        named.sender_name = "Alice".into();
        db.append_message(&named).unwrap();
        // A later message without a name does not erase it.
        db.append_message(&msg("2-aaaaaaaa", 2, A, U, "again")).unwrap();
        db.append_message(&msg("3-aaaaaaaa", 3, U, A, "back")).unwrap();

        let user = db.get_user("a").unwrap().unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Alice"));
        assert_eq!(user.address, "0xa");

        let sent = db.find_messages_by_sender("u").unwrap();
        assert_eq!(sent[0].receiver_name.as_deref(), Some("Alice"));
        assert!(db.get_user("nobody").unwrap().is_none());
    }

    #[test]
    fn test_counterpart_addresses() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&msg("1-aaaaaaaa", 1, U, A, "hi")).unwrap();
        db.append_message(&msg("2-aaaaaaaa", 2, A, U, "hey")).unwrap();
        db.append_message(&msg("3-aaaaaaaa", 3, B, U, "yo")).unwrap();

        let mut addresses = db.counterpart_addresses("u").unwrap();
        addresses.sort();
        assert_eq!(addresses, ["0xa", "0xb"]);
    }
}
