use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::{Notification, NotificationKind};

/// Receives a signal for every newly persisted inbound message.
pub trait Notifier {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Notifications are queued in the `notifications` table until seen.
impl Notifier for Database {
    fn notify(&self, notification: &Notification) -> Result<()> {
        self.conn().execute(
            "INSERT INTO notifications (user_id, kind, actor_id, message_id, preview, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                notification.user_id,
                notification.kind.as_str(),
                notification.actor_id,
                notification.message_id,
                notification.preview,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::debug!(
            user_id = %notification.user_id,
            kind = notification.kind.as_str(),
            "notification queued"
        );
        Ok(())
    }
}

/// Lets a store shared behind a mutex act as the notifier too.
impl<N: Notifier> Notifier for Mutex<N> {
    fn notify(&self, notification: &Notification) -> Result<()> {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .notify(notification)
    }
}

impl Database {
    /// Unseen notifications for `user_id`, oldest first.
    pub fn unseen_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, actor_id, message_id, preview
             FROM notifications
             WHERE user_id = ?1 AND seen = 0 AND kind = 'MESSAGE'
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(Notification {
                user_id: row.get(0)?,
                kind: NotificationKind::Message,
                actor_id: row.get(1)?,
                message_id: row.get(2)?,
                preview: row.get(3)?,
            })
        })?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    /// Flag every notification of `user_id` as seen. Returns how many changed.
    pub fn mark_notifications_seen(&self, user_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE notifications SET seen = 1 WHERE user_id = ?1 AND seen = 0",
            params![user_id],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(user_id: &str, preview: &str) -> Notification {
        Notification {
            user_id: user_id.into(),
            kind: NotificationKind::Message,
            actor_id: "alice".into(),
            message_id: Some("1-abcdefgh".into()),
            preview: preview.into(),
        }
    }

    #[test]
    fn test_notify_queues_until_seen() {
        let db = Database::open_in_memory().unwrap();
        db.notify(&notification("bob", "first")).unwrap();
        db.notify(&notification("bob", "second")).unwrap();
        db.notify(&notification("carol", "other")).unwrap();

        let unseen = db.unseen_notifications("bob").unwrap();
        assert_eq!(unseen.len(), 2);
        assert_eq!(unseen[0].preview, "first");

        assert_eq!(db.mark_notifications_seen("bob").unwrap(), 2);
        assert!(db.unseen_notifications("bob").unwrap().is_empty());
        assert_eq!(db.unseen_notifications("carol").unwrap().len(), 1);
    }

    #[test]
    fn test_mutex_wrapped_store_notifies() {
        let db = Mutex::new(Database::open_in_memory().unwrap());
        Notifier::notify(&db, &notification("bob", "hi")).unwrap();

        let guard = db.lock().unwrap();
        assert_eq!(guard.unseen_notifications("bob").unwrap().len(), 1);
    }
}
