//! In-memory notification list and the edits applied to it.

use crate::db::{Comment, Notification, NotificationRow, NotificationStatus};

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A user-initiated change to one notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotificationEdit {
    SetStatus {
        status: NotificationStatus,
        user_id: String,
    },
    AddComment {
        text: String,
        user_id: String,
    },
}

impl NotificationEdit {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            NotificationEdit::SetStatus { user_id, .. } if user_id.trim().is_empty() => {
                Err("user_id is required".to_string())
            }
            NotificationEdit::AddComment { text, user_id } => {
                if user_id.trim().is_empty() {
                    Err("user_id is required".to_string())
                } else if text.trim().is_empty() {
                    Err("comment text is empty".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// Result of applying an edit to a known notification.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    /// State changed; carries the notification as it was before the edit.
    Applied { snapshot: Notification },
    /// The edit matched current state.
    Unchanged,
}

/// Notifications ordered newest first.
#[derive(Debug, Default)]
pub struct NotificationBook {
    items: Vec<Notification>,
}

impl NotificationBook {
    pub fn new(items: Vec<Notification>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Notification> {
        self.items.iter_mut().find(|n| n.id == id)
    }

    /// Whether `n` is already listed, by id or by provider id.
    pub fn contains(&self, n: &Notification) -> bool {
        self.items.iter().any(|existing| {
            existing.id == n.id
                || matches!(
                    (&existing.provider_id, &n.provider_id),
                    (Some(a), Some(b)) if a == b
                )
        })
    }

    /// Prepend a notification unless it is a duplicate.
    pub fn insert(&mut self, n: Notification) -> bool {
        if self.contains(&n) {
            return false;
        }
        self.items.insert(0, n);
        true
    }

    /// Apply an edit optimistically. `None` if the id is unknown.
    pub fn apply_edit(
        &mut self,
        id: &str,
        edit: &NotificationEdit,
        now: DateTime<Utc>,
    ) -> Option<EditOutcome> {
        let n = self.get_mut(id)?;
        let snapshot = n.clone();

        match edit {
            NotificationEdit::SetStatus { status, user_id } => {
                if n.status == *status {
                    return Some(EditOutcome::Unchanged);
                }
                n.status = *status;
                n.comments.push(Comment::status_change(id, user_id, *status));
            }
            NotificationEdit::AddComment { text, user_id } => {
                n.comments.push(Comment::new(id, user_id, text.trim()));
            }
        }
        n.updated_at = now;

        Some(EditOutcome::Applied { snapshot })
    }

    /// Merge a remote row over local state, keeping local comments.
    pub fn merge_remote(&mut self, row: NotificationRow) -> bool {
        match self.get_mut(&row.id) {
            Some(n) => {
                n.merge_row(row);
                true
            }
            None => false,
        }
    }

    /// Attach a comment that arrived from elsewhere. Known comment ids are
    /// ignored.
    pub fn append_comment(&mut self, comment: Comment) -> bool {
        match self.get_mut(&comment.notification_id) {
            Some(n) if !n.comments.iter().any(|c| c.id == comment.id) => {
                n.comments.push(comment);
                true
            }
            _ => false,
        }
    }

    /// Put a snapshot back in place of the current entry.
    pub fn restore(&mut self, snapshot: Notification) -> bool {
        match self.get_mut(&snapshot.id) {
            Some(n) => {
                *n = snapshot;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        let idx = self.items.iter().position(|n| n.id == id)?;
        Some(self.items.remove(idx))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drop the oldest entries until at most `max` remain. Entries for which
    /// `keep` returns true are never dropped, so the list may stay longer.
    /// Returns how many were dropped.
    pub fn trim(&mut self, max: usize, keep: impl Fn(&str) -> bool) -> usize {
        let excess = self.items.len().saturating_sub(max);
        let mut dropped = 0;
        let mut idx = self.items.len();
        while idx > 0 && dropped < excess {
            idx -= 1;
            if !keep(&self.items[idx].id) {
                self.items.remove(idx);
                dropped += 1;
            }
        }
        dropped
    }
}

/// Comments present in `current` but not in `snapshot`.
pub fn comments_added_since(snapshot: &Notification, current: &Notification) -> Vec<Comment> {
    current
        .comments
        .iter()
        .filter(|c| !snapshot.comments.iter().any(|s| s.id == c.id))
        .cloned()
        .collect()
}
