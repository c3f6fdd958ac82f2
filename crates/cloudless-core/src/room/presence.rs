//! Online set and typing indicators.

use std::collections::{BTreeSet, HashMap};

/// Who is online, who is typing, and what to call them.
#[derive(Debug, Default, Clone)]
pub struct Presence {
    online: BTreeSet<String>,
    typing: BTreeSet<String>,
    names: HashMap<String, String>,
}

/// Changes caused by an `online_users` snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PresenceDiff {
    /// Users that came online
    pub joined: Vec<String>,
    /// Users that went offline
    pub left: Vec<String>,
}

impl Presence {
    /// Empty presence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a display name.
    pub fn set_name(&mut self, user_id: &str, name: &str) {
        if !name.is_empty() {
            self.names.insert(user_id.to_string(), name.to_string());
        }
    }

    /// Display name, falling back to the user id.
    #[must_use]
    pub fn name<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.names.get(user_id).map_or(user_id, String::as_str)
    }

    /// Mark one user online. Returns `true` if that changed anything.
    pub fn mark_online(&mut self, user_id: &str) -> bool {
        self.online.insert(user_id.to_string())
    }

    /// Mark one user offline. Also clears their typing flag.
    pub fn mark_offline(&mut self, user_id: &str) -> bool {
        self.typing.remove(user_id);
        self.online.remove(user_id)
    }

    /// Replace the online set with a server snapshot.
    pub fn set_online_users(&mut self, users: &[String]) -> PresenceDiff {
        let next: BTreeSet<String> = users.iter().cloned().collect();
        let diff = PresenceDiff {
            joined: next.difference(&self.online).cloned().collect(),
            left: self.online.difference(&next).cloned().collect(),
        };
        for user in &diff.left {
            self.typing.remove(user);
        }
        self.online = next;
        diff
    }

    /// Set a typing flag. Returns `true` if it changed.
    pub fn set_typing(&mut self, user_id: &str, is_typing: bool) -> bool {
        if is_typing {
            self.typing.insert(user_id.to_string())
        } else {
            self.typing.remove(user_id)
        }
    }

    /// Whether `user_id` is online.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Online user ids, sorted.
    #[must_use]
    pub fn online(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    /// Ids of users currently typing, sorted.
    #[must_use]
    pub fn typing(&self) -> Vec<String> {
        self.typing.iter().cloned().collect()
    }

    /// Typing users as `(user_id, display name)` pairs.
    #[must_use]
    pub fn typing_names(&self) -> Vec<(String, String)> {
        self.typing
            .iter()
            .map(|u| (u.clone(), self.name(u).to_string()))
            .collect()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.online.clear();
        self.typing.clear();
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_diff() {
        let mut presence = Presence::new();
        presence.mark_online("a");
        presence.mark_online("b");
        presence.set_typing("b", true);

        let diff = presence.set_online_users(&["a".into(), "c".into()]);
        assert_eq!(diff.joined, vec!["c".to_string()]);
        assert_eq!(diff.left, vec!["b".to_string()]);
        assert!(presence.typing().is_empty());
        assert_eq!(presence.online(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_typing_reports_ids() {
        let mut presence = Presence::new();
        presence.set_name("u1", "Alice");
        assert!(presence.set_typing("u1", true));
        assert!(!presence.set_typing("u1", true));
        assert!(presence.set_typing("u2", true));
        assert_eq!(presence.typing(), vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(
            presence.typing_names(),
            vec![
                ("u1".to_string(), "Alice".to_string()),
                ("u2".to_string(), "u2".to_string()),
            ]
        );

        assert!(presence.set_typing("u1", false));
        presence.mark_offline("u2");
        assert!(presence.typing().is_empty());
    }

    #[test]
    fn test_empty_name_ignored() {
        let mut presence = Presence::new();
        presence.set_name("u1", "");
        assert_eq!(presence.name("u1"), "u1");
    }
}
