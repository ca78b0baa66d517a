//! Bounded in-memory conversation window

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Turns kept in the window
pub const MAX_TURNS: usize = 10;

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message as sent to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Length in characters, the unit token estimates are based on
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// Most recent user/assistant turns, oldest evicted first
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<Turn>,
    cap: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::with_capacity(MAX_TURNS)
    }
}

impl ConversationHistory {
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// Append a turn, evicting the oldest past the cap
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.cap {
            self.turns.pop_front();
        }
    }

    /// Remove the newest turn if it has `role`
    pub fn rollback(&mut self, role: Role) -> Option<Turn> {
        if self.turns.back().is_some_and(|t| t.role == role) {
            self.turns.pop_back()
        } else {
            None
        }
    }

    /// Drop oldest turns until `fits` accepts the window, keeping the newest
    pub fn truncate_until(&mut self, fits: impl Fn(&Self) -> bool) {
        while self.turns.len() > 1 && !fits(self) {
            self.turns.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eleventh_turn_evicts_the_oldest() {
        let mut h = ConversationHistory::default();
        for i in 0..11 {
            h.push(Turn::new(Role::User, format!("q{i}")));
        }

        assert_eq!(h.len(), 10);
        let contents: Vec<_> = h.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents.first(), Some(&"q1"));
        assert_eq!(contents.last(), Some(&"q10"));
    }

    #[test]
    fn rollback_only_pops_matching_role() {
        let mut h = ConversationHistory::default();
        h.push(Turn::new(Role::User, "hi"));
        assert!(h.rollback(Role::Assistant).is_none());
        assert_eq!(h.rollback(Role::User).unwrap().content, "hi");
        assert!(h.is_empty());
    }

    #[test]
    fn truncation_keeps_newest_turn() {
        let mut h = ConversationHistory::default();
        h.push(Turn::new(Role::User, "aaaa"));
        h.push(Turn::new(Role::Assistant, "bbbb"));
        h.push(Turn::new(Role::User, "cccccccc"));

        h.truncate_until(|w| w.iter().map(Turn::char_len).sum::<usize>() <= 12);
        assert_eq!(h.len(), 2);

        h.truncate_until(|_| false);
        assert_eq!(h.len(), 1);
        assert_eq!(h.iter().next().unwrap().content, "cccccccc");
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&Turn::new(Role::Assistant, "x")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"x"}"#);
    }
}
