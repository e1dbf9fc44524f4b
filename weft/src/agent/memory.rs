//! Bounded conversation memory: a ring buffer of user/agent exchanges.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

#[derive(Clone, Debug)]
pub struct ConversationTurn {
    pub user_input: String,
    pub agent_response: String,
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct ConversationMemory {
    max_turns: usize,
    turns: VecDeque<ConversationTurn>,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            turns: VecDeque::new(),
        }
    }

    pub fn add_exchange(
        &mut self,
        user_input: impl Into<String>,
        agent_response: impl Into<String>,
        execution_time: f64,
    ) {
        if self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(ConversationTurn {
            user_input: user_input.into(),
            agent_response: agent_response.into(),
            execution_time,
            timestamp: Utc::now(),
        });
    }

    /// The most recent `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_at_max_turns() {
        let mut memory = ConversationMemory::new(3);
        for i in 0..5 {
            memory.add_exchange(format!("q{}", i), format!("a{}", i), 0.1);
        }
        assert_eq!(memory.len(), 3);
        let recent = memory.recent(10);
        assert_eq!(recent[0].user_input, "q2");
        assert_eq!(recent[2].user_input, "q4");
    }

    #[test]
    fn recent_returns_newest_last() {
        let mut memory = ConversationMemory::new(10);
        memory.add_exchange("first", "one", 0.0);
        memory.add_exchange("second", "two", 0.0);
        memory.add_exchange("third", "three", 0.0);
        let recent = memory.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_input, "second");
        assert_eq!(recent[1].user_input, "third");
    }

    #[test]
    fn clear_empties_history() {
        let mut memory = ConversationMemory::new(5);
        memory.add_exchange("q", "a", 0.0);
        assert!(!memory.is_empty());
        memory.clear();
        assert!(memory.is_empty());
    }
}
