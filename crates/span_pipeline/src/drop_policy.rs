//! Queue overflow handling strategies for span buffering.

use crate::invariants::debug_assert_bounded_queue;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Result of offering an item to a bounded queue
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// Appended without displacing anything
    Queued,
    /// Appended after evicting the returned (oldest) item
    Evicted(T),
    /// Not appended; the incoming item is handed back
    Rejected(T),
}

impl<T> Admission<T> {
    /// Returns `true` if the offered item is now in the queue
    pub fn inserted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// How a bounded queue behaves when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest item to make room (favors recency)
    #[default]
    DropOldest,
    /// Reject the incoming item, leaving the queue unchanged
    DropNewest,
}

impl DropPolicy {
    /// Offers `item` to `queue`, never letting it grow past `max_size`. O(1).
    pub fn handle<T>(self, queue: &mut VecDeque<T>, item: T, max_size: usize) -> Admission<T> {
        if queue.len() < max_size {
            queue.push_back(item);
            debug_assert_bounded_queue!(queue.len(), max_size);
            return Admission::Queued;
        }

        match self {
            Self::DropOldest => match queue.pop_front() {
                Some(evicted) => {
                    queue.push_back(item);
                    debug_assert_bounded_queue!(queue.len(), max_size);
                    Admission::Evicted(evicted)
                }
                // max_size == 0: nothing to evict and nowhere to put it
                None => Admission::Rejected(item),
            },
            Self::DropNewest => Admission::Rejected(item),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
        }
    }
}
