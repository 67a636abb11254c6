//! Works out which part of a CRM conversation is new for the assistant.
//!
//! The CRM has no "messages since" cursor, so the only anchor is the literal
//! body of the message that triggered the webhook. History is scanned from
//! newest to oldest until that body is seen; inbound messages passed on the
//! way are the new turns.
//!
//! Matching is exact body equality and the most recent occurrence wins. A
//! repeated or edited body therefore cuts the scan short.

use crate::types::{Direction, Message, Turn};

/// Returns the new user turns, oldest first.
///
/// `history` must be newest-first, as the CRM returns it. When no message
/// matches `marker` the marker itself becomes the only turn. An empty result
/// means the match was reached without passing any inbound message.
pub fn reconcile(history: &[Message], marker: &str) -> Vec<Turn> {
    let Some(stop) = history.iter().position(|message| message.body == marker) else {
        return vec![Turn::user(marker)];
    };

    history[..=stop]
        .iter()
        .rev()
        .filter(|message| message.direction == Direction::Inbound)
        .map(|message| Turn::user(message.body.as_str()))
        .collect()
}
