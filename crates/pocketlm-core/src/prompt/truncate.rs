//! Keep-latest history truncation.

use pocketlm_types::{ChatMessage, Role};

/// Result of fitting a history into a character budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Truncation {
    pub messages: Vec<ChatMessage>,
    /// Older turns were dropped.
    pub truncated: bool,
    /// Even the system message plus the latest message exceed the budget;
    /// both were kept anyway.
    pub overflow: bool,
}

/// Fit `messages` into `budget` characters of content.
///
/// System messages are always kept verbatim. The rest is walked backwards
/// from the newest message; whole messages are kept while they fit, and the
/// first one that does not fit ends the walk, dropping it and everything
/// older. The newest message is kept even when it alone is over budget.
pub fn keep_latest(messages: &[ChatMessage], budget: usize) -> Truncation {
    let cost = |m: &ChatMessage| m.content.chars().count();

    let system: Vec<&ChatMessage> = messages.iter().filter(|m| m.role == Role::System).collect();
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let system_cost: usize = system.iter().map(|m| cost(m)).sum();
    let mut remaining = budget.saturating_sub(system_cost);
    let mut overflow = system_cost > budget;

    let mut kept_rev: Vec<&ChatMessage> = Vec::new();
    for (i, m) in turns.iter().rev().enumerate() {
        let c = cost(m);
        if c <= remaining {
            remaining -= c;
            kept_rev.push(m);
        } else if i == 0 {
            overflow = true;
            remaining = 0;
            kept_rev.push(m);
        } else {
            break;
        }
    }

    let truncated = kept_rev.len() < turns.len();
    let messages = system
        .into_iter()
        .chain(kept_rev.into_iter().rev())
        .cloned()
        .collect();

    Truncation {
        messages,
        truncated,
        overflow,
    }
}

/// Drop the oldest non-system message of an already fitted history, for
/// when the rendered prompt is still over budget. Returns `false` when only
/// the newest turn is left.
pub fn drop_oldest_turn(fit: &mut Truncation) -> bool {
    let turns = fit.messages.iter().filter(|m| m.role != Role::System).count();
    if turns < 2 {
        return false;
    }
    let Some(oldest) = fit.messages.iter().position(|m| m.role != Role::System) else {
        return false;
    };
    fit.messages.remove(oldest);
    fit.truncated = true;
    true
}

/// Total content length in characters.
pub fn content_len(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.chars().count()).sum()
}
