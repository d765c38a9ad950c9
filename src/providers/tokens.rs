//! Character-based token estimation and history trimming.
//!
//! Used when an upstream omits usage, for the partial counts of aborted
//! streams, and for fitting history into a model's context window.

use crate::providers::types::ChatMessage;

/// Estimated tokens for a piece of text: characters / 4, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

pub fn estimate_message(message: &ChatMessage) -> u32 {
    let mut total = estimate_tokens(&message.text_content());
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            total = total
                .saturating_add(estimate_tokens(&call.function.name))
                .saturating_add(estimate_tokens(&call.function.arguments));
        }
    }
    total
}

/// Estimated prompt size; at least one token for a non-empty conversation.
pub fn estimate_prompt(messages: &[ChatMessage]) -> u32 {
    let total = messages
        .iter()
        .map(estimate_message)
        .fold(0u32, u32::saturating_add);
    if messages.is_empty() { 0 } else { total.max(1) }
}

/// Keep every instruction message plus the newest other messages that fit
/// `budget`. The newest message is always kept. Order is preserved.
pub fn trim_history(messages: &[ChatMessage], budget: u32) -> Vec<ChatMessage> {
    let instructions: u32 = messages
        .iter()
        .filter(|m| m.role.is_instruction())
        .map(estimate_message)
        .fold(0, u32::saturating_add);

    let mut remaining = budget.saturating_sub(instructions);
    let mut keep = vec![false; messages.len()];
    let mut kept_any = false;

    for (i, message) in messages.iter().enumerate().rev() {
        if message.role.is_instruction() {
            keep[i] = true;
            continue;
        }
        let cost = estimate_message(message);
        if cost <= remaining || !kept_any {
            remaining = remaining.saturating_sub(cost);
            keep[i] = true;
            kept_any = true;
        } else {
            // Older turns are dropped as a block once one does not fit.
            remaining = 0;
        }
    }

    messages
        .iter()
        .zip(keep)
        .filter_map(|(m, k)| k.then(|| m.clone()))
        .collect()
}
