//! Context truncation: bound a message history to a message count and token
//! budget before it is sent to any provider.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::tokens::{estimate_history, estimate_message};
use crate::types::{Message, Role, TaskType};

/// How to choose which messages survive truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Drop the oldest messages first
    Recent,
    /// Keep whole (user, assistant) pairs, newest first
    #[default]
    SlidingWindow,
    /// Summarize dropped turns. No summarization adapter exists yet, so this
    /// currently truncates like `Recent`.
    Summary,
}

impl ContextStrategy {
    pub fn is_implemented(&self) -> bool {
        !matches!(self, Self::Summary)
    }
}

/// Bounds applied to one (task, provider) pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_messages: usize,
    pub max_token_budget: u64,
    #[serde(default)]
    pub strategy: ContextStrategy,
}

impl ContextConfig {
    pub fn new(
        max_messages: usize,
        max_token_budget: u64,
        strategy: ContextStrategy,
    ) -> Result<Self, ValidationError> {
        let config = Self {
            max_messages,
            max_token_budget,
            strategy,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_messages == 0 {
            return Err(ValidationError::InvalidParameter {
                field: "max_messages",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_token_budget: 6000,
            strategy: ContextStrategy::SlidingWindow,
        }
    }
}

/// Derived description of a truncated history. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    pub message_count: usize,
    pub estimated_tokens: u64,
    pub truncated: bool,
}

/// Context bounds per (task, provider), with a fallback default
#[derive(Debug, Clone, Default)]
pub struct ContextPolicy {
    default: ContextConfig,
    overrides: HashMap<(TaskType, String), ContextConfig>,
}

impl ContextPolicy {
    pub fn new(default: ContextConfig) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(
        mut self,
        task: TaskType,
        provider_id: impl Into<String>,
        config: ContextConfig,
    ) -> Self {
        self.overrides.insert((task, provider_id.into()), config);
        self
    }

    pub fn config_for(&self, task: TaskType, provider_id: &str) -> ContextConfig {
        self.overrides
            .get(&(task, provider_id.to_string()))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Bound `messages` by `config`.
///
/// The result never exceeds `max_messages`, and stays within `max_token_budget`
/// unless that would leave nothing, in which case only the newest message is kept.
pub fn truncate(messages: &[Message], config: &ContextConfig) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let kept = match config.strategy {
        ContextStrategy::Recent => keep_recent(messages, config),
        ContextStrategy::SlidingWindow => keep_pairs(messages, config),
        ContextStrategy::Summary => {
            warn!("No summarization adapter configured; 'summary' strategy truncates like 'recent'");
            keep_recent(messages, config)
        }
    };

    let result = if kept == 0 {
        debug!("Newest message alone exceeds the context budget, keeping it anyway");
        &messages[messages.len() - 1..]
    } else {
        &messages[messages.len() - kept..]
    };

    if result.len() < messages.len() {
        debug!(
            "Truncated context from {} to {} messages ({:?})",
            messages.len(),
            result.len(),
            config.strategy
        );
    }

    result.to_vec()
}

/// Stats for the history `truncate` would produce
pub fn stats(messages: &[Message], config: &ContextConfig) -> ContextStats {
    let kept = truncate(messages, config);
    ContextStats {
        message_count: kept.len(),
        estimated_tokens: estimate_history(&kept),
        truncated: kept.len() < messages.len(),
    }
}

/// Length of the longest suffix within both bounds
fn keep_recent(messages: &[Message], config: &ContextConfig) -> usize {
    let mut kept = 0;
    let mut tokens = 0;
    for message in messages.iter().rev() {
        let cost = estimate_message(message);
        if kept + 1 > config.max_messages || tokens + cost > config.max_token_budget {
            break;
        }
        kept += 1;
        tokens += cost;
    }
    kept
}

/// Length of the longest suffix made of whole turn groups within both bounds
fn keep_pairs(messages: &[Message], config: &ContextConfig) -> usize {
    let mut kept = 0;
    let mut tokens = 0;
    for group in turn_groups(messages).iter().rev() {
        let cost = estimate_history(group);
        if kept + group.len() > config.max_messages || tokens + cost > config.max_token_budget {
            break;
        }
        kept += group.len();
        tokens += cost;
    }
    kept
}

/// Split a history into ordered turn groups: a user message with the assistant
/// reply that follows it, a trailing unanswered user message, or an assistant
/// message with no user message before it.
fn turn_groups(messages: &[Message]) -> Vec<&[Message]> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let paired = messages[i].role == Role::User
            && messages.get(i + 1).is_some_and(|m| m.role == Role::Assistant);
        let len = if paired { 2 } else { 1 };
        groups.push(&messages[i..i + len]);
        i += len;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(pairs: usize) -> Vec<Message> {
        (0..pairs)
            .flat_map(|i| {
                [
                    Message::user(format!("question {}", i)),
                    Message::assistant(format!("answer {}", i)),
                ]
            })
            .collect()
    }

    fn config(max_messages: usize, max_token_budget: u64, strategy: ContextStrategy) -> ContextConfig {
        ContextConfig::new(max_messages, max_token_budget, strategy).unwrap()
    }

    #[test]
    fn test_zero_max_messages_rejected() {
        assert!(ContextConfig::new(0, 100, ContextStrategy::Recent).is_err());
    }

    #[test]
    fn test_empty_history_stays_empty() {
        let cfg = config(4, 100, ContextStrategy::SlidingWindow);
        assert!(truncate(&[], &cfg).is_empty());
    }

    #[test]
    fn test_recent_keeps_last_messages() {
        let msgs = conversation(5);
        let cfg = config(4, 100_000, ContextStrategy::Recent);
        let out = truncate(&msgs, &cfg);
        assert_eq!(out, msgs[6..].to_vec());
    }

    #[test]
    fn test_recent_respects_token_budget() {
        let msgs = conversation(5);
        let one = estimate_message(&msgs[9]);
        let two = one + estimate_message(&msgs[8]);
        let cfg = config(10, two, ContextStrategy::Recent);
        let out = truncate(&msgs, &cfg);
        assert_eq!(out.len(), 2);
        assert!(estimate_history(&out) <= two);
    }

    #[test]
    fn test_newest_message_survives_zero_budget() {
        let msgs = conversation(3);
        for strategy in [ContextStrategy::Recent, ContextStrategy::SlidingWindow, ContextStrategy::Summary] {
            let out = truncate(&msgs, &config(5, 0, strategy));
            assert_eq!(out, vec![msgs[5].clone()]);
        }
    }

    #[test]
    fn test_sliding_window_keeps_trailing_user_message() {
        let mut msgs = conversation(3);
        msgs.push(Message::user("still waiting for an answer"));
        let trailing = estimate_message(&msgs[6]);
        let last_pair = estimate_history(&msgs[4..6]);
        let cfg = config(10, trailing + last_pair, ContextStrategy::SlidingWindow);
        let out = truncate(&msgs, &cfg);
        assert_eq!(out, msgs[4..].to_vec());
        assert_eq!(out.last().unwrap().content, "still waiting for an answer");
    }

    #[test]
    fn test_sliding_window_never_splits_a_pair() {
        let msgs = conversation(4);
        // Room for three messages, but only one whole pair fits
        let cfg = config(3, 100_000, ContextStrategy::SlidingWindow);
        let out = truncate(&msgs, &cfg);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[1].role, Role::Assistant);
    }

    #[test]
    fn test_sliding_window_stops_at_first_overflowing_pair() {
        let mut msgs = conversation(1);
        msgs.push(Message::user("x".repeat(400)));
        msgs.push(Message::assistant("long answer"));
        msgs.extend(conversation(1));
        let budget = estimate_history(&msgs[4..]) + 10;
        let out = truncate(&msgs, &config(10, budget, ContextStrategy::SlidingWindow));
        assert_eq!(out, msgs[4..].to_vec());
    }

    #[test]
    fn test_sliding_window_orphan_assistant_is_its_own_group() {
        let msgs = vec![
            Message::assistant("welcome"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let groups = turn_groups(&msgs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn test_bounds_and_idempotence_across_configs() {
        let mut msgs = conversation(6);
        msgs.push(Message::user("你好，世界"));
        for strategy in [ContextStrategy::Recent, ContextStrategy::SlidingWindow, ContextStrategy::Summary] {
            for max_messages in 1..=14 {
                for budget in [0, 5, 12, 30, 60, 10_000] {
                    let cfg = config(max_messages, budget, strategy);
                    let once = truncate(&msgs, &cfg);
                    assert!(!once.is_empty());
                    assert!(once.len() <= max_messages);
                    if once.len() > 1 {
                        assert!(estimate_history(&once) <= budget);
                    }
                    assert_eq!(truncate(&once, &cfg), once);
                }
            }
        }
    }

    #[test]
    fn test_stats_report_truncation() {
        let msgs = conversation(5);
        let s = stats(&msgs, &config(4, 100_000, ContextStrategy::Recent));
        assert_eq!(s.message_count, 4);
        assert!(s.truncated);
        assert_eq!(s.estimated_tokens, estimate_history(&msgs[6..]));

        let s = stats(&msgs, &config(20, 100_000, ContextStrategy::Recent));
        assert!(!s.truncated);
    }

    #[test]
    fn test_policy_override_lookup() {
        let narrow = config(2, 50, ContextStrategy::Recent);
        let policy = ContextPolicy::new(ContextConfig::default()).with_override(TaskType::Chat, "local", narrow);
        assert_eq!(policy.config_for(TaskType::Chat, "local"), narrow);
        assert_eq!(policy.config_for(TaskType::Chat, "openai"), ContextConfig::default());
        assert_eq!(policy.config_for(TaskType::Optimize, "local"), ContextConfig::default());
    }

    #[test]
    fn test_summary_is_flagged_unimplemented() {
        assert!(!ContextStrategy::Summary.is_implemented());
        assert!(ContextStrategy::Recent.is_implemented());
    }
}
