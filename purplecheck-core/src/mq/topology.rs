//! Exchange, queue, and binding layout plus topic-pattern matching

/// The single topic exchange all roles publish to
pub const EXCHANGE: &str = "checking.exchange";

pub const INSTRUCTIONS_QUEUE: &str = "instructions";
pub const API_TASKS_QUEUE: &str = "api.tasks";
pub const AGENT_TASKS_QUEUE: &str = "agent.tasks";
pub const API_RESPONSES_QUEUE: &str = "api.responses";
pub const AGENT_RESPONSES_QUEUE: &str = "agent.responses";
pub const DEAD_LETTER_QUEUE: &str = "dead.letter";

/// Instructions accept execution results from any upstream producer
pub const BIND_EXECUTION_RESULT: &str = "*.execution.result";

pub const RK_EXECUTION_RESULT: &str = "caldera.execution.result";
pub const RK_API_TASK: &str = "checking.api.task";
pub const RK_AGENT_TASK: &str = "checking.agent.task";
pub const RK_API_RESPONSE: &str = "checking.api.response";
pub const RK_AGENT_RESPONSE: &str = "checking.agent.response";

/// One durable queue bound to the exchange by a topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub pattern: String,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            pattern: pattern.into(),
        }
    }
}

/// The engine's full queue topology, including the dead-letter route
pub fn standard_bindings(dead_letter_routing_key: &str) -> Vec<QueueBinding> {
    vec![
        QueueBinding::new(INSTRUCTIONS_QUEUE, BIND_EXECUTION_RESULT),
        QueueBinding::new(API_TASKS_QUEUE, RK_API_TASK),
        QueueBinding::new(AGENT_TASKS_QUEUE, RK_AGENT_TASK),
        QueueBinding::new(API_RESPONSES_QUEUE, RK_API_RESPONSE),
        QueueBinding::new(AGENT_RESPONSES_QUEUE, RK_AGENT_RESPONSE),
        QueueBinding::new(DEAD_LETTER_QUEUE, dead_letter_routing_key),
    ]
}

/// Topic-pattern match: `.`-separated words, `*` matches exactly one word,
/// `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => {
            key.first() == Some(word) && matches_words(rest, &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("checking.api.task", "checking.api.task"));
        assert!(!topic_matches("checking.api.task", "checking.agent.task"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("*.execution.result", "caldera.execution.result"));
        assert!(topic_matches("*.execution.result", "other.execution.result"));
        assert!(!topic_matches("*.execution.result", "a.b.execution.result"));
        assert!(!topic_matches("*.execution.result", "execution.result"));
    }

    #[test]
    fn test_hash_matches_zero_or_more() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("checking.#", "checking.api.task"));
        assert!(topic_matches("checking.#", "checking"));
        assert!(!topic_matches("checking.#", "other.api.task"));
        assert!(topic_matches("#.result", "a.b.c.result"));
        assert!(topic_matches("#.result", "result"));
    }

    #[test]
    fn test_standard_bindings_cover_all_queues() {
        let bindings = standard_bindings("checking.dead.letter");
        assert_eq!(bindings.len(), 6);
        assert!(bindings
            .iter()
            .any(|b| b.queue == INSTRUCTIONS_QUEUE && b.pattern == BIND_EXECUTION_RESULT));
        assert!(bindings
            .iter()
            .any(|b| b.queue == DEAD_LETTER_QUEUE && b.pattern == "checking.dead.letter"));
    }
}
