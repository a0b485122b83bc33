/// Longest queue name the queue service accepts.
pub const MAX_QUEUE_NAME_LEN: usize = 15;

pub const QUEUE_NAME_FIELD: &str = "QueueName";

/// Log line emitted whenever a configured identifier is shortened.
pub fn truncated_message(field: &str) -> String {
    format!("{field} was truncated")
}

/// Shortens `value` to at most `max_chars` characters. Returns `None` when the
/// value already fits.
pub fn truncate_identifier(value: &str, max_chars: usize) -> Option<String> {
    if value.chars().count() <= max_chars {
        return None;
    }

    Some(value.chars().take(max_chars).collect())
}

/// Keeps path components coming from webhook payloads inside their parent
/// directory.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|character| match character {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => character,
            _ => '_',
        })
        .collect::<String>();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_character_queue_name_is_truncated() {
        let truncated =
            truncate_identifier("12345678901234567890", MAX_QUEUE_NAME_LEN).expect("truncated");
        assert_eq!(truncated, "123456789012345");
    }

    #[test]
    fn short_names_are_left_alone() {
        assert_eq!(truncate_identifier("dispatch", MAX_QUEUE_NAME_LEN), None);
        assert_eq!(
            truncate_identifier("123456789012345", MAX_QUEUE_NAME_LEN),
            None
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_identifier("ééé", 2).as_deref(), Some("éé"));
    }

    #[test]
    fn message_names_the_field() {
        assert!(truncated_message(QUEUE_NAME_FIELD).contains("QueueName"));
    }

    #[test]
    fn sanitize_component_blocks_traversal() {
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("refs/heads/main"), "refs_heads_main");
        assert_eq!(sanitize_component("grim"), "grim");
        assert_eq!(sanitize_component(""), "_");
    }
}
