use crate::model::HookEvent;

pub const SKIP_DELETED: &str = "ref was deleted";
pub const SKIP_PULL_REQUEST_ACTION: &str = "unsupported pull_request action";
pub const SKIP_EVENT_TYPE: &str = "unsupported event type";

/// Returns the reason an event must not trigger a build, or `None` when it is
/// admitted. Deletions are rejected before the event type is looked at.
pub fn should_skip(event: &HookEvent) -> Option<&'static str> {
    if event.deleted {
        return Some(SKIP_DELETED);
    }

    match event.event_name.as_str() {
        "push" => None,
        "pull_request" if is_supported_pull_request_action(&event.action) => None,
        "pull_request" => Some(SKIP_PULL_REQUEST_ACTION),
        _ => Some(SKIP_EVENT_TYPE),
    }
}

pub fn is_supported_pull_request_action(action: &str) -> bool {
    matches!(action, "opened" | "reopened" | "synchronize")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(deleted: bool, event_name: &str, action: &str) -> HookEvent {
        HookEvent {
            deleted,
            event_name: event_name.to_string(),
            action: action.to_string(),
            ..HookEvent::default()
        }
    }

    #[test]
    fn admission_table() {
        let cases = [
            (event(true, "", ""), false),
            (event(true, "push", ""), false),
            (event(true, "pull_request", ""), false),
            (event(true, "pull_request", "reopened"), false),
            (event(false, "push", ""), true),
            (event(false, "push", "opened"), true),
            (event(false, "push", "doesn't matter"), true),
            (event(false, "pull_request", "opened"), true),
            (event(false, "pull_request", "reopened"), true),
            (event(false, "pull_request", "synchronize"), true),
            (event(false, "pull_request", "matters"), false),
            (event(false, "issue", "opened"), false),
        ];

        for (hook, admitted) in cases {
            assert_eq!(
                should_skip(&hook).is_none(),
                admitted,
                "deleted={} event={:?} action={:?}",
                hook.deleted,
                hook.event_name,
                hook.action
            );
        }
    }

    #[test]
    fn skip_reasons_name_the_rule() {
        assert_eq!(
            should_skip(&event(true, "push", "")),
            Some(SKIP_DELETED)
        );
        assert_eq!(
            should_skip(&event(false, "pull_request", "closed")),
            Some(SKIP_PULL_REQUEST_ACTION)
        );
        assert_eq!(
            should_skip(&event(false, "issue", "opened")),
            Some(SKIP_EVENT_TYPE)
        );
    }
}
