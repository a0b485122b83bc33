use crate::model::{HookEvent, WebhookEnvelope};
use anyhow::{Result, anyhow};
use serde_json::Value;

impl HookEvent {
    /// Normalizes a GitHub webhook body delivered with `X-GitHub-Event:
    /// <event_name>`.
    pub fn from_github(event_name: &str, payload: &Value) -> Result<Self> {
        let event_name = event_name.trim();
        if event_name.is_empty() {
            return Err(anyhow!("missing github event name"));
        }

        let repository = payload
            .get("repository")
            .ok_or_else(|| anyhow!("{event_name} payload has no repository"))?;
        let repo = string_at(repository, &["name"])
            .ok_or_else(|| anyhow!("{event_name} payload has no repository name"))?;
        let owner = string_at(repository, &["owner", "login"])
            .or_else(|| string_at(repository, &["owner", "name"]))
            .ok_or_else(|| anyhow!("{event_name} payload has no repository owner"))?;

        let mut event = HookEvent {
            owner,
            repo,
            event_name: event_name.to_string(),
            action: string_at(payload, &["action"]).unwrap_or_default(),
            sender: string_at(payload, &["sender", "login"]),
            ..HookEvent::default()
        };

        match event_name {
            "push" => {
                event.git_ref = string_at(payload, &["ref"]).unwrap_or_default();
                event.status_ref = string_at(payload, &["after"]).unwrap_or_default();
                event.deleted = payload
                    .get("deleted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
            "pull_request" => {
                let number = payload
                    .get("number")
                    .and_then(Value::as_u64)
                    .or_else(|| {
                        payload
                            .get("pull_request")
                            .and_then(|pull_request| pull_request.get("number"))
                            .and_then(Value::as_u64)
                    })
                    .ok_or_else(|| anyhow!("pull_request payload has no number"))?;
                event.pr_number = Some(number);
                event.git_ref = format!("refs/pull/{number}/head");
                event.status_ref =
                    string_at(payload, &["pull_request", "head", "sha"]).unwrap_or_default();
            }
            _ => {}
        }

        Ok(event)
    }

    pub fn from_envelope(envelope: &WebhookEnvelope) -> Result<Self> {
        if envelope.source != "github" {
            return Err(anyhow!("unsupported envelope source: {}", envelope.source));
        }
        Self::from_github(envelope.event_name(), &envelope.payload)
    }
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}
