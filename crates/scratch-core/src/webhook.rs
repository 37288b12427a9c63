use serde_json::Value;

/// What a webhook payload asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookIntent {
    /// Create (or update) the scratch for this branch.
    Deploy { branch: String },
    /// Acknowledged but not acted on.
    Ignore { reason: String },
}

/// Interpret a push (`ref`) or pull-request (`pull_request.head.ref`)
/// payload. Tags and branch deletions are ignored.
pub fn interpret(payload: &Value) -> WebhookIntent {
    let ignore = |reason: &str| WebhookIntent::Ignore {
        reason: reason.to_string(),
    };
    if payload.get("deleted").and_then(Value::as_bool) == Some(true) {
        return ignore("branch deleted");
    }
    if let Some(r) = payload.get("ref").and_then(Value::as_str) {
        if r.starts_with("refs/tags/") {
            return ignore("tag push");
        }
        let branch = r.strip_prefix("refs/heads/").unwrap_or(r).trim();
        if branch.is_empty() {
            return ignore("empty ref");
        }
        return WebhookIntent::Deploy {
            branch: branch.to_string(),
        };
    }
    if let Some(branch) = payload
        .pointer("/pull_request/head/ref")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|b| !b.is_empty())
    {
        if payload.get("action").and_then(Value::as_str) == Some("closed") {
            return ignore("pull request closed");
        }
        return WebhookIntent::Deploy {
            branch: branch.to_string(),
        };
    }
    ignore("payload has no branch reference")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deploy(b: &str) -> WebhookIntent {
        WebhookIntent::Deploy { branch: b.into() }
    }

    #[test]
    fn push_ref_strips_heads_prefix() {
        assert_eq!(interpret(&json!({"ref": "refs/heads/feature/x"})), deploy("feature/x"));
        assert_eq!(interpret(&json!({"ref": "main"})), deploy("main"));
    }

    #[test]
    fn pull_request_head_ref() {
        let p = json!({"action": "opened", "pull_request": {"head": {"ref": "fix/y"}}});
        assert_eq!(interpret(&p), deploy("fix/y"));
    }

    #[test]
    fn tags_deletes_and_junk_are_ignored() {
        for p in [
            json!({"ref": "refs/tags/v1.0"}),
            json!({"ref": "refs/heads/x", "deleted": true}),
            json!({"action": "closed", "pull_request": {"head": {"ref": "x"}}}),
            json!({"ref": "refs/heads/"}),
            json!({"zen": "hello"}),
        ] {
            assert!(matches!(interpret(&p), WebhookIntent::Ignore { .. }), "{p}");
        }
    }
}
