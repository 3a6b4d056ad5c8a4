use serde_json::json;

use crate::auth::Denied;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// A failed request, carried through handler internals and rendered into
/// the error envelope at the boundary. The domain codes (`validation`,
/// `conflict`, `forbidden`, `not_found`, `state_blocked`) are the wire
/// form of the system's error kinds; the `db_*` and `bad_params` codes
/// cover infrastructure and malformed envelopes.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    /// Field-level input rejection; `fields` names the offending inputs.
    pub fn validation(message: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            code: "validation",
            message: message.into(),
            details: Some(json!({ "fields": fields })),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn state_blocked(message: impl Into<String>) -> Self {
        Self::new("state_blocked", message)
    }

    pub fn no_workspace() -> Self {
        Self::new("no_workspace", "select a workspace first")
    }

    pub fn no_session() -> Self {
        Self::new("no_session", "log in first")
    }

    pub fn db_query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn db_insert(e: rusqlite::Error) -> Self {
        Self::new("db_insert_failed", e.to_string())
    }

    pub fn db_update(e: rusqlite::Error) -> Self {
        Self::new("db_update_failed", e.to_string())
    }

    pub fn db_delete(e: rusqlite::Error) -> Self {
        Self::new("db_delete_failed", e.to_string())
    }

    pub fn db_tx(e: rusqlite::Error) -> Self {
        Self::new("db_tx_failed", e.to_string())
    }

    pub fn db_commit(e: rusqlite::Error) -> Self {
        Self::new("db_commit_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<Denied> for HandlerErr {
    fn from(d: Denied) -> Self {
        Self::forbidden(d.0)
    }
}
