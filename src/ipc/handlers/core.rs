use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use crate::auth::{Principal, Role};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, hash_password, principal, required_str, verify_password};
use crate::ipc::types::{AppState, Request};

fn handle_health(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

fn handle_workspace_select(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let path = params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::bad_params("missing params.path"))?;

    let conn =
        db::open_db(&path).map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;

    tracing::info!(path = %path.display(), "workspace opened");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    // A new workspace invalidates whoever was logged in against the old one.
    state.principal = None;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn handle_setup_admin(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let password = required_str(params, "password")?;
    if password.len() < 8 {
        return Err(HandlerErr::validation(
            "password must be at least 8 characters",
            &["password"],
        ));
    }

    let user_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .map_err(HandlerErr::db_query)?;
    if user_count > 0 {
        return Err(HandlerErr::conflict("workspace already has users"));
    }

    let user_id = Uuid::new_v4().to_string();
    let password_hash = hash_password(&password)?;
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, role, is_active)
         VALUES(?, ?, ?, ?, 'admin', 1)",
        (&user_id, &name, &email, &password_hash),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({ "adminUserId": user_id }))
}

fn handle_session_login(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = required_str(params, "email")?;
    let password = required_str(params, "password")?;
    let conn = db_conn(state)?;

    let row: Option<(String, String, String, String, i64)> = conn
        .query_row(
            "SELECT id, name, password_hash, role, is_active
             FROM users
             WHERE email = ? AND deleted_at IS NULL",
            [&email],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    // One message for every failure mode; callers learn nothing about
    // which part was wrong.
    let denied = || HandlerErr::forbidden("invalid credentials");
    let (user_id, name, password_hash, role_raw, is_active) = row.ok_or_else(denied)?;
    if is_active == 0 || !verify_password(&password, &password_hash) {
        return Err(denied());
    }
    let role = Role::parse(&role_raw).ok_or_else(denied)?;

    state.principal = Some(Principal {
        user_id: user_id.clone(),
        role,
    });
    tracing::info!(user = %user_id, role = %role.as_str(), "session established");
    Ok(json!({ "userId": user_id, "name": name, "role": role.as_str() }))
}

fn handle_session_whoami(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    Ok(json!({ "userId": p.user_id, "role": p.role.as_str() }))
}

fn handle_session_logout(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    state.principal = None;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "health" => handle_health(state),
        "workspace.select" => handle_workspace_select(state, &req.params),
        "setup.admin" => handle_setup_admin(state, &req.params),
        "session.login" => handle_session_login(state, &req.params),
        "session.whoami" => handle_session_whoami(state),
        "session.logout" => handle_session_logout(state),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
