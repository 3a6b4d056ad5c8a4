use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, hash_password, optional_str, principal, required_str};
use crate::ipc::types::{AppState, Request};

fn handle_parents_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;

    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let password = required_str(params, "password")?;
    let phone = optional_str(params, "phone")?;
    if password.len() < 8 {
        return Err(HandlerErr::validation(
            "password must be at least 8 characters",
            &["password"],
        ));
    }
    let taken: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if taken.is_some() {
        return Err(HandlerErr::conflict("email already in use"));
    }

    let user_id = Uuid::new_v4().to_string();
    let password_hash = hash_password(&password)?;
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, phone, role, is_active)
         VALUES(?, ?, ?, ?, ?, 'parent', 1)",
        (&user_id, &name, &email, &password_hash, &phone),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({ "parentId": user_id }))
}

fn handle_parents_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;

    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, u.email,
                    (SELECT COUNT(*) FROM students s WHERE s.guardian_user_id = u.id)
             FROM users u
             WHERE u.role = 'parent' AND u.deleted_at IS NULL AND u.is_active = 1
             ORDER BY u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let parents = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "linkedStudentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "parents": parents }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "parents.create" => handle_parents_create(state, &req.params),
        "parents.list" => handle_parents_list(state),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
