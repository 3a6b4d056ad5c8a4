use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};

use crate::auth::Principal;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(HandlerErr::no_workspace)
}

pub fn principal(state: &AppState) -> Result<Principal, HandlerErr> {
    state.principal.clone().ok_or_else(HandlerErr::no_session)
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key)))?
                .trim()
                .to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer or null", key))),
    }
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean or null", key))),
    }
}

/// Optional component score; when present it must lie within [0,100].
pub fn optional_score(
    params: &serde_json::Value,
    key: &'static str,
) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let n = v.as_f64().ok_or_else(|| {
                HandlerErr::validation(format!("{} must be a number", key), &[key])
            })?;
            if !(0.0..=100.0).contains(&n) {
                return Err(HandlerErr::validation(
                    format!("{} must be between 0 and 100", key),
                    &[key],
                ));
            }
            Ok(Some(n))
        }
    }
}

pub fn required_date(params: &serde_json::Value, key: &'static str) -> Result<String, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn parse_date(raw: &str, key: &'static str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::validation(format!("{} must be YYYY-MM-DD", key), &[key]))
}

/// Lesson time in `HH:MM`, returned as (canonical string, minutes since
/// midnight).
pub fn required_time(
    params: &serde_json::Value,
    key: &'static str,
) -> Result<(String, i64), HandlerErr> {
    let raw = required_str(params, key)?;
    let minutes = calc::parse_hhmm(&raw)
        .ok_or_else(|| HandlerErr::validation(format!("{} must be HH:MM", key), &[key]))?;
    Ok((raw, minutes))
}

pub fn required_semester(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    let semester = required_i64(params, "semester")?;
    if semester != 1 && semester != 2 {
        return Err(HandlerErr::validation(
            "semester must be 1 or 2",
            &["semester"],
        ));
    }
    Ok(semester)
}

/// The auth scope of one student row: their identity user, their guardian,
/// and the homeroom teacher of their class.
pub struct StudentScope {
    pub user_id: String,
    pub guardian_user_id: Option<String>,
    pub homeroom_teacher_id: Option<String>,
}

pub fn student_scope(conn: &Connection, student_id: &str) -> Result<StudentScope, HandlerErr> {
    conn.query_row(
        "SELECT s.user_id, s.guardian_user_id, c.teacher_id
         FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            Ok(StudentScope {
                user_id: r.get(0)?,
                guardian_user_id: r.get(1)?,
                homeroom_teacher_id: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("student not found"))
}

/// Active, non-deleted user row with the given role; `not_found` when the
/// id exists but carries a different role.
pub fn require_user_with_role(
    conn: &Connection,
    user_id: &str,
    role: &str,
) -> Result<String, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, role FROM users WHERE id = ? AND deleted_at IS NULL",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    match row {
        Some((name, r)) if r == role => Ok(name),
        _ => Err(HandlerErr::not_found(format!("{} not found", role))),
    }
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db_query)
}

pub fn hash_password(password: &str) -> Result<String, HandlerErr> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| HandlerErr::new("hash_failed", e.to_string()))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
