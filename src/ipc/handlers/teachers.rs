use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, hash_password, optional_bool, optional_str, principal, require_user_with_role,
    required_str,
};
use crate::ipc::types::{AppState, Request};

fn email_taken(
    conn: &rusqlite::Connection,
    email: &str,
    exclude_user_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    // The unique index spans soft-deleted rows too, so the check must as well.
    let existing: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_user_id != Some(id.as_str()),
        None => false,
    })
}

fn handle_teachers_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let search = optional_str(params, "search")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               u.id,
               u.name,
               u.email,
               u.phone,
               (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = u.id AND c.is_active = 1)
                 AS homeroom_count
             FROM users u
             WHERE u.role = 'teacher' AND u.deleted_at IS NULL AND u.is_active = 1
               AND (?1 IS NULL OR u.name LIKE '%' || ?1 || '%' OR u.email LIKE '%' || ?1 || '%')
             ORDER BY u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let teachers = stmt
        .query_map([&search], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "homeroomClassCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "teachers": teachers }))
}

fn handle_teachers_create(
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
    let address = optional_str(params, "address")?;
    if password.len() < 8 {
        return Err(HandlerErr::validation(
            "password must be at least 8 characters",
            &["password"],
        ));
    }
    if email_taken(conn, &email, None)? {
        return Err(HandlerErr::conflict("email already in use"));
    }

    let user_id = Uuid::new_v4().to_string();
    let password_hash = hash_password(&password)?;
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, phone, address, role, is_active)
         VALUES(?, ?, ?, ?, ?, ?, 'teacher', 1)",
        (&user_id, &name, &email, &password_hash, &phone, &address),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({ "teacherId": user_id }))
}

fn handle_teachers_get(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(params, "teacherId")?;
    require_user_with_role(conn, &teacher_id, "teacher")?;

    let profile = conn
        .query_row(
            "SELECT name, email, phone, address, is_active
             FROM users WHERE id = ?",
            [&teacher_id],
            |r| {
                Ok(json!({
                    "id": teacher_id,
                    "name": r.get::<_, String>(0)?,
                    "email": r.get::<_, String>(1)?,
                    "phone": r.get::<_, Option<String>>(2)?,
                    "address": r.get::<_, Option<String>>(3)?,
                    "isActive": r.get::<_, i64>(4)? != 0,
                }))
            },
        )
        .map_err(HandlerErr::db_query)?;

    let class_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let student_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE c.teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let grades_given: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let average_grade: Option<f64> = conn
        .query_row(
            "SELECT AVG(final_grade) FROM grades WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "teacher": profile,
        "stats": {
            "classCount": class_count,
            "studentCount": student_count,
            "gradesGiven": grades_given,
            "averageGradeGiven": average_grade.map(calc::round2),
        }
    }))
}

fn handle_teachers_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(params, "teacherId")?;
    require_user_with_role(conn, &teacher_id, "teacher")?;

    let current: Option<(String, String, Option<String>, Option<String>, String, i64)> = conn
        .query_row(
            "SELECT name, email, phone, address, password_hash, is_active
             FROM users WHERE id = ?",
            [&teacher_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((mut name, mut email, mut phone, mut address, mut password_hash, mut is_active)) =
        current
    else {
        return Err(HandlerErr::not_found("teacher not found"));
    };

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    if let Some(v) = optional_str(&patch_value, "email")? {
        if email_taken(conn, &v, Some(&teacher_id))? {
            return Err(HandlerErr::conflict("email already in use"));
        }
        email = v;
    }
    if let Some(v) = optional_str(&patch_value, "name")? {
        name = v;
    }
    if patch.contains_key("phone") {
        phone = optional_str(&patch_value, "phone")?;
    }
    if patch.contains_key("address") {
        address = optional_str(&patch_value, "address")?;
    }
    if let Some(password) = optional_str(&patch_value, "password")? {
        if password.len() < 8 {
            return Err(HandlerErr::validation(
                "password must be at least 8 characters",
                &["password"],
            ));
        }
        password_hash = hash_password(&password)?;
    }
    if let Some(v) = optional_bool(&patch_value, "isActive")? {
        is_active = v as i64;
    }

    conn.execute(
        "UPDATE users
         SET name = ?, email = ?, phone = ?, address = ?, password_hash = ?, is_active = ?
         WHERE id = ?",
        (
            &name,
            &email,
            &phone,
            &address,
            &password_hash,
            is_active,
            &teacher_id,
        ),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "ok": true }))
}

fn handle_teachers_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(params, "teacherId")?;
    require_user_with_role(conn, &teacher_id, "teacher")?;

    let active_homeroom: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM classes WHERE teacher_id = ? AND is_active = 1",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if active_homeroom > 0 {
        return Err(HandlerErr::state_blocked(
            "teacher is still homeroom of an active class",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Err(e) = tx.execute(
        "UPDATE classes SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_update(e));
    }
    let deleted_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "UPDATE users SET deleted_at = ? WHERE id = ?",
        (&deleted_at, &teacher_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_update(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_teachers_assign_class(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(params, "teacherId")?;
    let class_id = required_str(params, "classId")?;
    require_user_with_role(conn, &teacher_id, "teacher")?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;

    let class_row: Option<(Option<String>, i64, String)> = tx
        .query_row(
            "SELECT teacher_id, grade, academic_year FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((current_teacher, grade, academic_year)) = class_row else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if let Some(current) = current_teacher {
        if current != teacher_id {
            return Err(HandlerErr::conflict("class already has a homeroom teacher"));
        }
        return Ok(json!({ "ok": true }));
    }

    let already: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM classes
             WHERE teacher_id = ? AND grade = ? AND academic_year = ? AND is_active = 1",
            (&teacher_id, grade, &academic_year),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if already > 0 {
        return Err(HandlerErr::conflict(
            "teacher is already homeroom of a class in this grade and academic year",
        ));
    }

    if let Err(e) = tx.execute(
        "UPDATE classes SET teacher_id = ? WHERE id = ?",
        (&teacher_id, &class_id),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_update(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_teachers_remove_from_class(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(params, "teacherId")?;
    let class_id = required_str(params, "classId")?;

    let current: Option<Option<String>> = conn
        .query_row(
            "SELECT teacher_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(current) = current else {
        return Err(HandlerErr::not_found("class not found"));
    };
    if current.as_deref() != Some(teacher_id.as_str()) {
        return Err(HandlerErr::conflict(
            "teacher is not homeroom of this class",
        ));
    }

    conn.execute(
        "UPDATE classes SET teacher_id = NULL WHERE id = ?",
        [&class_id],
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "teachers.list" => handle_teachers_list(state, &req.params),
        "teachers.create" => handle_teachers_create(state, &req.params),
        "teachers.get" => handle_teachers_get(state, &req.params),
        "teachers.update" => handle_teachers_update(state, &req.params),
        "teachers.delete" => handle_teachers_delete(state, &req.params),
        "teachers.assignClass" => handle_teachers_assign_class(state, &req.params),
        "teachers.removeFromClass" => handle_teachers_remove_from_class(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
