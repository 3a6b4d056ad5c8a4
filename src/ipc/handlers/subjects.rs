use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_i64, optional_str, principal, required_i64, required_str,
};
use crate::ipc::types::{AppState, Request};

fn validate_grade_level(grade_level: i64) -> Result<(), HandlerErr> {
    if !(1..=6).contains(&grade_level) {
        return Err(HandlerErr::validation(
            "gradeLevel must be between 1 and 6",
            &["gradeLevel"],
        ));
    }
    Ok(())
}

fn validate_code(code: &str) -> Result<(), HandlerErr> {
    if code.len() > 10 {
        return Err(HandlerErr::validation(
            "code must be at most 10 characters",
            &["code"],
        ));
    }
    Ok(())
}

fn code_taken(
    conn: &rusqlite::Connection,
    code: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE code = ?", [code], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn handle_subjects_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let search = optional_str(params, "search")?;
    let grade = optional_i64(params, "grade")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, code, description, grade_level, is_active
             FROM subjects
             WHERE (?1 IS NULL OR name LIKE '%' || ?1 || '%' OR code LIKE '%' || ?1 || '%')
               AND (?2 IS NULL OR grade_level = ?2)
             ORDER BY grade_level, name",
        )
        .map_err(HandlerErr::db_query)?;
    let subjects = stmt
        .query_map((&search, grade), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "gradeLevel": r.get::<_, i64>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;

    let name = required_str(params, "name")?;
    let code = required_str(params, "code")?;
    let description = optional_str(params, "description")?;
    let grade_level = required_i64(params, "gradeLevel")?;
    validate_code(&code)?;
    validate_grade_level(grade_level)?;
    if code_taken(conn, &code, None)? {
        return Err(HandlerErr::conflict("subject code already in use"));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, description, grade_level, is_active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&subject_id, &name, &code, &description, grade_level),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({ "subjectId": subject_id }))
}

fn handle_subjects_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;

    let current: Option<(String, String, Option<String>, i64, i64)> = conn
        .query_row(
            "SELECT name, code, description, grade_level, is_active
             FROM subjects WHERE id = ?",
            [&subject_id],
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
    let Some((mut name, mut code, mut description, mut grade_level, mut is_active)) = current
    else {
        return Err(HandlerErr::not_found("subject not found"));
    };

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    if let Some(v) = optional_str(&patch_value, "name")? {
        name = v;
    }
    if let Some(v) = optional_str(&patch_value, "code")? {
        validate_code(&v)?;
        if code_taken(conn, &v, Some(&subject_id))? {
            return Err(HandlerErr::conflict("subject code already in use"));
        }
        code = v;
    }
    if patch.contains_key("description") {
        description = optional_str(&patch_value, "description")?;
    }
    if let Some(v) = optional_i64(&patch_value, "gradeLevel")? {
        validate_grade_level(v)?;
        grade_level = v;
    }
    if let Some(v) = optional_bool(&patch_value, "isActive")? {
        is_active = v as i64;
    }

    conn.execute(
        "UPDATE subjects
         SET name = ?, code = ?, description = ?, grade_level = ?, is_active = ?
         WHERE id = ?",
        (&name, &code, &description, grade_level, is_active, &subject_id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "ok": true }))
}

fn handle_subjects_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("subject not found"));
    }

    let grade_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM grades WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if grade_count > 0 {
        return Err(HandlerErr::state_blocked(
            "subject already has recorded grades",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Err(e) = tx.execute(
        "DELETE FROM attendances WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM schedules WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_subjects_by_grade(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let grade = required_i64(params, "grade")?;
    validate_grade_level(grade)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, code FROM subjects
             WHERE grade_level = ? AND is_active = 1
             ORDER BY name",
        )
        .map_err(HandlerErr::db_query)?;
    let subjects = stmt
        .query_map([grade], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "subjects.list" => handle_subjects_list(state, &req.params),
        "subjects.create" => handle_subjects_create(state, &req.params),
        "subjects.update" => handle_subjects_update(state, &req.params),
        "subjects.delete" => handle_subjects_delete(state, &req.params),
        "subjects.byGrade" => handle_subjects_by_grade(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
