use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, exists, hash_password, optional_str, principal, required_date, required_str,
    student_scope,
};
use crate::ipc::types::{AppState, Request};

const STATUSES: [&str; 3] = ["active", "inactive", "graduated"];

/// New enrolments get a known default credential the shell forces the
/// student to change on first login.
const DEFAULT_STUDENT_PASSWORD: &str = "password123";

fn validate_status(status: &str) -> Result<(), HandlerErr> {
    if STATUSES.contains(&status) {
        Ok(())
    } else {
        Err(HandlerErr::validation(
            "status must be one of: active, inactive, graduated",
            &["status"],
        ))
    }
}

fn student_no_taken(
    conn: &rusqlite::Connection,
    student_no: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_no = ?",
            [student_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn nisn_taken(
    conn: &rusqlite::Connection,
    nisn: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM students WHERE nisn = ?", [nisn], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn handle_students_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let search = optional_str(params, "search")?;
    let class_filter = optional_str(params, "classId")?;

    // Admins see the whole roster; teachers only their homeroom classes.
    // Narrower roles are refused outright rather than given empty lists.
    let teacher_scope = match p.role {
        Role::Admin => None,
        Role::Teacher => Some(p.user_id.clone()),
        _ => {
            return Err(HandlerErr::forbidden(
                "requires the admin or teacher role",
            ))
        }
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               u.name,
               s.student_no,
               s.nisn,
               s.status,
               c.id,
               c.name
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             WHERE (?1 IS NULL OR c.teacher_id = ?1)
               AND (?2 IS NULL OR u.name LIKE '%' || ?2 || '%'
                    OR s.student_no LIKE '%' || ?2 || '%')
               AND (?3 IS NULL OR s.class_id = ?3)
             ORDER BY c.grade, c.name, u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let students = stmt
        .query_map((&teacher_scope, &search, &class_filter), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "studentNo": r.get::<_, String>(2)?,
                "nisn": r.get::<_, Option<String>>(3)?,
                "status": r.get::<_, String>(4)?,
                "classId": r.get::<_, String>(5)?,
                "className": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "students": students }))
}

fn handle_students_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;

    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let student_no = required_str(params, "studentNo")?;
    let nisn = optional_str(params, "nisn")?;
    let class_id = required_str(params, "classId")?;
    let guardian_user_id = optional_str(params, "guardianUserId")?;
    let parent_name = required_str(params, "parentName")?;
    let parent_phone = required_str(params, "parentPhone")?;
    let parent_email = optional_str(params, "parentEmail")?;
    let parent_address = required_str(params, "parentAddress")?;
    let entry_date = required_date(params, "entryDate")?;
    let password = optional_str(params, "password")?
        .unwrap_or_else(|| DEFAULT_STUDENT_PASSWORD.to_string());

    if !exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(HandlerErr::validation("class does not exist", &["classId"]));
    }
    if let Some(guardian) = &guardian_user_id {
        let guardian_ok: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ? AND role = 'parent' AND deleted_at IS NULL",
                [guardian],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        if guardian_ok.is_none() {
            return Err(HandlerErr::validation(
                "guardian must be an existing parent user",
                &["guardianUserId"],
            ));
        }
    }
    let email_exists: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if email_exists.is_some() {
        return Err(HandlerErr::conflict("email already in use"));
    }
    if student_no_taken(conn, &student_no, None)? {
        return Err(HandlerErr::conflict("student number already in use"));
    }
    if let Some(nisn) = &nisn {
        if nisn_taken(conn, nisn, None)? {
            return Err(HandlerErr::conflict("nisn already in use"));
        }
    }

    // Identity and profile row must appear together or not at all.
    let user_id = Uuid::new_v4().to_string();
    let student_id = Uuid::new_v4().to_string();
    let password_hash = hash_password(&password)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Err(e) = tx.execute(
        "INSERT INTO users(id, name, email, password_hash, role, is_active)
         VALUES(?, ?, ?, ?, 'student', 1)",
        (&user_id, &name, &email, &password_hash),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_insert(e));
    }
    if let Err(e) = tx.execute(
        "INSERT INTO students(
            id, user_id, student_no, nisn, class_id, guardian_user_id,
            parent_name, parent_phone, parent_email, parent_address,
            entry_date, status
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active')",
        (
            &student_id,
            &user_id,
            &student_no,
            &nisn,
            &class_id,
            &guardian_user_id,
            &parent_name,
            &parent_phone,
            &parent_email,
            &parent_address,
            &entry_date,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_insert(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "studentId": student_id, "userId": user_id }))
}

fn handle_students_get(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;

    let scope = student_scope(conn, &student_id)?;
    auth::ensure_student_record_view(
        &p,
        scope.homeroom_teacher_id.as_deref(),
        &scope.user_id,
        scope.guardian_user_id.as_deref(),
    )?;

    let student = conn
        .query_row(
            "SELECT
               u.name, u.email, s.student_no, s.nisn, s.status, s.entry_date,
               s.parent_name, s.parent_phone, s.parent_email, s.parent_address,
               c.id, c.name, c.grade
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                Ok(json!({
                    "id": student_id,
                    "name": r.get::<_, String>(0)?,
                    "email": r.get::<_, String>(1)?,
                    "studentNo": r.get::<_, String>(2)?,
                    "nisn": r.get::<_, Option<String>>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "entryDate": r.get::<_, String>(5)?,
                    "parentName": r.get::<_, String>(6)?,
                    "parentPhone": r.get::<_, String>(7)?,
                    "parentEmail": r.get::<_, Option<String>>(8)?,
                    "parentAddress": r.get::<_, String>(9)?,
                    "classId": r.get::<_, String>(10)?,
                    "className": r.get::<_, String>(11)?,
                    "grade": r.get::<_, i64>(12)?,
                }))
            },
        )
        .map_err(HandlerErr::db_query)?;

    let average_grade: Option<f64> = conn
        .query_row(
            "SELECT AVG(final_grade) FROM grades WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "student": student,
        "averageGrade": average_grade.map(calc::round2),
    }))
}

fn handle_students_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;

    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;

    if let Some(name) = optional_str(&patch_value, "name")? {
        if let Err(e) = tx.execute("UPDATE users SET name = ? WHERE id = ?", (&name, &user_id)) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if let Some(email) = optional_str(&patch_value, "email")? {
        let taken: Option<String> = tx
            .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        if taken.is_some() && taken.as_deref() != Some(user_id.as_str()) {
            return Err(HandlerErr::conflict("email already in use"));
        }
        if let Err(e) = tx.execute(
            "UPDATE users SET email = ? WHERE id = ?",
            (&email, &user_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if let Some(student_no) = optional_str(&patch_value, "studentNo")? {
        if student_no_taken(conn, &student_no, Some(&student_id))? {
            return Err(HandlerErr::conflict("student number already in use"));
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET student_no = ? WHERE id = ?",
            (&student_no, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if patch.contains_key("nisn") {
        let nisn = optional_str(&patch_value, "nisn")?;
        if let Some(nisn) = &nisn {
            if nisn_taken(conn, nisn, Some(&student_id))? {
                return Err(HandlerErr::conflict("nisn already in use"));
            }
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET nisn = ? WHERE id = ?",
            (&nisn, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if let Some(class_id) = optional_str(&patch_value, "classId")? {
        let class_ok: Option<String> = tx
            .query_row("SELECT id FROM classes WHERE id = ?", [&class_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?;
        if class_ok.is_none() {
            return Err(HandlerErr::validation("class does not exist", &["classId"]));
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&class_id, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if let Some(status) = optional_str(&patch_value, "status")? {
        validate_status(&status)?;
        if let Err(e) = tx.execute(
            "UPDATE students SET status = ? WHERE id = ?",
            (&status, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if patch.contains_key("guardianUserId") {
        let guardian = optional_str(&patch_value, "guardianUserId")?;
        if let Some(guardian) = &guardian {
            let guardian_ok: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE id = ? AND role = 'parent' AND deleted_at IS NULL",
                    [guardian],
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?;
            if guardian_ok.is_none() {
                return Err(HandlerErr::validation(
                    "guardian must be an existing parent user",
                    &["guardianUserId"],
                ));
            }
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET guardian_user_id = ? WHERE id = ?",
            (&guardian, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    for (key, column) in [
        ("parentName", "parent_name"),
        ("parentPhone", "parent_phone"),
        ("parentAddress", "parent_address"),
    ] {
        if let Some(v) = optional_str(&patch_value, key)? {
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            if let Err(e) = tx.execute(&sql, (&v, &student_id)) {
                let _ = tx.rollback();
                return Err(HandlerErr::db_update(e));
            }
        }
    }
    if patch.contains_key("parentEmail") {
        let parent_email = optional_str(&patch_value, "parentEmail")?;
        if let Err(e) = tx.execute(
            "UPDATE students SET parent_email = ? WHERE id = ?",
            (&parent_email, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    if patch.contains_key("entryDate") {
        let entry_date = required_date(&patch_value, "entryDate")?;
        if let Err(e) = tx.execute(
            "UPDATE students SET entry_date = ? WHERE id = ?",
            (&entry_date, &student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }

    tx.commit().map_err(HandlerErr::db_commit)?;
    Ok(json!({ "ok": true }))
}

fn handle_students_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;

    let user_id: Option<String> = conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr::not_found("student not found"));
    };

    // Hard delete: dependents first, identity row last, one transaction.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute(
        "DELETE FROM attendances WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "students.list" => handle_students_list(state, &req.params),
        "students.create" => handle_students_create(state, &req.params),
        "students.get" => handle_students_get(state, &req.params),
        "students.update" => handle_students_update(state, &req.params),
        "students.delete" => handle_students_delete(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
