use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_i64, optional_str, principal, require_user_with_role,
    required_i64, required_str,
};
use crate::ipc::types::{AppState, Request};

fn validate_grade(grade: i64) -> Result<(), HandlerErr> {
    if !(1..=6).contains(&grade) {
        return Err(HandlerErr::validation(
            "grade must be between 1 and 6",
            &["grade"],
        ));
    }
    Ok(())
}

fn validate_max_students(max_students: i64) -> Result<(), HandlerErr> {
    if !(10..=50).contains(&max_students) {
        return Err(HandlerErr::validation(
            "maxStudents must be between 10 and 50",
            &["maxStudents"],
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), HandlerErr> {
    if name.len() > 10 {
        return Err(HandlerErr::validation(
            "name must be at most 10 characters",
            &["name"],
        ));
    }
    Ok(())
}

/// One active homeroom class per teacher per (grade, academic year).
fn homeroom_taken(
    conn: &Connection,
    teacher_id: &str,
    grade: i64,
    academic_year: &str,
    exclude_class_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM classes
             WHERE teacher_id = ?1 AND grade = ?2 AND academic_year = ?3 AND is_active = 1
               AND (?4 IS NULL OR id != ?4)",
            (teacher_id, grade, academic_year, exclude_class_id),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    Ok(count > 0)
}

fn handle_classes_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let search = optional_str(params, "search")?;
    let grade = optional_i64(params, "grade")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.grade,
               c.max_students,
               c.academic_year,
               c.is_active,
               t.name,
               (SELECT COUNT(*) FROM students s
                WHERE s.class_id = c.id AND s.status = 'active') AS active_students
             FROM classes c
             LEFT JOIN users t ON t.id = c.teacher_id
             WHERE (?1 IS NULL OR c.name LIKE '%' || ?1 || '%')
               AND (?2 IS NULL OR c.grade = ?2)
             ORDER BY c.grade, c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let classes = stmt
        .query_map((&search, grade), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "grade": r.get::<_, i64>(2)?,
                "maxStudents": r.get::<_, i64>(3)?,
                "academicYear": r.get::<_, String>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
                "teacherName": r.get::<_, Option<String>>(6)?,
                "activeStudentCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "classes": classes }))
}

fn handle_classes_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;

    let name = required_str(params, "name")?;
    let grade = required_i64(params, "grade")?;
    let teacher_id = optional_str(params, "teacherId")?;
    let max_students = required_i64(params, "maxStudents")?;
    let academic_year = required_str(params, "academicYear")?;
    validate_name(&name)?;
    validate_grade(grade)?;
    validate_max_students(max_students)?;
    if let Some(teacher_id) = &teacher_id {
        require_user_with_role(conn, teacher_id, "teacher")?;
    }

    // Uniqueness check and insert share one transaction; the partial
    // unique index backs this against any other writer.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Some(teacher_id) = &teacher_id {
        if homeroom_taken(&tx, teacher_id, grade, &academic_year, None)? {
            return Err(HandlerErr::conflict(
                "teacher is already homeroom of a class in this grade and academic year",
            ));
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO classes(id, name, grade, teacher_id, max_students, academic_year, is_active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (
            &class_id,
            &name,
            grade,
            &teacher_id,
            max_students,
            &academic_year,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_insert(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "classId": class_id }))
}

fn handle_classes_get(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;

    let class = conn
        .query_row(
            "SELECT c.name, c.grade, c.max_students, c.academic_year, c.is_active,
                    c.teacher_id, t.name
             FROM classes c
             LEFT JOIN users t ON t.id = c.teacher_id
             WHERE c.id = ?",
            [&class_id],
            |r| {
                Ok(json!({
                    "id": class_id,
                    "name": r.get::<_, String>(0)?,
                    "grade": r.get::<_, i64>(1)?,
                    "maxStudents": r.get::<_, i64>(2)?,
                    "academicYear": r.get::<_, String>(3)?,
                    "isActive": r.get::<_, i64>(4)? != 0,
                    "teacherId": r.get::<_, Option<String>>(5)?,
                    "teacherName": r.get::<_, Option<String>>(6)?,
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some(class) = class else {
        return Err(HandlerErr::not_found("class not found"));
    };

    // Active roster, ranked by grade average.
    let mut stmt = conn
        .prepare(
            "SELECT s.id, u.name, s.student_no,
                    (SELECT AVG(g.final_grade) FROM grades g WHERE g.student_id = s.id)
             FROM students s
             JOIN users u ON u.id = s.user_id
             WHERE s.class_id = ? AND s.status = 'active'
             ORDER BY u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let mut roster: Vec<(String, String, String, Option<f64>)> = stmt
        .query_map([&class_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    roster.sort_by(|a, b| {
        b.3.unwrap_or(f64::NEG_INFINITY)
            .partial_cmp(&a.3.unwrap_or(f64::NEG_INFINITY))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let active_count = roster.len();
    let students: Vec<serde_json::Value> = roster
        .into_iter()
        .map(|(id, name, student_no, avg)| {
            json!({
                "id": id,
                "name": name,
                "studentNo": student_no,
                "averageGrade": avg.map(calc::round2),
            })
        })
        .collect();

    Ok(json!({
        "class": class,
        "activeStudentCount": active_count,
        "students": students,
    }))
}

fn handle_classes_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;

    let current: Option<(String, i64, Option<String>, i64, String, i64)> = tx
        .query_row(
            "SELECT name, grade, teacher_id, max_students, academic_year, is_active
             FROM classes WHERE id = ?",
            [&class_id],
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
    let Some((mut name, mut grade, mut teacher_id, mut max_students, mut academic_year, mut is_active)) =
        current
    else {
        return Err(HandlerErr::not_found("class not found"));
    };

    if let Some(v) = optional_str(&patch_value, "name")? {
        validate_name(&v)?;
        name = v;
    }
    if let Some(v) = optional_i64(&patch_value, "grade")? {
        validate_grade(v)?;
        grade = v;
    }
    if patch.contains_key("teacherId") {
        teacher_id = optional_str(&patch_value, "teacherId")?;
        if let Some(t) = &teacher_id {
            require_user_with_role(&tx, t, "teacher")?;
        }
    }
    if let Some(v) = optional_i64(&patch_value, "maxStudents")? {
        validate_max_students(v)?;
        max_students = v;
    }
    if let Some(v) = optional_str(&patch_value, "academicYear")? {
        academic_year = v;
    }
    if let Some(v) = optional_bool(&patch_value, "isActive")? {
        is_active = v as i64;
    }

    if is_active != 0 {
        if let Some(t) = &teacher_id {
            if homeroom_taken(&tx, t, grade, &academic_year, Some(&class_id))? {
                return Err(HandlerErr::conflict(
                    "teacher is already homeroom of a class in this grade and academic year",
                ));
            }
        }
    }

    if let Err(e) = tx.execute(
        "UPDATE classes
         SET name = ?, grade = ?, teacher_id = ?, max_students = ?, academic_year = ?, is_active = ?
         WHERE id = ?",
        (
            &name,
            grade,
            &teacher_id,
            max_students,
            &academic_year,
            is_active,
            &class_id,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_update(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_classes_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class not found"));
    }

    let active_students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ? AND status = 'active'",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    if active_students > 0 {
        return Err(HandlerErr::state_blocked(
            "class still has active students",
        ));
    }

    // Explicit cascade in dependency order; remaining students are
    // inactive or graduated and go with the class.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if let Err(e) = tx.execute(
        "DELETE FROM grades WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute(
        "DELETE FROM attendances WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM schedules WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute(
        "DELETE FROM users WHERE id IN (SELECT user_id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_delete(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_classes_move_students(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_admin(&p)?;
    let conn = db_conn(state)?;
    let class_id = required_str(params, "classId")?;
    let target_class_id = required_str(params, "targetClassId")?;
    let student_ids: Vec<String> = params
        .get("studentIds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("studentIds must be a non-empty array"))?;

    if class_id == target_class_id {
        return Err(HandlerErr::validation(
            "target class must differ from the source class",
            &["targetClassId"],
        ));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;

    let target: Option<(i64, i64)> = tx
        .query_row(
            "SELECT max_students, is_active FROM classes WHERE id = ?",
            [&target_class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((max_students, target_active)) = target else {
        return Err(HandlerErr::not_found("target class not found"));
    };
    if target_active == 0 {
        return Err(HandlerErr::validation(
            "target class is not active",
            &["targetClassId"],
        ));
    }

    for student_id in &student_ids {
        let in_source: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
                (student_id, &class_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        if in_source.is_none() {
            return Err(HandlerErr::validation(
                "every student must belong to the source class",
                &["studentIds"],
            ));
        }
    }

    let current_count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ? AND status = 'active'",
            [&target_class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let moving = student_ids.len() as i64;
    if current_count + moving > max_students {
        return Err(HandlerErr::conflict(
            "target class does not have enough capacity",
        ));
    }

    for student_id in &student_ids {
        if let Err(e) = tx.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&target_class_id, student_id),
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr::db_update(e));
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "moved": moving }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "classes.list" => handle_classes_list(state, &req.params),
        "classes.create" => handle_classes_create(state, &req.params),
        "classes.get" => handle_classes_get(state, &req.params),
        "classes.update" => handle_classes_update(state, &req.params),
        "classes.delete" => handle_classes_delete(state, &req.params),
        "classes.moveStudents" => handle_classes_move_students(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
