use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, exists, optional_i64, optional_score, optional_str, principal, required_semester,
    required_str,
};
use crate::ipc::types::{AppState, Request};

fn handle_grades_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;

    let student_filter = optional_str(params, "studentId")?;
    let subject_filter = optional_str(params, "subjectId")?;
    let class_filter = optional_str(params, "classId")?;
    let semester_filter = optional_i64(params, "semester")?;
    let year_filter = optional_str(params, "academicYear")?;

    // Row scope per role; filters narrow further but never widen.
    let (teacher_scope, student_user_scope, guardian_scope) = match p.role {
        Role::Admin => (None, None, None),
        Role::Teacher => (Some(p.user_id.clone()), None, None),
        Role::Student => (None, Some(p.user_id.clone()), None),
        Role::Parent => (None, None, Some(p.user_id.clone())),
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               g.id, g.semester, g.daily_score, g.midterm_score, g.final_score,
               g.final_grade, g.grade_letter, g.notes, g.academic_year,
               s.id, u.name, sub.id, sub.name, g.teacher_id, t.name
             FROM grades g
             JOIN students s ON s.id = g.student_id
             JOIN users u ON u.id = s.user_id
             JOIN subjects sub ON sub.id = g.subject_id
             JOIN users t ON t.id = g.teacher_id
             WHERE (?1 IS NULL OR g.teacher_id = ?1)
               AND (?2 IS NULL OR s.user_id = ?2)
               AND (?3 IS NULL OR s.guardian_user_id = ?3)
               AND (?4 IS NULL OR g.student_id = ?4)
               AND (?5 IS NULL OR g.subject_id = ?5)
               AND (?6 IS NULL OR s.class_id = ?6)
               AND (?7 IS NULL OR g.semester = ?7)
               AND (?8 IS NULL OR g.academic_year = ?8)
             ORDER BY g.academic_year, g.semester, u.name, sub.name",
        )
        .map_err(HandlerErr::db_query)?;
    let grades = stmt
        .query_map(
            (
                &teacher_scope,
                &student_user_scope,
                &guardian_scope,
                &student_filter,
                &subject_filter,
                &class_filter,
                semester_filter,
                &year_filter,
            ),
            |r| {
                let final_grade: f64 = r.get(5)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "semester": r.get::<_, i64>(1)?,
                    "dailyScore": r.get::<_, Option<f64>>(2)?,
                    "midtermScore": r.get::<_, Option<f64>>(3)?,
                    "finalScore": r.get::<_, Option<f64>>(4)?,
                    "finalGrade": final_grade,
                    "gradeLetter": r.get::<_, String>(6)?,
                    "passed": calc::is_passing(final_grade),
                    "notes": r.get::<_, Option<String>>(7)?,
                    "academicYear": r.get::<_, String>(8)?,
                    "studentId": r.get::<_, String>(9)?,
                    "studentName": r.get::<_, String>(10)?,
                    "subjectId": r.get::<_, String>(11)?,
                    "subjectName": r.get::<_, String>(12)?,
                    "teacherId": r.get::<_, String>(13)?,
                    "teacherName": r.get::<_, String>(14)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "grades": grades }))
}

fn handle_grades_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    auth::ensure_staff(&p)?;
    let conn = db_conn(state)?;

    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let semester = required_semester(params)?;
    let daily_score = optional_score(params, "dailyScore")?;
    let midterm_score = optional_score(params, "midtermScore")?;
    let final_score = optional_score(params, "finalScore")?;
    let academic_year = required_str(params, "academicYear")?;
    let notes = optional_str(params, "notes")?;

    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::validation(
            "student does not exist",
            &["studentId"],
        ));
    }
    if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr::validation(
            "subject does not exist",
            &["subjectId"],
        ));
    }

    // The author is always the acting principal; the derived values are
    // never accepted from the caller.
    let final_grade = calc::final_grade(daily_score, midterm_score, final_score);
    let grade_letter = calc::letter_for(final_grade);

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(
            id, student_id, subject_id, teacher_id, semester,
            daily_score, midterm_score, final_score,
            final_grade, grade_letter, notes, academic_year
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &subject_id,
            &p.user_id,
            semester,
            daily_score,
            midterm_score,
            final_score,
            final_grade,
            grade_letter,
            &notes,
            &academic_year,
        ),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({
        "gradeId": grade_id,
        "finalGrade": final_grade,
        "gradeLetter": grade_letter,
    }))
}

struct GradeRow {
    teacher_id: String,
    semester: i64,
    daily_score: Option<f64>,
    midterm_score: Option<f64>,
    final_score: Option<f64>,
    notes: Option<String>,
    academic_year: String,
}

fn load_grade(conn: &rusqlite::Connection, grade_id: &str) -> Result<GradeRow, HandlerErr> {
    conn.query_row(
        "SELECT teacher_id, semester, daily_score, midterm_score, final_score,
                notes, academic_year
         FROM grades WHERE id = ?",
        [grade_id],
        |r| {
            Ok(GradeRow {
                teacher_id: r.get(0)?,
                semester: r.get(1)?,
                daily_score: r.get(2)?,
                midterm_score: r.get(3)?,
                final_score: r.get(4)?,
                notes: r.get(5)?,
                academic_year: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("grade not found"))
}

fn handle_grades_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let grade_id = required_str(params, "gradeId")?;

    let mut row = load_grade(conn, &grade_id)?;
    auth::ensure_grade_write(&p, &row.teacher_id)?;

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    if let Some(v) = optional_i64(&patch_value, "semester")? {
        if v != 1 && v != 2 {
            return Err(HandlerErr::validation(
                "semester must be 1 or 2",
                &["semester"],
            ));
        }
        row.semester = v;
    }
    if patch.contains_key("dailyScore") {
        row.daily_score = optional_score(&patch_value, "dailyScore")?;
    }
    if patch.contains_key("midtermScore") {
        row.midterm_score = optional_score(&patch_value, "midtermScore")?;
    }
    if patch.contains_key("finalScore") {
        row.final_score = optional_score(&patch_value, "finalScore")?;
    }
    if patch.contains_key("notes") {
        row.notes = optional_str(&patch_value, "notes")?;
    }
    if let Some(v) = optional_str(&patch_value, "academicYear")? {
        row.academic_year = v;
    }

    // Derived values are recomputed on every persist, whatever changed.
    let final_grade = calc::final_grade(row.daily_score, row.midterm_score, row.final_score);
    let grade_letter = calc::letter_for(final_grade);

    conn.execute(
        "UPDATE grades
         SET semester = ?, daily_score = ?, midterm_score = ?, final_score = ?,
             final_grade = ?, grade_letter = ?, notes = ?, academic_year = ?
         WHERE id = ?",
        (
            row.semester,
            row.daily_score,
            row.midterm_score,
            row.final_score,
            final_grade,
            grade_letter,
            &row.notes,
            &row.academic_year,
            &grade_id,
        ),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({
        "ok": true,
        "finalGrade": final_grade,
        "gradeLetter": grade_letter,
    }))
}

fn handle_grades_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let grade_id = required_str(params, "gradeId")?;

    let row = load_grade(conn, &grade_id)?;
    auth::ensure_grade_write(&p, &row.teacher_id)?;

    conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(HandlerErr::db_delete)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "grades.list" => handle_grades_list(state, &req.params),
        "grades.create" => handle_grades_create(state, &req.params),
        "grades.update" => handle_grades_update(state, &req.params),
        "grades.delete" => handle_grades_delete(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
