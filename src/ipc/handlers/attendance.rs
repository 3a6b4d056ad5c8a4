use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::calc::{AttendanceStatus, AttendanceTally};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, exists, optional_i64, optional_str, principal, required_date, required_str,
    student_scope,
};
use crate::ipc::types::{AppState, Request};

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::validation(
            "status must be one of: present, absent, late, sick, permit",
            &["status"],
        )
    })
}

fn duplicate_exists(
    conn: &rusqlite::Connection,
    student_id: &str,
    subject_id: &str,
    date: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendances
             WHERE student_id = ? AND subject_id = ? AND date = ?",
            (student_id, subject_id, date),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(match existing {
        Some(id) => exclude_id != Some(id.as_str()),
        None => false,
    })
}

fn month_filter(month: Option<i64>) -> Result<Option<String>, HandlerErr> {
    match month {
        None => Ok(None),
        Some(m) if (1..=12).contains(&m) => Ok(Some(format!("{:02}", m))),
        Some(_) => Err(HandlerErr::validation(
            "month must be between 1 and 12",
            &["month"],
        )),
    }
}

fn handle_attendance_record(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;

    let student_id = required_str(params, "studentId")?;
    let subject_id = required_str(params, "subjectId")?;
    let date = required_date(params, "date")?;
    let status = parse_status(&required_str(params, "status")?)?;
    let notes = optional_str(params, "notes")?;

    let scope = student_scope(conn, &student_id)?;
    auth::ensure_attendance_record(&p, scope.homeroom_teacher_id.as_deref())?;
    if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr::validation(
            "subject does not exist",
            &["subjectId"],
        ));
    }
    if duplicate_exists(conn, &student_id, &subject_id, &date, None)? {
        return Err(HandlerErr::conflict(
            "attendance already recorded for this student, subject and date",
        ));
    }

    let attendance_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendances(id, student_id, subject_id, teacher_id, date, status, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &attendance_id,
            &student_id,
            &subject_id,
            &p.user_id,
            &date,
            status.as_str(),
            &notes,
        ),
    )
    .map_err(HandlerErr::db_insert)?;

    Ok(json!({ "attendanceId": attendance_id }))
}

fn handle_attendance_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;

    let student_filter = optional_str(params, "studentId")?;
    let class_filter = optional_str(params, "classId")?;
    let date_filter = match optional_str(params, "date")? {
        Some(raw) => Some(crate::ipc::helpers::parse_date(&raw, "date")?),
        None => None,
    };
    let month = month_filter(optional_i64(params, "month")?)?;
    let year = optional_i64(params, "year")?.map(|y| y.to_string());

    let (class_teacher_scope, student_user_scope, guardian_scope) = match p.role {
        Role::Admin => (None, None, None),
        Role::Teacher => (Some(p.user_id.clone()), None, None),
        Role::Student => (None, Some(p.user_id.clone()), None),
        Role::Parent => (None, None, Some(p.user_id.clone())),
    };

    let mut stmt = conn
        .prepare(
            "SELECT
               a.id, a.date, a.status, a.notes,
               s.id, u.name, sub.id, sub.name, a.teacher_id
             FROM attendances a
             JOIN students s ON s.id = a.student_id
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             JOIN subjects sub ON sub.id = a.subject_id
             WHERE (?1 IS NULL OR c.teacher_id = ?1)
               AND (?2 IS NULL OR s.user_id = ?2)
               AND (?3 IS NULL OR s.guardian_user_id = ?3)
               AND (?4 IS NULL OR a.student_id = ?4)
               AND (?5 IS NULL OR s.class_id = ?5)
               AND (?6 IS NULL OR a.date = ?6)
               AND (?7 IS NULL OR substr(a.date, 6, 2) = ?7)
               AND (?8 IS NULL OR substr(a.date, 1, 4) = ?8)
             ORDER BY a.date DESC, u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map(
            (
                &class_teacher_scope,
                &student_user_scope,
                &guardian_scope,
                &student_filter,
                &class_filter,
                &date_filter,
                &month,
                &year,
            ),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "date": r.get::<_, String>(1)?,
                    "status": r.get::<_, String>(2)?,
                    "notes": r.get::<_, Option<String>>(3)?,
                    "studentId": r.get::<_, String>(4)?,
                    "studentName": r.get::<_, String>(5)?,
                    "subjectId": r.get::<_, String>(6)?,
                    "subjectName": r.get::<_, String>(7)?,
                    "recordedBy": r.get::<_, String>(8)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "attendances": rows }))
}

struct AttendanceRow {
    student_id: String,
    subject_id: String,
    date: String,
    status: String,
    notes: Option<String>,
    recorded_by: String,
}

fn load_attendance(
    conn: &rusqlite::Connection,
    attendance_id: &str,
) -> Result<AttendanceRow, HandlerErr> {
    conn.query_row(
        "SELECT student_id, subject_id, date, status, notes, teacher_id
         FROM attendances WHERE id = ?",
        [attendance_id],
        |r| {
            Ok(AttendanceRow {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                date: r.get(2)?,
                status: r.get(3)?,
                notes: r.get(4)?,
                recorded_by: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("attendance record not found"))
}

fn handle_attendance_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let attendance_id = required_str(params, "attendanceId")?;

    let mut row = load_attendance(conn, &attendance_id)?;
    auth::ensure_attendance_write(&p, &row.recorded_by)?;

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    if let Some(raw) = optional_str(&patch_value, "status")? {
        row.status = parse_status(&raw)?.as_str().to_string();
    }
    if patch.contains_key("notes") {
        row.notes = optional_str(&patch_value, "notes")?;
    }
    if patch.contains_key("date") {
        let date = required_date(&patch_value, "date")?;
        if duplicate_exists(
            conn,
            &row.student_id,
            &row.subject_id,
            &date,
            Some(&attendance_id),
        )? {
            return Err(HandlerErr::conflict(
                "attendance already recorded for this student, subject and date",
            ));
        }
        row.date = date;
    }

    conn.execute(
        "UPDATE attendances SET date = ?, status = ?, notes = ? WHERE id = ?",
        (&row.date, &row.status, &row.notes, &attendance_id),
    )
    .map_err(HandlerErr::db_update)?;

    Ok(json!({ "ok": true }))
}

fn handle_attendance_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let attendance_id = required_str(params, "attendanceId")?;

    let row = load_attendance(conn, &attendance_id)?;
    auth::ensure_attendance_write(&p, &row.recorded_by)?;

    conn.execute("DELETE FROM attendances WHERE id = ?", [&attendance_id])
        .map_err(HandlerErr::db_delete)?;

    Ok(json!({ "ok": true }))
}

pub fn summarize(
    conn: &rusqlite::Connection,
    student_id: &str,
    month: Option<&str>,
    year: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<AttendanceTally, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendances
             WHERE student_id = ?1
               AND (?2 IS NULL OR substr(date, 6, 2) = ?2)
               AND (?3 IS NULL OR substr(date, 1, 4) = ?3)
               AND (?4 IS NULL OR date >= ?4)
               AND (?5 IS NULL OR date <= ?5)",
        )
        .map_err(HandlerErr::db_query)?;
    let statuses: Vec<String> = stmt
        .query_map((student_id, month, year, from, to), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut tally = AttendanceTally::default();
    for raw in statuses {
        // Rows were validated on the way in; anything else is skipped.
        if let Some(status) = AttendanceStatus::parse(&raw) {
            tally.record(status);
        }
    }
    Ok(tally)
}

fn handle_attendance_summary(
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

    let month = month_filter(optional_i64(params, "month")?)?;
    let year = optional_i64(params, "year")?.map(|y| y.to_string());
    let from = match optional_str(params, "from")? {
        Some(raw) => Some(crate::ipc::helpers::parse_date(&raw, "from")?),
        None => None,
    };
    let to = match optional_str(params, "to")? {
        Some(raw) => Some(crate::ipc::helpers::parse_date(&raw, "to")?),
        None => None,
    };

    let tally = summarize(
        conn,
        &student_id,
        month.as_deref(),
        year.as_deref(),
        from.as_deref(),
        to.as_deref(),
    )?;

    Ok(json!({
        "studentId": student_id,
        "total": tally.total,
        "present": tally.present,
        "absent": tally.absent,
        "late": tally.late,
        "sick": tally.sick,
        "permit": tally.permit,
        "absenceCount": tally.absence_count(),
        "percentage": tally.percentage(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "attendance.record" => handle_attendance_record(state, &req.params),
        "attendance.list" => handle_attendance_list(state, &req.params),
        "attendance.update" => handle_attendance_update(state, &req.params),
        "attendance.delete" => handle_attendance_delete(state, &req.params),
        "attendance.summary" => handle_attendance_summary(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
