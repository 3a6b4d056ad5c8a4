use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, exists, optional_i64, optional_str, principal, require_user_with_role, required_i64,
    required_semester, required_str, required_time,
};
use crate::ipc::types::{AppState, Request};

fn validate_day(day: i64) -> Result<(), HandlerErr> {
    // School week: 1 = Monday .. 6 = Saturday.
    if !(1..=6).contains(&day) {
        return Err(HandlerErr::validation(
            "day must be between 1 (Monday) and 6 (Saturday)",
            &["day"],
        ));
    }
    Ok(())
}

/// Scan the same (day, year, semester) slot for an active schedule of the
/// same class or teacher whose interval overlaps the candidate. Runs
/// inside the caller's transaction so the verdict and the guarded write
/// commit together.
#[allow(clippy::too_many_arguments)]
fn slot_conflicts(
    conn: &Connection,
    day: i64,
    academic_year: &str,
    semester: i64,
    start_min: i64,
    end_min: i64,
    class_id: &str,
    teacher_id: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT start_time, end_time FROM schedules
             WHERE day_of_week = ?1 AND academic_year = ?2 AND semester = ?3 AND is_active = 1
               AND (class_id = ?4 OR teacher_id = ?5)
               AND (?6 IS NULL OR id != ?6)",
        )
        .map_err(HandlerErr::db_query)?;
    let rows: Vec<(String, String)> = stmt
        .query_map(
            (day, academic_year, semester, class_id, teacher_id, exclude_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    for (s, e) in rows {
        let (Some(s), Some(e)) = (calc::parse_hhmm(&s), calc::parse_hhmm(&e)) else {
            continue;
        };
        if calc::times_overlap(start_min, end_min, s, e) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn class_homeroom(conn: &Connection, class_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT teacher_id FROM classes WHERE id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("class not found"))
}

fn handle_schedules_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ = principal(state)?;
    let conn = db_conn(state)?;
    let class_filter = optional_str(params, "classId")?;
    let teacher_filter = optional_str(params, "teacherId")?;
    let day_filter = optional_i64(params, "day")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               sc.id, sc.day_of_week, sc.start_time, sc.end_time,
               sc.academic_year, sc.semester,
               c.id, c.name, sub.id, sub.name, t.id, t.name
             FROM schedules sc
             JOIN classes c ON c.id = sc.class_id
             JOIN subjects sub ON sub.id = sc.subject_id
             JOIN users t ON t.id = sc.teacher_id
             WHERE sc.is_active = 1
               AND (?1 IS NULL OR sc.class_id = ?1)
               AND (?2 IS NULL OR sc.teacher_id = ?2)
               AND (?3 IS NULL OR sc.day_of_week = ?3)
             ORDER BY sc.day_of_week, sc.start_time",
        )
        .map_err(HandlerErr::db_query)?;
    let schedules = stmt
        .query_map((&class_filter, &teacher_filter, day_filter), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "day": r.get::<_, i64>(1)?,
                "startTime": r.get::<_, String>(2)?,
                "endTime": r.get::<_, String>(3)?,
                "academicYear": r.get::<_, String>(4)?,
                "semester": r.get::<_, i64>(5)?,
                "classId": r.get::<_, String>(6)?,
                "className": r.get::<_, String>(7)?,
                "subjectId": r.get::<_, String>(8)?,
                "subjectName": r.get::<_, String>(9)?,
                "teacherId": r.get::<_, String>(10)?,
                "teacherName": r.get::<_, String>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "schedules": schedules }))
}

fn handle_schedules_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;

    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let teacher_id = required_str(params, "teacherId")?;
    let day = required_i64(params, "day")?;
    let (start_time, start_min) = required_time(params, "startTime")?;
    let (end_time, end_min) = required_time(params, "endTime")?;
    let academic_year = required_str(params, "academicYear")?;
    let semester = required_semester(params)?;
    validate_day(day)?;
    if start_min >= end_min {
        return Err(HandlerErr::validation(
            "endTime must be after startTime",
            &["startTime", "endTime"],
        ));
    }

    let homeroom = class_homeroom(conn, &class_id)?;
    auth::ensure_schedule_manage(&p, homeroom.as_deref())?;
    if !exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr::validation(
            "subject does not exist",
            &["subjectId"],
        ));
    }
    require_user_with_role(conn, &teacher_id, "teacher")?;

    // Overlap verdict and insert must land in the same transaction.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    if slot_conflicts(
        &tx,
        day,
        &academic_year,
        semester,
        start_min,
        end_min,
        &class_id,
        &teacher_id,
        None,
    )? {
        return Err(HandlerErr::conflict(
            "schedule overlaps an existing one for this class or teacher",
        ));
    }

    let schedule_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO schedules(
            id, class_id, subject_id, teacher_id, day_of_week,
            start_time, end_time, academic_year, semester, is_active
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &schedule_id,
            &class_id,
            &subject_id,
            &teacher_id,
            day,
            &start_time,
            &end_time,
            &academic_year,
            semester,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_insert(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "scheduleId": schedule_id }))
}

struct ScheduleRow {
    class_id: String,
    subject_id: String,
    teacher_id: String,
    day: i64,
    start_time: String,
    end_time: String,
    academic_year: String,
    semester: i64,
    is_active: i64,
}

fn load_schedule(conn: &Connection, schedule_id: &str) -> Result<ScheduleRow, HandlerErr> {
    conn.query_row(
        "SELECT class_id, subject_id, teacher_id, day_of_week, start_time, end_time,
                academic_year, semester, is_active
         FROM schedules WHERE id = ?",
        [schedule_id],
        |r| {
            Ok(ScheduleRow {
                class_id: r.get(0)?,
                subject_id: r.get(1)?,
                teacher_id: r.get(2)?,
                day: r.get(3)?,
                start_time: r.get(4)?,
                end_time: r.get(5)?,
                academic_year: r.get(6)?,
                semester: r.get(7)?,
                is_active: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)?
    .ok_or_else(|| HandlerErr::not_found("schedule not found"))
}

fn handle_schedules_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let schedule_id = required_str(params, "scheduleId")?;

    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;
    let patch_value = serde_json::Value::Object(patch.clone());

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let mut row = load_schedule(&tx, &schedule_id)?;

    // Authorization is against the class the schedule currently belongs to.
    let homeroom = class_homeroom(&tx, &row.class_id)?;
    auth::ensure_schedule_manage(&p, homeroom.as_deref())?;

    if let Some(v) = optional_str(&patch_value, "classId")? {
        let new_homeroom = class_homeroom(&tx, &v)?;
        auth::ensure_schedule_manage(&p, new_homeroom.as_deref())?;
        row.class_id = v;
    }
    if let Some(v) = optional_str(&patch_value, "subjectId")? {
        if !exists(&tx, "SELECT 1 FROM subjects WHERE id = ?", &v)? {
            return Err(HandlerErr::validation(
                "subject does not exist",
                &["subjectId"],
            ));
        }
        row.subject_id = v;
    }
    if let Some(v) = optional_str(&patch_value, "teacherId")? {
        require_user_with_role(&tx, &v, "teacher")?;
        row.teacher_id = v;
    }
    if let Some(v) = optional_i64(&patch_value, "day")? {
        validate_day(v)?;
        row.day = v;
    }
    if patch.contains_key("startTime") {
        let (s, _) = required_time(&patch_value, "startTime")?;
        row.start_time = s;
    }
    if patch.contains_key("endTime") {
        let (e, _) = required_time(&patch_value, "endTime")?;
        row.end_time = e;
    }
    if let Some(v) = optional_str(&patch_value, "academicYear")? {
        row.academic_year = v;
    }
    if let Some(v) = optional_i64(&patch_value, "semester")? {
        if v != 1 && v != 2 {
            return Err(HandlerErr::validation(
                "semester must be 1 or 2",
                &["semester"],
            ));
        }
        row.semester = v;
    }
    if let Some(v) = patch.get("isActive") {
        let v = v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("isActive must be boolean"))?;
        row.is_active = v as i64;
    }

    let start_min = calc::parse_hhmm(&row.start_time)
        .ok_or_else(|| HandlerErr::validation("startTime must be HH:MM", &["startTime"]))?;
    let end_min = calc::parse_hhmm(&row.end_time)
        .ok_or_else(|| HandlerErr::validation("endTime must be HH:MM", &["endTime"]))?;
    if start_min >= end_min {
        return Err(HandlerErr::validation(
            "endTime must be after startTime",
            &["startTime", "endTime"],
        ));
    }

    if row.is_active != 0
        && slot_conflicts(
            &tx,
            row.day,
            &row.academic_year,
            row.semester,
            start_min,
            end_min,
            &row.class_id,
            &row.teacher_id,
            Some(&schedule_id),
        )?
    {
        return Err(HandlerErr::conflict(
            "schedule overlaps an existing one for this class or teacher",
        ));
    }

    if let Err(e) = tx.execute(
        "UPDATE schedules
         SET class_id = ?, subject_id = ?, teacher_id = ?, day_of_week = ?,
             start_time = ?, end_time = ?, academic_year = ?, semester = ?, is_active = ?
         WHERE id = ?",
        (
            &row.class_id,
            &row.subject_id,
            &row.teacher_id,
            row.day,
            &row.start_time,
            &row.end_time,
            &row.academic_year,
            row.semester,
            row.is_active,
            &schedule_id,
        ),
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::db_update(e));
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "ok": true }))
}

fn handle_schedules_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    let schedule_id = required_str(params, "scheduleId")?;

    let row = load_schedule(conn, &schedule_id)?;
    let homeroom = class_homeroom(conn, &row.class_id)?;
    auth::ensure_schedule_manage(&p, homeroom.as_deref())?;

    conn.execute("DELETE FROM schedules WHERE id = ?", [&schedule_id])
        .map_err(HandlerErr::db_delete)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "schedules.list" => handle_schedules_list(state, &req.params),
        "schedules.create" => handle_schedules_create(state, &req.params),
        "schedules.update" => handle_schedules_update(state, &req.params),
        "schedules.delete" => handle_schedules_delete(state, &req.params),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
