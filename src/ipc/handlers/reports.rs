use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{Principal, Role};
use crate::calc;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::attendance::summarize;
use crate::ipc::helpers::{db_conn, principal};
use crate::ipc::types::{AppState, Request};

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0))
        .map_err(HandlerErr::db_query)
}

fn recent_grades(
    conn: &Connection,
    scope_sql: &str,
    scope_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT g.final_grade, g.grade_letter, g.semester, g.academic_year,
                u.name, sub.name
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN users u ON u.id = s.user_id
         JOIN subjects sub ON sub.id = g.subject_id
         WHERE {}
         ORDER BY g.rowid DESC
         LIMIT 10",
        scope_sql
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    stmt.query_map([scope_id], |r| {
        Ok(json!({
            "finalGrade": r.get::<_, f64>(0)?,
            "gradeLetter": r.get::<_, String>(1)?,
            "semester": r.get::<_, i64>(2)?,
            "academicYear": r.get::<_, String>(3)?,
            "studentName": r.get::<_, String>(4)?,
            "subjectName": r.get::<_, String>(5)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn admin_dashboard(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let total_students = count(
        conn,
        "SELECT COUNT(*) FROM students WHERE status = 'active'",
    )?;
    let total_teachers = count(
        conn,
        "SELECT COUNT(*) FROM users
         WHERE role = 'teacher' AND deleted_at IS NULL AND is_active = 1",
    )?;
    let total_classes = count(conn, "SELECT COUNT(*) FROM classes WHERE is_active = 1")?;
    let total_subjects = count(conn, "SELECT COUNT(*) FROM subjects WHERE is_active = 1")?;

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.grade,
                    (SELECT COUNT(*) FROM students s
                     WHERE s.class_id = c.id AND s.status = 'active')
             FROM classes c
             WHERE c.is_active = 1
             ORDER BY c.grade, c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let class_statistics = stmt
        .query_map([], |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "grade": r.get::<_, i64>(2)?,
                "activeStudentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "role": "admin",
        "totalStudents": total_students,
        "totalTeachers": total_teachers,
        "totalClasses": total_classes,
        "totalSubjects": total_subjects,
        "classStatistics": class_statistics,
    }))
}

fn teacher_dashboard(conn: &Connection, p: &Principal) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.grade, c.academic_year,
                    (SELECT COUNT(*) FROM students s
                     WHERE s.class_id = c.id AND s.status = 'active')
             FROM classes c
             WHERE c.teacher_id = ? AND c.is_active = 1
             ORDER BY c.grade, c.name",
        )
        .map_err(HandlerErr::db_query)?;
    let my_classes = stmt
        .query_map([&p.user_id], |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "grade": r.get::<_, i64>(2)?,
                "academicYear": r.get::<_, String>(3)?,
                "activeStudentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let total_students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE c.teacher_id = ?",
            [&p.user_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    let grades = recent_grades(conn, "g.teacher_id = ?1", &p.user_id)?;

    Ok(json!({
        "role": "teacher",
        "myClasses": my_classes,
        "totalStudents": total_students,
        "recentGrades": grades,
    }))
}

fn student_dashboard(conn: &Connection, p: &Principal) -> Result<serde_json::Value, HandlerErr> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT s.id, c.name, c.grade
             FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE s.user_id = ?",
            [&p.user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((student_id, class_name, grade)) = row else {
        return Err(HandlerErr::not_found("no student profile for this user"));
    };

    let average_grade: Option<f64> = conn
        .query_row(
            "SELECT AVG(final_grade) FROM grades WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let grades = recent_grades(conn, "g.student_id = ?1", &student_id)?;

    Ok(json!({
        "role": "student",
        "studentId": student_id,
        "className": class_name,
        "grade": grade,
        "averageGrade": average_grade.map(calc::round2),
        "recentGrades": grades,
    }))
}

fn parent_dashboard(conn: &Connection, p: &Principal) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, u.name, c.name
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             WHERE s.guardian_user_id = ?
             ORDER BY u.name",
        )
        .map_err(HandlerErr::db_query)?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([&p.user_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut children = Vec::with_capacity(rows.len());
    for (student_id, name, class_name) in rows {
        let average_grade: Option<f64> = conn
            .query_row(
                "SELECT AVG(final_grade) FROM grades WHERE student_id = ?",
                [&student_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query)?;
        let tally = summarize(conn, &student_id, None, None, None, None)?;
        children.push(json!({
            "studentId": student_id,
            "name": name,
            "className": class_name,
            "averageGrade": average_grade.map(calc::round2),
            "attendancePercentage": tally.percentage(),
        }));
    }

    Ok(json!({
        "role": "parent",
        "children": children,
    }))
}

fn handle_dashboard_open(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let p = principal(state)?;
    let conn = db_conn(state)?;
    match p.role {
        Role::Admin => admin_dashboard(conn),
        Role::Teacher => teacher_dashboard(conn, &p),
        Role::Student => student_dashboard(conn, &p),
        Role::Parent => parent_dashboard(conn, &p),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "dashboard.open" => handle_dashboard_open(state),
        _ => return None,
    };
    Some(match resp {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
