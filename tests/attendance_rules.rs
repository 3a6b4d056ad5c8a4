use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_sekolahd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sekolahd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    email: &str,
    password: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "session.login",
        json!({ "email": email, "password": password }),
    );
}

#[test]
fn duplicates_rejected_and_percentage_follows_the_tally_rules() {
    let workspace = temp_dir("sekolah-attendance-rules");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.admin",
        json!({ "name": "Administrator", "email": "admin@sekolah.id", "password": "password123" }),
    );
    login(&mut stdin, &mut reader, "3", "admin@sekolah.id", "password123");

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "name": "Bu Sinta", "email": "sinta@sekolah.id", "password": "rahasia-guru" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "name": "Pak Joko", "email": "joko@sekolah.id", "password": "rahasia-guru" }),
    );

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({
            "name": "1A", "grade": 1, "teacherId": teacher_id,
            "maxStudents": 30, "academicYear": "2025/2026"
        }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "name": "Matematika", "code": "MAT1", "gradeLevel": 1 }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let mut student_ids = Vec::new();
    for (i, (name, email, no)) in [
        ("Budi Santoso", "budi@sekolah.id", "S-0001"),
        ("Citra Dewi", "citra@sekolah.id", "S-0002"),
    ]
    .iter()
    .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "name": name,
                "email": email,
                "studentNo": no,
                "classId": class_id,
                "parentName": "Ibu Sari",
                "parentPhone": "0812000111",
                "parentAddress": "Jl. Melati 5",
                "entryDate": "2025-07-14"
            }),
        );
        student_ids.push(
            created
                .get("studentId")
                .and_then(|v| v.as_str())
                .expect("studentId")
                .to_string(),
        );
    }
    let budi = student_ids[0].clone();
    let citra = student_ids[1].clone();

    // Only the homeroom teacher (or an admin) records attendance.
    login(&mut stdin, &mut reader, "8", "joko@sekolah.id", "rahasia-guru");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.record",
        json!({
            "studentId": budi, "subjectId": subject_id,
            "date": "2025-09-01", "status": "present"
        }),
    );
    assert_eq!(code, "forbidden");

    login(&mut stdin, &mut reader, "10", "sinta@sekolah.id", "rahasia-guru");
    let mut first_id = String::new();
    for (i, (date, status)) in [
        ("2025-09-01", "present"),
        ("2025-09-02", "present"),
        ("2025-09-03", "present"),
        ("2025-09-04", "absent"),
    ]
    .iter()
    .enumerate()
    {
        let rec = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "attendance.record",
            json!({ "studentId": budi, "subjectId": subject_id, "date": date, "status": status }),
        );
        if i == 0 {
            first_id = rec
                .get("attendanceId")
                .and_then(|v| v.as_str())
                .expect("attendanceId")
                .to_string();
        }
    }

    // One record per (student, subject, date).
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.record",
        json!({
            "studentId": budi, "subjectId": subject_id,
            "date": "2025-09-01", "status": "late"
        }),
    );
    assert_eq!(code, "conflict");
    // Moving an existing record onto an occupied date hits the same rule.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "attendance.update",
        json!({ "attendanceId": first_id, "patch": { "date": "2025-09-02" } }),
    );
    assert_eq!(code, "conflict");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.summary",
        json!({ "studentId": budi }),
    );
    assert_eq!(summary.get("total").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(summary.get("present").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(summary.get("percentage").and_then(|v| v.as_f64()), Some(75.0));
    assert_eq!(summary.get("absenceCount").and_then(|v| v.as_i64()), Some(1));

    // Late counts toward the total, not toward present or absences.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.record",
        json!({
            "studentId": budi, "subjectId": subject_id,
            "date": "2025-09-05", "status": "late"
        }),
    );
    // The long spelling of permit is folded into the canonical one.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attendance.record",
        json!({
            "studentId": budi, "subjectId": subject_id,
            "date": "2025-09-06", "status": "permission"
        }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.summary",
        json!({ "studentId": budi }),
    );
    assert_eq!(summary.get("total").and_then(|v| v.as_i64()), Some(6));
    assert_eq!(summary.get("late").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("permit").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(summary.get("percentage").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(summary.get("absenceCount").and_then(|v| v.as_i64()), Some(2));

    // Zero records is a valid state, not an error.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.summary",
        json!({ "studentId": citra }),
    );
    assert_eq!(summary.get("total").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(summary.get("percentage").and_then(|v| v.as_f64()), Some(0.0));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.record",
        json!({
            "studentId": budi, "subjectId": subject_id,
            "date": "2025-09-07", "status": "holiday"
        }),
    );
    assert_eq!(code, "validation");

    // A student reads their own summary but nobody else's.
    login(&mut stdin, &mut reader, "19", "budi@sekolah.id", "password123");
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.summary",
        json!({ "studentId": budi }),
    );
    assert_eq!(summary.get("total").and_then(|v| v.as_i64()), Some(6));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "21",
        "attendance.summary",
        json!({ "studentId": citra }),
    );
    assert_eq!(code, "forbidden");
}
