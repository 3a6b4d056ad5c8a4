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

fn schedule_params(
    class_id: &str,
    subject_id: &str,
    teacher_id: &str,
    day: i64,
    start: &str,
    end: &str,
) -> serde_json::Value {
    json!({
        "classId": class_id,
        "subjectId": subject_id,
        "teacherId": teacher_id,
        "day": day,
        "startTime": start,
        "endTime": end,
        "academicYear": "2025/2026",
        "semester": 1
    })
}

#[test]
fn overlaps_rejected_for_same_class_or_teacher_in_slot() {
    let workspace = temp_dir("sekolah-schedule-conflicts");
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.login",
        json!({ "email": "admin@sekolah.id", "password": "password123" }),
    );

    let t1 = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "name": "Bu Sinta", "email": "sinta@sekolah.id", "password": "rahasia-guru" }),
    );
    let t1 = t1.get("teacherId").and_then(|v| v.as_str()).expect("t1").to_string();
    let t2 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "name": "Pak Joko", "email": "joko@sekolah.id", "password": "rahasia-guru" }),
    );
    let t2 = t2.get("teacherId").and_then(|v| v.as_str()).expect("t2").to_string();

    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({ "name": "1A", "grade": 1, "maxStudents": 30, "academicYear": "2025/2026" }),
    );
    let class_a = class_a.get("classId").and_then(|v| v.as_str()).expect("a").to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.create",
        json!({ "name": "1B", "grade": 1, "maxStudents": 30, "academicYear": "2025/2026" }),
    );
    let class_b = class_b.get("classId").and_then(|v| v.as_str()).expect("b").to_string();

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "subjects.create",
        json!({ "name": "Matematika", "code": "MAT1", "gradeLevel": 1 }),
    );
    let subject = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subject")
        .to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "schedules.create",
        schedule_params(&class_a, &subject, &t1, 1, "09:00", "10:00"),
    );
    let first_id = first
        .get("scheduleId")
        .and_then(|v| v.as_str())
        .expect("scheduleId")
        .to_string();

    // Back-to-back in the same class: boundary touch is not a conflict.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "schedules.create",
        schedule_params(&class_a, &subject, &t1, 1, "10:00", "11:00"),
    );

    // Same class, overlapping interval.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "schedules.create",
        schedule_params(&class_a, &subject, &t2, 1, "09:30", "10:30"),
    );
    assert_eq!(code, "conflict");

    // Same teacher in another class, overlapping interval.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "schedules.create",
        schedule_params(&class_b, &subject, &t1, 1, "09:30", "10:30"),
    );
    assert_eq!(code, "conflict");

    // Encompassing interval for the same class.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "13",
        "schedules.create",
        schedule_params(&class_a, &subject, &t2, 1, "08:00", "12:00"),
    );
    assert_eq!(code, "conflict");

    // Identical slot, different class and teacher: fine.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "schedules.create",
        schedule_params(&class_b, &subject, &t2, 1, "09:00", "10:00"),
    );

    // Another day is a different slot entirely.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "schedules.create",
        schedule_params(&class_a, &subject, &t1, 2, "09:00", "10:00"),
    );

    // Updating a schedule never conflicts with itself.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "schedules.update",
        json!({ "scheduleId": first_id, "patch": { "startTime": "09:15" } }),
    );
    // But it does conflict with its neighbours.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "schedules.update",
        json!({ "scheduleId": first_id, "patch": { "endTime": "10:30" } }),
    );
    assert_eq!(code, "conflict");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "schedules.create",
        schedule_params(&class_a, &subject, &t1, 7, "09:00", "10:00"),
    );
    assert_eq!(code, "validation");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "19",
        "schedules.create",
        schedule_params(&class_a, &subject, &t1, 3, "10:00", "09:00"),
    );
    assert_eq!(code, "validation");
}
