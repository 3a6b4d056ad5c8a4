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

fn grade_count(result: &serde_json::Value) -> usize {
    result
        .get("grades")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .expect("grades array")
}

#[test]
fn grades_are_owned_by_their_author_and_scoped_per_role() {
    let workspace = temp_dir("sekolah-grades-scoping");
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

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "name": "Bu Sinta", "email": "sinta@sekolah.id", "password": "rahasia-guru" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.create",
        json!({ "name": "Pak Joko", "email": "joko@sekolah.id", "password": "rahasia-guru" }),
    );
    let parent = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "parents.create",
        json!({ "name": "Ibu Sari", "email": "sari@sekolah.id", "password": "rahasia-ortu" }),
    );
    let parent_id = parent
        .get("parentId")
        .and_then(|v| v.as_str())
        .expect("parentId")
        .to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.create",
        json!({ "name": "1A", "grade": 1, "maxStudents": 30, "academicYear": "2025/2026" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "name": "Budi Santoso",
            "email": "budi@sekolah.id",
            "studentNo": "S-0001",
            "classId": class_id,
            "guardianUserId": parent_id,
            "parentName": "Ibu Sari",
            "parentPhone": "0812000111",
            "parentAddress": "Jl. Melati 5",
            "entryDate": "2025-07-14"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.create",
        json!({ "name": "Matematika", "code": "MAT1", "gradeLevel": 1 }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    // The author is the acting teacher; derived values come out of the
    // canonical 30/35/35 formula, never from the caller.
    login(&mut stdin, &mut reader, "10", "sinta@sekolah.id", "rahasia-guru");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.create",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "semester": 1,
            "dailyScore": 90,
            "midtermScore": 80,
            "finalScore": 85,
            "academicYear": "2025/2026"
        }),
    );
    let grade_id = created
        .get("gradeId")
        .and_then(|v| v.as_str())
        .expect("gradeId")
        .to_string();
    assert_eq!(created.get("finalGrade").and_then(|v| v.as_f64()), Some(84.75));
    assert_eq!(created.get("gradeLetter").and_then(|v| v.as_str()), Some("B"));

    // Recomputed on every persist.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.update",
        json!({ "gradeId": grade_id, "patch": { "midtermScore": 100 } }),
    );
    assert_eq!(updated.get("finalGrade").and_then(|v| v.as_f64()), Some(91.75));
    assert_eq!(updated.get("gradeLetter").and_then(|v| v.as_str()), Some("A"));

    // Out-of-range component scores are field-level validation errors.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "13",
        "grades.update",
        json!({ "gradeId": grade_id, "patch": { "dailyScore": 101 } }),
    );
    assert_eq!(code, "validation");

    // Another teacher may neither update nor delete someone else's grade.
    login(&mut stdin, &mut reader, "14", "joko@sekolah.id", "rahasia-guru");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "grades.update",
        json!({ "gradeId": grade_id, "patch": { "finalScore": 0 } }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(code, "forbidden");
    let listed = request_ok(&mut stdin, &mut reader, "17", "grades.list", json!({}));
    assert_eq!(grade_count(&listed), 0);

    // The student sees exactly their own rows, untouched by the refused
    // update, and has no write access anywhere.
    login(&mut stdin, &mut reader, "18", "budi@sekolah.id", "password123");
    let listed = request_ok(&mut stdin, &mut reader, "19", "grades.list", json!({}));
    assert_eq!(grade_count(&listed), 1);
    let row = &listed.get("grades").and_then(|v| v.as_array()).unwrap()[0];
    assert_eq!(row.get("finalGrade").and_then(|v| v.as_f64()), Some(91.75));
    assert_eq!(row.get("passed").and_then(|v| v.as_bool()), Some(true));
    let code = request_err(
        &mut stdin,
        &mut reader,
        "20",
        "grades.create",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "semester": 2,
            "academicYear": "2025/2026"
        }),
    );
    assert_eq!(code, "forbidden");
    let code = request_err(&mut stdin, &mut reader, "21", "students.list", json!({}));
    assert_eq!(code, "forbidden");

    // The guardian sees the linked child's rows, read-only.
    login(&mut stdin, &mut reader, "22", "sari@sekolah.id", "rahasia-ortu");
    let listed = request_ok(&mut stdin, &mut reader, "23", "grades.list", json!({}));
    assert_eq!(grade_count(&listed), 1);
    let code = request_err(
        &mut stdin,
        &mut reader,
        "24",
        "grades.delete",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(code, "forbidden");
}
