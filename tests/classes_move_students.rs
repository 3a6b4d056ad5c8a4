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

fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    max_students: i64,
) -> String {
    let class = request_ok(
        stdin,
        reader,
        id,
        "classes.create",
        json!({
            "name": name, "grade": 1,
            "maxStudents": max_students, "academicYear": "2025/2026"
        }),
    );
    class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string()
}

fn enrol(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    n: usize,
    class_id: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "name": format!("Siswa {}", n),
            "email": format!("siswa{}@sekolah.id", n),
            "studentNo": format!("S-{:04}", n),
            "classId": class_id,
            "parentName": "Ibu Sari",
            "parentPhone": "0812000111",
            "parentAddress": "Jl. Melati 5",
            "entryDate": "2025-07-14"
        }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn roster_len(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
) -> usize {
    let listed = request_ok(
        stdin,
        reader,
        id,
        "students.list",
        json!({ "classId": class_id }),
    );
    listed
        .get("students")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .expect("students array")
}

#[test]
fn transfers_respect_target_capacity_and_move_nobody_on_overflow() {
    let workspace = temp_dir("sekolah-move-students");
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

    let source = create_class(&mut stdin, &mut reader, "4", "1A", 30);
    let target = create_class(&mut stdin, &mut reader, "5", "1B", 10);

    // Fill the target to one below capacity.
    for n in 1..=9 {
        let _ = enrol(&mut stdin, &mut reader, &format!("t{}", n), n, &target);
    }
    let moving_a = enrol(&mut stdin, &mut reader, "6", 10, &source);
    let moving_b = enrol(&mut stdin, &mut reader, "7", 11, &source);

    // 9 + 2 overflows a capacity of 10; nobody moves.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "classes.moveStudents",
        json!({
            "classId": source,
            "targetClassId": target,
            "studentIds": [moving_a, moving_b]
        }),
    );
    assert_eq!(code, "conflict");
    assert_eq!(roster_len(&mut stdin, &mut reader, "9", &source), 2);
    assert_eq!(roster_len(&mut stdin, &mut reader, "10", &target), 9);

    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "classes.moveStudents",
        json!({
            "classId": source,
            "targetClassId": target,
            "studentIds": [moving_a]
        }),
    );
    assert_eq!(moved.get("moved").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(roster_len(&mut stdin, &mut reader, "12", &source), 1);
    assert_eq!(roster_len(&mut stdin, &mut reader, "13", &target), 10);

    // Students outside the source class cannot be transferred from it.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "14",
        "classes.moveStudents",
        json!({
            "classId": source,
            "targetClassId": target,
            "studentIds": [moving_a]
        }),
    );
    assert_eq!(code, "validation");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "classes.moveStudents",
        json!({
            "classId": source,
            "targetClassId": source,
            "studentIds": [moving_b]
        }),
    );
    assert_eq!(code, "validation");
}
