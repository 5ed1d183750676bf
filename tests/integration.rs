use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn tally_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tally");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[line]
name = "Line-9"
target = 4
{}
[storage]
data_dir = "{}/data"

[device]
path = "-"
idle_timeout_ms = 100
"#,
        extra,
        root.display()
    );

    let config_path = config_dir.join("tally.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tally(config_path: &Path, args: &[&str], stdin: &[u8]) -> (String, String, bool) {
    let binary = tally_binary();
    let mut child = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to run tally binary at {:?}: {}", binary, e));

    child.stdin.take().unwrap().write_all(stdin).unwrap();
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn metrics(config_path: &Path, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["metrics"];
    full.extend_from_slice(args);
    let (stdout, stderr, success) = run_tally(config_path, &full, b"");
    assert!(success, "metrics failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_metrics_without_partition_is_zero() {
    let (_tmp, config_path) = setup_test_env("");

    let value = metrics(&config_path, &[]);
    assert_eq!(value["count"], 0);
    assert_eq!(value["percentage"].as_f64(), Some(0.0));
    assert_eq!(value["line_name"], "Line-9");
    assert_eq!(value["target"], 4);
}

#[test]
fn test_ingest_drops_duplicate_frames() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_tally(&config_path, &["ingest"], b"A1\rA1\rB2\r");
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);

    let data_dir = tmp.path().join("data");
    let files: Vec<_> = fs::read_dir(&data_dir).unwrap().collect();
    assert_eq!(files.len(), 1);
    let content = fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3, "unexpected partition content: {}", content);
    assert_eq!(lines[0], "Line Name,Time Scanned,Barcode");
    assert!(lines[1].starts_with("Line-9,") && lines[1].ends_with(",A1"));
    assert!(lines[2].ends_with(",B2"));

    let value = metrics(&config_path, &[]);
    assert_eq!(value["count"], 2);
    assert_eq!(value["percentage"].as_f64(), Some(50.0));
}

#[test]
fn test_ingest_again_same_day_is_still_deduplicated() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, ok1) = run_tally(&config_path, &["ingest"], b"A1\r");
    assert!(ok1);
    let (_, _, ok2) = run_tally(&config_path, &["ingest"], b"\"A1\"\rC3\r");
    assert!(ok2);

    let value = metrics(&config_path, &[]);
    assert_eq!(value["count"], 2);
}

#[test]
fn test_segmented_metrics_echo_configuration() {
    let segments = r#"
[[line.segments]]
start = "00:00"
end = "12:00"
target = 2

[[line.segments]]
start = "12:00"
end = "00:00"
target = 2
"#;
    let (_tmp, config_path) = setup_test_env(segments);
    run_tally(&config_path, &["ingest"], b"Z1\r");

    let value = metrics(&config_path, &["--segments"]);
    assert_eq!(value["labels"], serde_json::json!(["00:00-12:00", "12:00-00:00"]));
    assert_eq!(value["target_counts"], serde_json::json!([2, 2]));
    let total: u64 = value["actual_counts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .sum();
    assert_eq!(total, 1);
    assert_eq!(value["segments"][0]["start"], "00:00");
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("tally.toml");
    fs::write(&config_path, "[line]\nname = \"\"\n").unwrap();

    let (_, stderr, success) = run_tally(&config_path, &["metrics"], b"");
    assert!(!success);
    assert!(stderr.contains("line.name"), "stderr: {}", stderr);
}

fn wait_with_deadline(child: &mut Child, deadline: Duration) -> Option<ExitStatus> {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    None
}

#[test]
fn test_ingest_exits_on_sigint_while_device_is_quiet() {
    let (tmp, config_path) = setup_test_env("");
    let fifo = tmp.path().join("scanner");
    let c_path = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    let config = fs::read_to_string(&config_path)
        .unwrap()
        .replace("path = \"-\"", &format!("path = \"{}\"", fifo.display()));
    fs::write(&config_path, config).unwrap();

    let mut child = Command::new(tally_binary())
        .arg("--config")
        .arg(&config_path)
        .arg("ingest")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Opening the write end without blocking fails until tally holds the read end.
    let started = Instant::now();
    let mut writer = loop {
        match fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo)
        {
            Ok(writer) => break writer,
            Err(_) if started.elapsed() < Duration::from_secs(10) => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                let _ = child.kill();
                panic!("tally never opened the device: {}", e);
            }
        }
    };
    writer.write_all(b"A1\r").unwrap();

    let started = Instant::now();
    while metrics(&config_path, &[])["count"] != 1 {
        assert!(started.elapsed() < Duration::from_secs(10), "scan never recorded");
        std::thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) }, 0);
    let status = wait_with_deadline(&mut child, Duration::from_secs(5));
    drop(writer);
    if status.is_none() {
        let _ = child.kill();
    }
    let status = status.expect("tally ingest did not exit after SIGINT");
    assert!(status.success(), "exit status: {:?}", status);
}

#[test]
fn test_run_fails_when_dashboard_cannot_bind() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = held.local_addr().unwrap();
    let (_tmp, config_path) = setup_test_env(&format!("[server]\nbind = \"{}\"\n", addr));

    let mut child = Command::new(tally_binary())
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    // Keep stdin open so only the server can end the process.
    let stdin = child.stdin.take().unwrap();

    let status = wait_with_deadline(&mut child, Duration::from_secs(10));
    if status.is_none() {
        let _ = child.kill();
    }
    drop(stdin);
    let status = status.expect("tally run kept going without its dashboard");
    assert!(!status.success());

    let mut stderr = String::new();
    std::io::Read::read_to_string(child.stderr.as_mut().unwrap(), &mut stderr).unwrap();
    assert!(stderr.contains("dashboard server failed"), "stderr: {}", stderr);
}

#[test]
fn test_piped_logs_carry_no_colour_codes() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, stderr, success) = run_tally(&config_path, &["ingest"], b"A1\r");
    assert!(success);
    assert!(stderr.contains("scan recorded"), "stderr: {}", stderr);
    assert!(!stderr.contains('\u{1b}'), "stderr: {:?}", stderr);
}
