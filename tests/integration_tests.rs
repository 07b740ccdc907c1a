use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

use serial_test::serial;

fn fetchpool() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_fetchpool"));
    command.env_remove("FETCHPOOL_WORKERS");
    command
}

/// Write an executable shell script standing in for the downloader
fn fake_downloader(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-dl.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).unwrap();
    path
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn test_help_hides_worker_command() {
    let output = fetchpool().arg("--help").output().unwrap();
    assert!(output.status.success());

    let text = String::from_utf8_lossy(&output.stdout);
    let commands: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("  "))
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    assert!(commands.contains(&"fetch"), "Expected fetch command in: {text}");
    assert!(!commands.contains(&"worker"), "Worker command should be hidden: {text}");
}

#[test]
fn test_fetch_without_urls_fails() {
    let temp_dir = TempDir::new().unwrap();
    let output = fetchpool()
        .args(["fetch", "--output-dir", temp_dir.path().to_str().unwrap()])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(
        combined_output(&output).contains("No URLs to fetch"),
        "Unexpected output: {}",
        combined_output(&output)
    );
}

/// Speak the wire protocol to a probe worker directly
#[test]
fn test_worker_answers_framed_tasks() {
    let mut child = fetchpool()
        .args(["worker", "--handler", "probe"])
        .env("FETCHPOOL_WORKER_ID", "4")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let task = br#"{"type":"task","id":"w1","payload":{"echo":"hi","progress_steps":1}}"#;
    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(&(task.len() as u32).to_be_bytes()).unwrap();
        stdin.write_all(task).unwrap();
        // Dropping stdin asks the worker to exit
    }

    let mut raw = Vec::new();
    child.stdout.take().unwrap().read_to_end(&mut raw).unwrap();
    assert!(child.wait().unwrap().success());

    let mut messages = Vec::new();
    let mut rest = raw.as_slice();
    while rest.len() >= 4 {
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let frame: serde_json::Value = serde_json::from_slice(&rest[4..4 + len]).unwrap();
        messages.push(frame);
        rest = &rest[4 + len..];
    }
    assert!(rest.is_empty());

    let kinds: Vec<&str> = messages
        .iter()
        .map(|m| m["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["log", "progress", "completed"]);

    let completed = messages.last().unwrap();
    assert_eq!(completed["id"], "w1");
    assert_eq!(completed["result"]["echo"], "hi");
    assert_eq!(completed["result"]["worker_id"], "4");
}

/// Full fetch run with a downloader that reports progress and a path
#[test]
#[serial]
fn test_fetch_workflow_with_fake_downloader() {
    let temp_dir = TempDir::new().unwrap();
    let out_dir = temp_dir.path().join("downloads");
    let tool = fake_downloader(
        temp_dir.path(),
        r#"echo "[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[download] 100% of 1.00MiB in 00:01"
echo "fetchpool-path=/media/clip.mp4""#,
    );
    let list = temp_dir.path().join("urls.txt");
    fs::write(&list, "# queued\nhttps://example.com/b\n").unwrap();

    let output = fetchpool()
        .args([
            "fetch",
            "https://example.com/a",
            "--file",
            list.to_str().unwrap(),
            "--output-dir",
            out_dir.to_str().unwrap(),
            "--workers",
            "2",
        ])
        .env("FETCHPOOL_FETCH_TOOL", &tool)
        .env("RUST_LOG", "fetchpool=info")
        .output()
        .unwrap();

    let text = combined_output(&output);
    assert!(output.status.success(), "Fetch failed: {text}");
    assert!(out_dir.is_dir());
    assert!(text.contains("Fetched 2 of 2 URLs"), "Unexpected output: {text}");
    assert!(text.contains("/media/clip.mp4"), "Unexpected output: {text}");
}

#[test]
#[serial]
fn test_fetch_reports_failed_downloads() {
    let temp_dir = TempDir::new().unwrap();
    let tool = fake_downloader(
        temp_dir.path(),
        r#"echo "ERROR: Unsupported URL: $*" >&2
exit 1"#,
    );

    let output = fetchpool()
        .args([
            "fetch",
            "https://example.com/broken",
            "--output-dir",
            temp_dir.path().to_str().unwrap(),
            "--workers",
            "1",
        ])
        .env("FETCHPOOL_FETCH_TOOL", &tool)
        .env("FETCHPOOL_MAX_ATTEMPTS", "1")
        .env("RUST_LOG", "fetchpool=info")
        .output()
        .unwrap();

    let text = combined_output(&output);
    assert!(!output.status.success(), "Fetch should fail: {text}");
    assert!(text.contains("1 of 1 downloads failed"), "Unexpected output: {text}");
}
