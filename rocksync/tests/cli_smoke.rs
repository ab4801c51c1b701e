use std::path::Path;
use std::process::Command;

use serde_json::Value;

fn run_cli(args: &[&str], envs: &[(&str, &Path)]) -> std::process::Output {
    let exe = env!("CARGO_BIN_EXE_rocksync");
    let mut command = Command::new(exe);
    command
        .args(args)
        .env_remove("ROCKSYNC_DEVICE_MOUNTS")
        .env_remove("ROCKSYNC_TRANSFORM_CMD")
        .env("RUST_LOG", "warn");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("rocksync should execute")
}

#[test]
fn help_lists_primary_commands() {
    let output = run_cli(&["--help"], &[]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("scan-library"));
    assert!(stdout.contains("add-missing"));
    assert!(stdout.contains("--verify-only"));
}

#[test]
fn show_settings_outputs_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_cli(
        &["--show-settings"],
        &[
            ("ROCKSYNC_MUSIC_ROOT", dir.path()),
            ("ROCKSYNC_LIBRARY_INDEX", &dir.path().join("index.sqlite3")),
        ],
    );
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(json["music_root"], dir.path().display().to_string());
    assert!(json.get("extensions").is_some());
    assert_eq!(json["verify"], true);
}

#[test]
fn devices_lists_dummy_device_first() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_cli(&["devices"], &[("ROCKSYNC_DUMMY_DEVICE", dir.path())]);
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).expect("valid json");
    assert_eq!(json[0]["label"], "Dummy Device");
}

#[test]
fn unknown_command_fails() {
    let output = run_cli(&["explode"], &[]);
    assert!(!output.status.success());
}

#[test]
fn sync_copies_library_to_dummy_device() {
    let dir = tempfile::tempdir().unwrap();
    let music = dir.path().join("music");
    let device = dir.path().join("device");
    std::fs::create_dir_all(music.join("Artist")).unwrap();
    std::fs::create_dir_all(&device).unwrap();
    std::fs::write(music.join("Artist/song.mp3"), vec![7u8; 4096]).unwrap();
    let library_index = dir.path().join("state/music_index.sqlite3");

    let envs = [
        ("ROCKSYNC_MUSIC_ROOT", music.as_path()),
        ("ROCKSYNC_DUMMY_DEVICE", device.as_path()),
        ("ROCKSYNC_LIBRARY_INDEX", library_index.as_path()),
    ];
    let output = run_cli(&["sync"], &envs);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|line| line == "+ Artist/song.mp3"));
    let last = stdout.lines().last().expect("outcome line");
    let outcome: Value = serde_json::from_str(last).expect("valid json");
    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["summary"]["copied"], 1);
    assert_eq!(
        std::fs::read(device.join("Music/Artist/song.mp3")).unwrap(),
        vec![7u8; 4096]
    );
    assert!(device.join(".rocksync/music_index.sqlite3").exists());

    let again = run_cli(&["sync"], &envs);
    assert!(again.status.success());
    let stdout = String::from_utf8_lossy(&again.stdout);
    let outcome: Value =
        serde_json::from_str(stdout.lines().last().expect("outcome line")).expect("valid json");
    assert_eq!(outcome["summary"]["copied"], 0);
    assert_eq!(outcome["summary"]["skipped"], 1);
}
