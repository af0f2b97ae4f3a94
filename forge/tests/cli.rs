use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn forge(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_forge"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn forge")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

/// Initialized project whose oracle always answers "ready".
fn project() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = forge(temp.path(), &["init"]);
    assert!(init.status.success(), "{init:?}");
    fs::write(
        temp.path().join(".forge/config.toml"),
        r#"max_iterations = 2

[tests]
command = "true"

[oracle]
command = ["sh", "-c", "cat >/dev/null; echo '{\"ready\": true, \"questions\": []}'"]
"#,
    )
    .expect("write config");
    fs::write(
        temp.path().join("prd.json"),
        r#"{"title": "Add health endpoint", "description": "Add GET /health returning 200"}"#,
    )
    .expect("write prd");
    temp
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert!(forge(temp.path(), &["init"]).status.success());
    let again = forge(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(1));
    assert!(forge(temp.path(), &["init", "--force"]).status.success());
}

#[test]
fn stub_run_succeeds_and_is_recorded() {
    let temp = project();
    let prd = temp.path().join("prd.json");

    let run = forge(temp.path(), &["run", "--prd", prd.to_str().expect("utf8"), "--stub"]);
    assert_eq!(run.status.code(), Some(0), "{run:?}");
    let result = stdout_json(&run);
    assert_eq!(result["success"], true);
    assert_eq!(result["status"], "success");
    assert_eq!(result["iteration_count"], 1);
    let task_id = result["task_id"].as_str().expect("task id").to_string();

    let history = forge(temp.path(), &["history", &task_id]);
    assert!(history.status.success(), "{history:?}");
    let history = stdout_json(&history);
    assert_eq!(history["task"]["status"], "success");
    assert_eq!(history["iterations"].as_array().map(Vec::len), Some(1));

    let events = fs::read_to_string(temp.path().join(".forge/events.jsonl")).expect("events");
    assert!(events.lines().count() >= 5);
}

#[test]
fn handoff_exits_zero_and_leaves_spec() {
    let temp = project();
    let prd = temp.path().join("prd.json");

    let run = forge(
        temp.path(),
        &["run", "--prd", prd.to_str().expect("utf8"), "--handoff"],
    );
    assert_eq!(run.status.code(), Some(0), "{run:?}");
    let result = stdout_json(&run);
    assert_eq!(result["status"], "handoff");
    let spec_path = result["spec_path"].as_str().expect("spec path");
    assert!(Path::new(spec_path).exists());
}

#[test]
fn failing_stub_escalates_with_exit_code_two() {
    let temp = project();
    let config_path = temp.path().join(".forge/config.toml");
    let mut config = fs::read_to_string(&config_path).expect("config");
    config.push_str("\n[executor.stub]\npass = false\noutput = \"FAILED: expected 200\"\n");
    fs::write(&config_path, config).expect("write config");
    let prd = temp.path().join("prd.json");

    let run = forge(
        temp.path(),
        &["run", "--prd", prd.to_str().expect("utf8"), "--stub"],
    );
    assert_eq!(run.status.code(), Some(2), "{run:?}");
    let result = stdout_json(&run);
    assert_eq!(result["status"], "escalated");
    assert_eq!(result["iteration_count"], 2);
}

#[test]
fn clarification_exits_with_code_three() {
    let temp = project();
    let config_path = temp.path().join(".forge/config.toml");
    let config = fs::read_to_string(&config_path)
        .expect("config")
        .replace(
            r#"{\"ready\": true, \"questions\": []}"#,
            r#"{\"ready\": false, \"questions\": [\"Which port?\"]}"#,
        );
    fs::write(&config_path, config).expect("write config");
    let prd = temp.path().join("prd.json");

    let run = forge(
        temp.path(),
        &["run", "--prd", prd.to_str().expect("utf8"), "--stub"],
    );
    assert_eq!(run.status.code(), Some(3), "{run:?}");
    let result = stdout_json(&run);
    assert_eq!(result["needsClarification"], true);
    assert_eq!(result["questions"][0], "Which port?");
}

#[test]
fn mine_and_playbooks_report_json() {
    let temp = project();
    let prd = temp.path().join("prd.json");
    let run = forge(temp.path(), &["run", "--prd", prd.to_str().expect("utf8"), "--stub"]);
    assert!(run.status.success(), "{run:?}");

    let mine = forge(temp.path(), &["mine"]);
    assert!(mine.status.success(), "{mine:?}");
    let mined = stdout_json(&mine);
    assert!(
        mined
            .as_array()
            .expect("array")
            .iter()
            .any(|p| p["pattern"] == "general")
    );

    let listed = forge(temp.path(), &["playbooks"]);
    assert!(listed.status.success());
    let mut listed: Vec<String> = stdout_json(&listed)
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|p| p["pattern"].as_str().map(str::to_string))
        .collect();
    let mut expected: Vec<String> = mined
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|p| p["pattern"].as_str().map(str::to_string))
        .collect();
    listed.sort();
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn unknown_task_and_missing_prd_are_invalid() {
    let temp = project();
    assert_eq!(
        forge(temp.path(), &["history", "task-missing"]).status.code(),
        Some(1)
    );
    assert_eq!(
        forge(temp.path(), &["run", "--prd", "nope.json"]).status.code(),
        Some(1)
    );
}

#[test]
fn no_events_flag_skips_the_event_log() {
    let temp = project();
    let prd = temp.path().join("prd.json");

    let run = forge(
        temp.path(),
        &["run", "--prd", prd.to_str().expect("utf8"), "--stub", "--no-events"],
    );
    assert!(run.status.success(), "{run:?}");
    assert!(!temp.path().join(".forge/events.jsonl").exists());
}

#[cfg(unix)]
#[test]
fn sigint_aborts_a_running_agent() {
    use std::process::Stdio;
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let temp = project();
    let config_path = temp.path().join(".forge/config.toml");
    let mut config = fs::read_to_string(&config_path).expect("config");
    config.push_str(
        "\n[executor.batch]\nprogram = \"sh\"\nargs = [\"-c\", \"sleep 30\"]\ntarget_dirs = []\n",
    );
    fs::write(&config_path, config).expect("write config");
    let prd = temp.path().join("prd.json");
    let events = temp.path().join(".forge/events.jsonl");

    let child = Command::new(env!("CARGO_BIN_EXE_forge"))
        .arg("--root")
        .arg(temp.path())
        .args(["run", "--prd", prd.to_str().expect("utf8")])
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn forge");

    let started = Instant::now();
    while !fs::read_to_string(&events).is_ok_and(|e| e.contains("agent_run")) {
        assert!(started.elapsed() < Duration::from_secs(20), "agent never started");
        thread::sleep(Duration::from_millis(50));
    }
    let pid = i32::try_from(child.id()).expect("pid");
    kill(Pid::from_raw(pid), Signal::SIGINT).expect("signal forge");

    let output = child.wait_with_output().expect("wait forge");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(output.status.code(), Some(2), "{output:?}");
    let result = stdout_json(&output);
    assert_eq!(result["status"], "escalated");
    assert!(
        result["message"]
            .as_str()
            .is_some_and(|m| m.contains("aborted by operator after 1 iteration(s)"))
    );
}
