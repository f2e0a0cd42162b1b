use std::path::PathBuf;
use std::process::Command;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("campaign-cli-test-{}.sqlite", ulid::Ulid::new()))
}

fn run_cli(args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_campaign-engine"))
        .args(args)
        .output();
    assert!(output.is_ok());
    let output = output.unwrap_or_else(|_| unreachable!());
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    (output.status.success(), stdout)
}

fn json_field(line: &str, field: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(line.trim())
        .unwrap_or_else(|_| unreachable!());
    value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_else(|| unreachable!())
        .to_string()
}

#[test]
fn campaign_lifecycle_through_the_binary() {
    let db = temp_db_path();
    let db_str = db.to_string_lossy().to_string();

    let (ok, _) = run_cli(&["migrate", "--db", &db_str]);
    assert!(ok);

    let (ok, created) = run_cli(&[
        "campaign",
        "create",
        "--db",
        &db_str,
        "--name",
        "spring-launch",
        "--sequence",
        "intro,follow-up-1",
        "--daily-quota",
        "10",
    ]);
    assert!(ok);
    let campaign_id = json_field(&created, "campaign_id");

    let (ok, lead) = run_cli(&[
        "lead",
        "add",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
        "--email",
        "ada@example.com",
        "--consent",
        "granted",
    ]);
    assert!(ok);
    let lead_id = json_field(&lead, "lead_id");
    assert!(!lead_id.is_empty());

    let (ok, summary) = run_cli(&[
        "tick",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
        "--batch-size",
        "10",
    ]);
    assert!(ok);
    let summary: serde_json::Value =
        serde_json::from_str(summary.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(summary["disposition"], "completed");
    assert_eq!(summary["counters"]["jobs_created"], 1);
    assert_eq!(summary["counters"]["attempts_succeeded"], 1);

    let (ok, jobs) = run_cli(&["jobs", "--db", &db_str, "--campaign-id", &campaign_id]);
    assert!(ok);
    assert_eq!(jobs.trim().lines().count(), 1);
    let job: serde_json::Value =
        serde_json::from_str(jobs.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(job["status"], "sent");
    assert_eq!(job["lead_id"], lead_id);

    let (ok, runs) = run_cli(&["runs", "--db", &db_str, "--campaign-id", &campaign_id]);
    assert!(ok);
    assert_eq!(runs.trim().lines().count(), 1);

    // Pause blocks the next tick entirely.
    let (ok, _) = run_cli(&[
        "campaign",
        "pause",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
    ]);
    assert!(ok);
    let (ok, paused) = run_cli(&[
        "tick",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
    ]);
    assert!(ok);
    let paused: serde_json::Value =
        serde_json::from_str(paused.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(paused["disposition"], "paused");
    assert_eq!(paused["counters"]["leads_processed"], 0);
}

#[test]
fn kill_switch_blocks_ticks_until_released() {
    let db = temp_db_path();
    let db_str = db.to_string_lossy().to_string();

    let (ok, created) = run_cli(&[
        "campaign",
        "create",
        "--db",
        &db_str,
        "--name",
        "killable",
        "--sequence",
        "intro",
    ]);
    assert!(ok);
    let campaign_id = json_field(&created, "campaign_id");

    let (ok, _) = run_cli(&[
        "lead",
        "add",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
        "--email",
        "ada@example.com",
    ]);
    assert!(ok);

    let (ok, _) = run_cli(&[
        "campaign",
        "kill",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
    ]);
    assert!(ok);

    let (ok, killed) = run_cli(&["tick", "--db", &db_str, "--campaign-id", &campaign_id]);
    assert!(ok);
    let killed: serde_json::Value =
        serde_json::from_str(killed.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(killed["disposition"], "kill_switch");
    assert_eq!(killed["counters"]["jobs_created"], 0);

    let (ok, _) = run_cli(&[
        "campaign",
        "kill",
        "--db",
        &db_str,
        "--campaign-id",
        &campaign_id,
        "--release",
    ]);
    assert!(ok);

    let (ok, cleared) = run_cli(&["tick", "--db", &db_str, "--campaign-id", &campaign_id]);
    assert!(ok);
    let cleared: serde_json::Value =
        serde_json::from_str(cleared.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(cleared["disposition"], "completed");
    assert_eq!(cleared["counters"]["jobs_created"], 1);
}

#[test]
fn unsubscribe_and_suppression_are_honored_by_ticks() {
    let db = temp_db_path();
    let db_str = db.to_string_lossy().to_string();

    let (ok, created) = run_cli(&[
        "campaign",
        "create",
        "--db",
        &db_str,
        "--name",
        "compliance",
        "--sequence",
        "intro",
    ]);
    assert!(ok);
    let campaign_id = json_field(&created, "campaign_id");

    for email in ["optout@example.com", "blocked@example.com"] {
        let (ok, _) = run_cli(&[
            "lead",
            "add",
            "--db",
            &db_str,
            "--campaign-id",
            &campaign_id,
            "--email",
            email,
            "--consent",
            "granted",
        ]);
        assert!(ok);
    }

    let (ok, _) = run_cli(&[
        "unsubscribe",
        "add",
        "--db",
        &db_str,
        "--email",
        "optout@example.com",
    ]);
    assert!(ok);
    let (ok, _) = run_cli(&[
        "suppress",
        "add",
        "--db",
        &db_str,
        "--identity",
        "blocked@example.com",
        "--reason",
        "complaint",
    ]);
    assert!(ok);

    let (ok, summary) = run_cli(&["tick", "--db", &db_str, "--campaign-id", &campaign_id]);
    assert!(ok);
    let summary: serde_json::Value =
        serde_json::from_str(summary.trim()).unwrap_or_else(|_| unreachable!());
    assert_eq!(summary["counters"]["skipped_unsubscribed"], 1);
    assert_eq!(summary["counters"]["skipped_suppressed"], 1);
    assert_eq!(summary["counters"]["jobs_created"], 0);
}

#[test]
fn invalid_campaign_id_fails_cleanly() {
    let db = temp_db_path();
    let db_str = db.to_string_lossy().to_string();
    let (ok, _) = run_cli(&["migrate", "--db", &db_str]);
    assert!(ok);

    let (ok, _) = run_cli(&["tick", "--db", &db_str, "--campaign-id", "not-a-ulid"]);
    assert!(!ok);
}
