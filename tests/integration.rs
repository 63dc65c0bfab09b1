use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Env {
    dir: TempDir,
    db: PathBuf,
    config: PathBuf,
}

fn env() -> Env {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("affinity.db");
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "[training]\nmin_samples = 6\nlearning_rate = 0.5\nseed = 3\n",
    )
    .unwrap();
    Env { dir, db, config }
}

#[allow(deprecated)]
fn affinity_cmd(env: &Env) -> Command {
    let mut cmd = Command::cargo_bin("affinity").unwrap();
    cmd.env("AFFINITY_DB", &env.db);
    cmd.env("AFFINITY_CONFIG", &env.config);
    cmd.env_remove("RUST_LOG");
    cmd
}

fn query_db(db: &Path, sql: &str) -> Vec<Vec<String>> {
    let conn =
        rusqlite::Connection::open_with_flags(db, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let col_count = stmt.column_count();
    let rows: Vec<Vec<String>> = stmt
        .query_map([], |row| {
            let mut cols = Vec::new();
            for i in 0..col_count {
                let val = row.get_ref(i).unwrap();
                let s = match val {
                    rusqlite::types::ValueRef::Null => "NULL".into(),
                    rusqlite::types::ValueRef::Integer(n) => n.to_string(),
                    rusqlite::types::ValueRef::Real(f) => f.to_string(),
                    rusqlite::types::ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
                    rusqlite::types::ValueRef::Blob(b) => format!("<blob:{}>", b.len()),
                };
                cols.push(s);
            }
            Ok(cols)
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    rows
}

fn stdout_of(cmd: &mut Command) -> String {
    let out = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(out).unwrap()
}

fn failure_stderr(cmd: &mut Command) -> String {
    let out = cmd.assert().failure();
    String::from_utf8_lossy(&out.get_output().stderr).into_owned()
}

fn import_prefs(env: &Env) -> String {
    let doc = env.dir.path().join("prefs.toml");
    std::fs::write(
        &doc,
        r#"
name = "default"
min_score = 0.6

[weights]
physical = 0.6
personality = 0.3
interests = 0.1

[interests]
shared = ["hiking", "yoga"]
dealbreakers = ["smoking"]
"#,
    )
    .unwrap();
    stdout_of(affinity_cmd(env).args(["prefs", "import"]).arg(&doc))
        .trim()
        .to_string()
}

fn write_image(env: &Env, name: &str, vector: &str) -> PathBuf {
    let path = env.dir.path().join(name);
    std::fs::write(env.dir.path().join(format!("{name}.vec.json")), vector).unwrap();
    path
}

fn classify_bio(env: &Env, pref: &str, bio: &str) -> serde_json::Value {
    let out = stdout_of(affinity_cmd(env).args(["classify", "--pref", pref, "--bio", bio]));
    serde_json::from_str(&out).unwrap()
}

#[test]
fn import_registers_active_baseline() {
    let env = env();
    let pref = import_prefs(&env);
    assert_eq!(pref, "1");

    let rows = query_db(
        &env.db,
        "SELECT version_number, family, status FROM model_versions",
    );
    assert_eq!(rows, vec![vec!["1", "baseline", "active"]]);

    let shown: serde_json::Value =
        serde_json::from_str(&stdout_of(affinity_cmd(&env).args(["prefs", "show", "1"]))).unwrap();
    assert_eq!(shown["name"], "default");
    assert_eq!(shown["dealbreaker_interests"][0], "smoking");
}

#[test]
fn classify_shared_interests() {
    let env = env();
    let pref = import_prefs(&env);
    let result = classify_bio(&env, &pref, "Love hiking and yoga");

    let confidence = result["confidence"].as_f64().unwrap();
    assert!((confidence - 0.52).abs() < 1e-4);
    assert_eq!(result["is_match"], false);
    assert_eq!(result["recommendation"], "pass");

    let rows = query_db(
        &env.db,
        "SELECT r.model_version_id, v.total_predictions
         FROM classification_results r JOIN model_versions v ON v.id = r.model_version_id",
    );
    assert_eq!(rows, vec![vec!["1", "1"]]);
}

#[test]
fn dealbreaker_reason_comes_first() {
    let env = env();
    let pref = import_prefs(&env);
    let result = classify_bio(&env, &pref, "Love hiking and yoga, smoking on weekends");

    assert!((result["confidence"].as_f64().unwrap() - 0.45).abs() < 1e-4);
    assert_eq!(result["components"]["interests"].as_f64().unwrap(), 0.0);
    assert_eq!(result["reasons"][0], "dealbreaker interest: smoking");
}

#[test]
fn missing_sidecar_fails_without_writing() {
    let env = env();
    let pref = import_prefs(&env);
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["classify", "--pref", &pref, "--bio", "hi"])
                .arg(env.dir.path().join("nope.jpg"))
        )
        .contains("extraction failed")
    );

    let rows = query_db(&env.db, "SELECT COUNT(*) FROM classification_results");
    assert_eq!(rows[0][0], "0");
    let rows = query_db(&env.db, "SELECT total_predictions FROM model_versions");
    assert_eq!(rows[0][0], "0");
}

#[test]
fn feedback_compensates_counters() {
    let env = env();
    let pref = import_prefs(&env);
    let result = classify_bio(&env, &pref, "Love hiking");
    let id = result["id"].to_string();

    for _ in 0..2 {
        affinity_cmd(&env)
            .args(["feedback", &id, "like"])
            .assert()
            .success();
    }
    let counters = "SELECT likes, dislikes, super_likes FROM model_versions WHERE id = 1";
    assert_eq!(query_db(&env.db, counters), vec![vec!["1", "0", "0"]]);

    affinity_cmd(&env)
        .args(["feedback", &id, "dislike"])
        .assert()
        .success();
    assert_eq!(query_db(&env.db, counters), vec![vec!["0", "1", "0"]]);

    affinity_cmd(&env)
        .args(["unfeedback", &id])
        .assert()
        .success();
    assert_eq!(query_db(&env.db, counters), vec![vec!["0", "0", "0"]]);
    let rows = query_db(
        &env.db,
        "SELECT feedback, feedback_at FROM classification_results",
    );
    assert_eq!(rows, vec![vec!["NULL", "NULL"]]);

    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["feedback", &id, "maybe"])
        )
        .contains("unknown feedback label")
    );
}

#[test]
fn delete_reverses_feedback() {
    let env = env();
    let pref = import_prefs(&env);
    let id = classify_bio(&env, &pref, "yoga")["id"].to_string();
    affinity_cmd(&env)
        .args(["feedback", &id, "super_like"])
        .assert()
        .success();
    affinity_cmd(&env).args(["delete", &id]).assert().success();

    let rows = query_db(
        &env.db,
        "SELECT super_likes, total_predictions FROM model_versions WHERE id = 1",
    );
    assert_eq!(rows, vec![vec!["0", "1"]]);
    affinity_cmd(&env).args(["delete", &id]).assert().failure();
}

#[test]
fn references_enforce_dimensions() {
    let env = env();
    let pref = import_prefs(&env);
    affinity_cmd(&env)
        .args(["reference", "add", "--pref", &pref, "--vector", "[1.0, 0.0, 0.0]"])
        .assert()
        .success();
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["reference", "add", "--pref", &pref, "--vector", "[1.0, 0.0]"])
        )
        .contains("signal shape mismatch")
    );

    let img = write_image(&env, "neg.jpg", "[0.0, 0.0, 2.0]");
    affinity_cmd(&env)
        .args(["reference", "add", "--pref", &pref, "--negative", "--image"])
        .arg(&img)
        .assert()
        .success();

    let rows = query_db(
        &env.db,
        "SELECT polarity, dims FROM reference_signals ORDER BY id",
    );
    assert_eq!(rows, vec![vec!["positive", "3"], vec!["negative", "3"]]);

    // a candidate in the wrong space is rejected
    let bad = write_image(&env, "bad.jpg", "[1.0, 0.0]");
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["classify", "--pref", &pref, "--bio", ""])
                .arg(&bad)
        )
        .contains("signal shape mismatch")
    );
}

#[test]
fn training_requires_enough_feedback() {
    let env = env();
    let pref = import_prefs(&env);
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["train", "--pref", &pref])
        )
        .contains("insufficient training data: 0")
    );

    let rows = query_db(&env.db, "SELECT COUNT(*) FROM model_versions");
    assert_eq!(rows[0][0], "1");
}

#[test]
fn train_then_activate_and_roll_back() {
    let env = env();
    let pref = import_prefs(&env);

    for i in 0..6 {
        let j = i as f32 * 0.02;
        for (name, vector, label) in [
            (format!("l{i}.jpg"), format!("[{}, {j}]", 1.0 - j), "like"),
            (format!("d{i}.jpg"), format!("[{j}, {}]", 1.0 - j), "dislike"),
        ] {
            let img = write_image(&env, &name, &vector);
            let out = stdout_of(
                affinity_cmd(&env)
                    .args(["classify", "--pref", &pref, "--bio", ""])
                    .arg(&img),
            );
            let result: serde_json::Value = serde_json::from_str(&out).unwrap();
            affinity_cmd(&env)
                .args(["feedback", &result["id"].to_string(), label])
                .assert()
                .success();
        }
    }

    let version = stdout_of(affinity_cmd(&env).args(["train", "--pref", &pref]))
        .trim()
        .to_string();
    assert_eq!(
        query_db(&env.db, "SELECT status FROM training_jobs"),
        vec![vec!["completed"]]
    );
    let statuses = "SELECT version_number, status FROM model_versions ORDER BY version_number";
    assert_eq!(
        query_db(&env.db, statuses),
        vec![vec!["1", "active"], vec!["2", "ready"]]
    );

    affinity_cmd(&env)
        .args(["activate", &version])
        .assert()
        .success();
    assert_eq!(
        query_db(&env.db, statuses),
        vec![vec!["1", "retired"], vec!["2", "active"]]
    );

    // rollback
    affinity_cmd(&env).args(["activate", "1"]).assert().success();
    assert_eq!(
        query_db(&env.db, statuses),
        vec![vec!["1", "active"], vec!["2", "retired"]]
    );

    let out = stdout_of(affinity_cmd(&env).args(["versions", "--pref", &pref]));
    assert_eq!(out.lines().count(), 2);
    assert!(out.contains("predictions=12"));
}

#[test]
fn activate_errors_are_reported() {
    let env = env();
    import_prefs(&env);
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["activate", "99"])
        )
        .contains("unknown model version 99")
    );
}

#[test]
fn history_and_stats() {
    let env = env();
    let pref = import_prefs(&env);
    classify_bio(&env, &pref, "Love hiking and yoga");
    classify_bio(&env, &pref, "smoking");

    let out = stdout_of(affinity_cmd(&env).args(["history", "--limit", "500"]));
    assert_eq!(out.lines().count(), 2);

    let out = stdout_of(affinity_cmd(&env).args(["history", "--matches"]));
    assert!(out.is_empty());

    let stats: serde_json::Value =
        serde_json::from_str(&stdout_of(affinity_cmd(&env).args(["stats"]))).unwrap();
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["matches"], 0);
}

#[test]
fn jobs_and_cancel() {
    let env = env();
    import_prefs(&env);
    let out = affinity_cmd(&env).args(["jobs"]).assert().success();
    let stderr = String::from_utf8_lossy(&out.get_output().stderr);
    assert!(stderr.contains("no training jobs"));
    assert!(
        failure_stderr(
            affinity_cmd(&env)
                .args(["cancel", "5"])
        )
        .contains("not found")
    );
}
