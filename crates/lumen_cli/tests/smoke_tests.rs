//! CLI smoke tests: verify basic binary behavior.

use std::io::Write;
use std::process::Command;

fn cli_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lumen"))
}

fn snapshot(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).expect("stdout should be a JSON snapshot")
}

#[test]
fn test_help_flag() {
    let output = cli_bin().arg("--help").output().expect("failed to run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage"), "Expected usage info in --help output");
}

#[test]
fn test_version_flag() {
    let output = cli_bin().arg("--version").output().expect("failed to run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("lumen"), "Expected binary name in --version output");
}

#[test]
fn test_missing_config_falls_back_to_defaults() {
    let output = cli_bin()
        .args(["--config", "/tmp/nonexistent_lumen_config_12345.toml", "--ticks", "3"])
        .output()
        .expect("failed to run");
    assert!(output.status.success());
    let snap = snapshot(&output);
    assert_eq!(snap["tick_count"], 3);
    assert_eq!(snap["node_count"], 0);
}

#[test]
fn test_seeded_graph_with_stimulus() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(
        seed,
        r#"{{
            "nodes": [
                {{"id": "coffee", "kind": "concept"}},
                {{"id": "tea", "kind": "concept"}}
            ],
            "links": [{{"source": "coffee", "target": "tea", "log_weight": -0.5}}]
        }}"#
    )
    .unwrap();

    let output = cli_bin()
        .arg("--graph")
        .arg(seed.path())
        .args(["--ticks", "2", "--stimulus", "coffee please", "--config", "/tmp/nonexistent_lumen_config_12345.toml"])
        .output()
        .expect("failed to run");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let snap = snapshot(&output);
    assert_eq!(snap["node_count"], 2);
    assert!(snap["global_energy"].as_f64().unwrap() > 0.0);
}

#[test]
fn test_invalid_graph_seed_fails() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(seed, "not json").unwrap();
    let output = cli_bin()
        .arg("--graph")
        .arg(seed.path())
        .output()
        .expect("failed to run");
    assert!(!output.status.success());
}

#[test]
fn test_dangling_link_rejected() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(
        seed,
        r#"{{"nodes": [{{"id": "a"}}], "links": [{{"source": "a", "target": "missing"}}]}}"#
    )
    .unwrap();
    let output = cli_bin()
        .arg("--graph")
        .arg(seed.path())
        .output()
        .expect("failed to run");
    assert!(!output.status.success());
}
