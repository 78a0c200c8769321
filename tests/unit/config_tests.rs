//! Unit tests for configuration parsing, defaults and validation.

use std::io::Write;

use assessment_relay::models::prompt::RemovalRule;
use assessment_relay::{config::GlobalConfig, AppError};
use serial_test::serial;

fn sample_toml() -> &'static str {
    r#"
[runtime]
binary = "podman"
image = "registry.local/agent:1.4"
instance_prefix = "scan"
agent_command = ["agent", "run", "--target", "{target}", "--session", "{session_id}"]
workdir = "/work"
auto_remove = false

[runtime.labels]
team = "red"

[reuse]
enabled = true
instance_name = "agent-shared"
label = "role=agent"
infer_network = false
network = "lab-net"

[env]
forward = ["HTTPS_PROXY"]

[env.vars]
LOG_LEVEL = "debug"

[prompts]
auto_confirm = true
response_delay_ms = 50
repeat = false

[[prompts.patterns]]
name = "overwrite"
pattern = "Overwrite?"
response = "n"
remove = "line"

[stream]
begin_sentinel = "@@BEGIN@@"
end_sentinel = "@@END@@"
max_buffer_bytes = 4096
chunk_threshold_bytes = 512
min_split_bytes = 128
max_window_bytes = 2048
completion_events = ["complete", "report_ready"]
ready_delay_ms = 0
max_read_errors = 5
"#
}

#[test]
fn empty_document_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");

    assert_eq!(config.runtime.binary, "docker");
    assert!(config.runtime.image.is_none());
    assert!(config.runtime.auto_remove);
    assert!(!config.reuse.enabled);
    assert!(config.reuse.infer_network);
    assert!(!config.prompts.auto_confirm);
    assert_eq!(config.prompts.patterns.len(), 4);
    assert_eq!(config.stream.begin_sentinel, "<<<AGENT_EVENT>>>");
    assert_eq!(config.stream.max_buffer_bytes, 1_048_576);
    assert_eq!(config.stream.completion_events, vec!["complete".to_owned()]);
    assert_eq!(config, GlobalConfig::default());
}

#[test]
fn full_document_parses_every_section() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("sample config is valid");

    assert_eq!(config.runtime.binary, "podman");
    assert_eq!(config.runtime.image.as_deref(), Some("registry.local/agent:1.4"));
    assert_eq!(config.runtime.labels.get("team").map(String::as_str), Some("red"));
    assert_eq!(config.runtime.workdir.as_deref(), Some("/work"));
    assert!(!config.runtime.auto_remove);

    assert!(config.reuse.enabled);
    assert_eq!(config.reuse.instance_name.as_deref(), Some("agent-shared"));
    assert_eq!(config.reuse.network.as_deref(), Some("lab-net"));

    assert_eq!(config.env.forward, vec!["HTTPS_PROXY".to_owned()]);
    assert!(config.prompts.auto_confirm);
    assert!(config.prompts.repeat_delay().is_none());
    assert_eq!(config.prompts.patterns.len(), 1);
    assert_eq!(config.prompts.patterns[0].remove, RemovalRule::Line);
    assert!(!config.prompts.patterns[0].regex);

    assert_eq!(config.stream.max_read_errors, 5);
    assert_eq!(config.stream.completion_events.len(), 2);
}

// ── Validation ────────────────────────────────────────────────────────────────

fn expect_config_error(toml: &str, fragment: &str) {
    match GlobalConfig::from_toml_str(toml) {
        Err(AppError::Config(msg)) => assert!(
            msg.contains(fragment),
            "error `{msg}` does not mention `{fragment}`"
        ),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn inverted_chunk_limits_are_rejected() {
    expect_config_error(
        "[stream]\nchunk_threshold_bytes = 100\nmin_split_bytes = 100\n",
        "min_split_bytes",
    );
    expect_config_error(
        "[stream]\nchunk_threshold_bytes = 4096\nmin_split_bytes = 10\nmax_window_bytes = 1024\n",
        "max_window_bytes",
    );
}

#[test]
fn zero_buffer_cap_is_rejected() {
    expect_config_error("[stream]\nmax_buffer_bytes = 0\n", "max_buffer_bytes");
}

#[test]
fn sentinels_must_be_distinct_and_non_empty() {
    expect_config_error("[stream]\nbegin_sentinel = \"\"\n", "sentinels");
    expect_config_error(
        "[stream]\nbegin_sentinel = \"@@\"\nend_sentinel = \"@@\"\n",
        "differ",
    );
}

#[test]
fn label_selectors_need_key_value_form() {
    expect_config_error("[reuse]\nlabel = \"role\"\n", "key=value");
}

#[test]
fn invalid_prompt_regex_is_rejected() {
    expect_config_error(
        "[[prompts.patterns]]\nname = \"bad\"\npattern = \"(\"\nregex = true\nresponse = \"y\"\n",
        "bad",
    );
}

#[test]
fn unknown_field_types_are_config_errors() {
    let err = GlobalConfig::from_toml_str("[stream]\nmax_buffer_bytes = \"lots\"\n")
        .expect_err("string is not a size");
    assert!(matches!(err, AppError::Config(msg) if msg.starts_with("invalid config")));
}

// ── Loading from disk ─────────────────────────────────────────────────────────

#[test]
fn load_from_path_reads_a_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("file config is valid");

    assert_eq!(config.runtime.instance_prefix, "scan");
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml"))
        .expect_err("file does not exist");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("failed to read config")));
}

// ── Agent environment ─────────────────────────────────────────────────────────

#[test]
#[serial]
fn agent_env_forwards_host_variables_and_explicit_vars_win() {
    std::env::set_var("RELAY_TEST_FORWARDED", "from-host");
    std::env::set_var("RELAY_TEST_OVERRIDDEN", "from-host");
    std::env::remove_var("RELAY_TEST_UNSET");

    let config = GlobalConfig::from_toml_str(
        r#"
[env]
forward = ["RELAY_TEST_FORWARDED", "RELAY_TEST_OVERRIDDEN", "RELAY_TEST_UNSET"]

[env.vars]
RELAY_TEST_OVERRIDDEN = "from-config"
STATIC = "1"
"#,
    )
    .expect("valid config");

    let env = config.agent_env();

    assert!(env.contains(&("RELAY_TEST_FORWARDED".into(), "from-host".into())));
    assert!(env.contains(&("RELAY_TEST_OVERRIDDEN".into(), "from-config".into())));
    assert!(env.contains(&("STATIC".into(), "1".into())));
    assert!(!env.iter().any(|(key, _)| key == "RELAY_TEST_UNSET"));

    std::env::remove_var("RELAY_TEST_FORWARDED");
    std::env::remove_var("RELAY_TEST_OVERRIDDEN");
}
