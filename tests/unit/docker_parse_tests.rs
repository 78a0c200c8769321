//! Unit tests for container-CLI argument building and output parsing.

use std::collections::BTreeMap;

use assessment_relay::runtime::docker::{create_args, parse_inspect, parse_ps_line};
use assessment_relay::runtime::{InstanceHandle, InstanceSpec, RuntimeSignal};
use assessment_relay::AppError;

#[test]
fn create_args_carry_every_spec_field() {
    let spec = InstanceSpec {
        name: "assessment-1a2b3c4d".into(),
        image: "agent:test".into(),
        command: vec!["agent".into(), "--target".into(), "10.0.0.5".into()],
        env: vec![("AGENT_TARGET".into(), "10.0.0.5".into())],
        network: Some("lab-net".into()),
        labels: BTreeMap::from([("assessment-relay.session".to_owned(), "abc".to_owned())]),
        workdir: Some("/work".into()),
        auto_remove: true,
    };

    let args = create_args(&spec);

    assert_eq!(
        args,
        vec![
            "create",
            "-i",
            "--name",
            "assessment-1a2b3c4d",
            "--rm",
            "--network",
            "lab-net",
            "--label",
            "assessment-relay.session=abc",
            "-e",
            "AGENT_TARGET",
            "-w",
            "/work",
            "agent:test",
            "agent",
            "--target",
            "10.0.0.5",
        ]
    );
}

#[test]
fn env_values_never_appear_on_the_command_line() {
    let spec = InstanceSpec {
        name: "n".into(),
        image: "i".into(),
        env: vec![("API_TOKEN".into(), "s3cret".into())],
        ..InstanceSpec::default()
    };

    let args = create_args(&spec);

    assert!(args.contains(&"API_TOKEN".to_owned()));
    assert!(!args.iter().any(|arg| arg.contains("s3cret")));
    assert!(!args.contains(&"--rm".to_owned()));
}

#[test]
fn ps_line_parses_labels_and_state() {
    let line = r#"{"ID":"f00dbabe","Names":"agent-shared","Labels":"role=agent,team=red","State":"running"}"#;

    let parsed = parse_ps_line(line).expect("valid ps line");

    assert_eq!(parsed.id, "f00dbabe");
    assert_eq!(parsed.name, "agent-shared");
    assert!(parsed.running);
    assert!(parsed.has_label("role", "agent"));
    assert!(parsed.has_label("team", "red"));
}

#[test]
fn ps_line_without_state_counts_as_running() {
    let parsed = parse_ps_line(r#"{"ID":"1","Names":"a,b"}"#).expect("valid ps line");

    assert!(parsed.running);
    assert_eq!(parsed.name, "a");
    assert!(parsed.labels.is_empty());

    let exited = parse_ps_line(r#"{"ID":"2","Names":"c","State":"exited"}"#)
        .expect("valid ps line");
    assert!(!exited.running);
}

#[test]
fn malformed_ps_line_is_a_runtime_error() {
    let err = parse_ps_line("CONTAINER ID   IMAGE").expect_err("not json");
    assert!(matches!(err, AppError::Runtime(msg) if msg.contains("unexpected ps output")));
}

#[test]
fn inspect_output_yields_sorted_networks_and_labels() {
    let raw = r#"[{
        "Id": "c0ffee",
        "Name": "/target-app",
        "Config": {"Labels": {"stack": "lab"}},
        "NetworkSettings": {"Networks": {"zeta": {}, "bridge": {}, "lab-net": {}}}
    }]"#;

    let meta = parse_inspect(raw).expect("valid inspect output");

    assert_eq!(meta.id, "c0ffee");
    assert_eq!(meta.name, "target-app");
    assert_eq!(meta.networks, vec!["bridge", "lab-net", "zeta"]);
    assert_eq!(meta.labels.get("stack").map(String::as_str), Some("lab"));
}

#[test]
fn inspect_without_id_is_rejected() {
    let err = parse_inspect(r#"[{"Name":"/x"}]"#).expect_err("no id");
    assert!(matches!(err, AppError::Runtime(_)));
}

#[test]
fn handles_display_short_ids() {
    let named = InstanceHandle {
        id: "0123456789abcdef".into(),
        name: Some("agent".into()),
    };
    assert_eq!(named.to_string(), "agent (0123456789ab)");
    assert_eq!(InstanceHandle::new("abc").to_string(), "abc");
    assert_eq!(RuntimeSignal::Kill.as_str(), "SIGKILL");
}
