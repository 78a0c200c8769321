//! Integration tests for session launch: slot ownership, validation,
//! runtime failures and topology selection.

use assessment_relay::config::GlobalConfig;
use assessment_relay::models::event::{LifecycleStage, SessionEvent};
use assessment_relay::models::session::{LaunchParams, SessionState, TerminalSignal, Topology};
use assessment_relay::orchestrator::session_manager::{
    render_command, ExecuteOptions, SESSION_LABEL,
};
use assessment_relay::runtime::discovery::TopologyOverride;
use assessment_relay::AppError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::test_helpers::{
    collect_until_terminated, manager, test_config, FakeRuntime, TEST_TIMEOUT,
};

fn params() -> LaunchParams {
    LaunchParams::new("10.0.0.5", "recon")
}

fn reuse_config() -> GlobalConfig {
    let mut config = test_config();
    config.reuse.enabled = true;
    config.reuse.instance_name = Some("agent-shared".into());
    config
}

#[tokio::test]
async fn second_execute_while_active_is_rejected() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, test_config());

    let first = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("first session starts");
    assert!(manager.is_active());
    assert_eq!(manager.active_session_id().as_deref(), Some(first.id()));

    let err = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect_err("slot is taken");
    assert!(matches!(err, AppError::AlreadyActive(_)));
    assert_eq!(runtime.count_calls("create:"), 1);

    assert_eq!(first.stop().await, TerminalSignal::Stopped);
    assert!(!manager.is_active());
}

#[tokio::test]
async fn invalid_params_fail_before_any_runtime_call() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, test_config());

    let err = manager
        .execute(LaunchParams::new("", "recon"), ExecuteOptions::default())
        .await
        .expect_err("target is required");

    assert!(matches!(err, AppError::Validation(_)));
    assert!(runtime.calls().is_empty());
    assert!(!manager.is_active());
}

#[tokio::test]
async fn unavailable_runtime_propagates_and_frees_the_slot() {
    let runtime = FakeRuntime::new();
    runtime.set_unavailable(Some("daemon down"));
    let manager = manager(&runtime, test_config());

    let err = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect_err("runtime is down");
    assert!(matches!(err, AppError::RuntimeUnavailable(msg) if msg.contains("daemon down")));
    assert!(!manager.is_active());

    runtime.set_unavailable(None);
    let handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("runtime is back");
    handle.stop().await;
}

#[tokio::test]
async fn fresh_topology_without_image_is_unavailable() {
    let runtime = FakeRuntime::new();
    let mut config = test_config();
    config.runtime.image = None;
    let manager = manager(&runtime, config);

    let err = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect_err("no image");

    assert!(matches!(err, AppError::RuntimeUnavailable(msg) if msg.contains("no image")));
    assert_eq!(runtime.count_calls("create:"), 0);
    assert!(!manager.is_active());
}

#[tokio::test]
async fn fresh_instance_spec_carries_session_identity() {
    let runtime = FakeRuntime::new();
    let mut config = test_config();
    config.env.vars.insert("LOG_LEVEL".into(), "info".into());
    let manager = manager(&runtime, config);

    let handle = manager
        .execute(
            params(),
            ExecuteOptions {
                env: vec![("LOG_LEVEL".into(), "debug".into())],
                topology: Some(TopologyOverride::Fresh),
                ..ExecuteOptions::default()
            },
        )
        .await
        .expect("session starts");

    assert_eq!(handle.control().topology(), Topology::FreshInstance);
    let created = runtime.created();
    let spec = created.first().expect("instance created");
    assert_eq!(spec.image, "agent:test");
    assert!(spec.name.starts_with("assessment-"));
    assert_eq!(spec.labels.get(SESSION_LABEL).map(String::as_str), Some(handle.id()));
    assert_eq!(spec.command, vec!["agent", "--target", "10.0.0.5", "--module", "recon"]);
    assert!(spec.env.contains(&("LOG_LEVEL".into(), "debug".into())));
    assert!(spec.env.contains(&("AGENT_TARGET".into(), "10.0.0.5".into())));
    assert!(spec.env.contains(&("AGENT_SESSION_ID".into(), handle.id().to_owned())));

    handle.stop().await;
}

#[tokio::test]
async fn fresh_instance_joins_the_sibling_network() {
    let runtime = FakeRuntime::new();
    runtime.add_instance("target-app", &[("stack", "lab")], &["bridge", "lab-net"]);
    let mut config = test_config();
    config.reuse.sibling_label = Some("stack=lab".into());
    let manager = manager(&runtime, config);

    let handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("session starts");

    assert_eq!(runtime.created()[0].network.as_deref(), Some("lab-net"));
    handle.stop().await;
}

#[tokio::test]
async fn running_shared_instance_is_exec_d_into_and_interrupted_on_stop() {
    let runtime = FakeRuntime::new();
    runtime.add_instance("agent-shared", &[], &[]);
    let manager = manager(&runtime, reuse_config());

    let handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("session starts");
    let mut agent = runtime.take_agent();

    assert_eq!(handle.control().topology(), Topology::ExecIntoShared);
    assert_eq!(handle.control().instance().id, "id-agent-shared");
    assert_eq!(runtime.count_calls("create:"), 0);
    assert_eq!(runtime.count_calls("exec:id-agent-shared"), 1);
    assert!(runtime.exec_env()[0].contains(&("AGENT_MODULE".into(), "recon".into())));

    assert_eq!(handle.stop().await, TerminalSignal::Stopped);

    let mut received = String::new();
    tokio::time::timeout(TEST_TIMEOUT, agent.input.read_to_string(&mut received))
        .await
        .expect("input closes after teardown")
        .expect("read agent input");
    assert_eq!(received, "\u{3}");
    assert_eq!(runtime.count_calls("kill:"), 0);
}

#[tokio::test]
async fn forced_shared_topology_without_instance_fails() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, reuse_config());

    let err = manager
        .execute(
            params(),
            ExecuteOptions {
                topology: Some(TopologyOverride::Shared),
                ..ExecuteOptions::default()
            },
        )
        .await
        .expect_err("nothing to exec into");

    assert!(matches!(err, AppError::RuntimeUnavailable(_)));
    assert!(!manager.is_active());
}

#[tokio::test]
async fn input_is_written_while_active_and_rejected_afterwards() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, test_config());
    let mut handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("session starts");
    let mut agent = runtime.take_agent();
    assert_eq!(handle.state(), SessionState::Active);

    handle.send_input("hello").await.expect("input accepted");
    let mut line = [0_u8; 6];
    tokio::time::timeout(TEST_TIMEOUT, agent.input.read_exact(&mut line))
        .await
        .expect("input arrives")
        .expect("read agent input");
    assert_eq!(&line, b"hello\n");

    agent.output.shutdown().await.expect("close agent output");
    drop(agent.output);
    collect_until_terminated(&mut handle).await;

    let err = handle.send_input("too late").await.expect_err("session ended");
    assert!(matches!(err, AppError::NotActive(_)));
    assert!(!handle.is_active());
}

#[tokio::test]
async fn startup_is_narrated_before_output() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime, test_config());
    let mut handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("session starts");

    let first = handle.next_event().await.expect("narration");
    assert!(matches!(
        first,
        SessionEvent::Lifecycle {
            stage: LifecycleStage::Starting { ref detail },
            ..
        } if detail == "resolving execution topology"
    ));

    handle.stop().await;
    let events = collect_until_terminated(&mut handle).await;
    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Lifecycle {
            stage: LifecycleStage::Starting { detail },
            ..
        } if detail == "attaching to agent stream"
    )));
}

#[tokio::test]
async fn zero_event_capacity_still_runs_a_session() {
    let runtime = FakeRuntime::new();
    let mut config = test_config();
    config.stream.event_channel_capacity = 0;
    let manager = manager(&runtime, config);

    let mut handle = manager
        .execute(params(), ExecuteOptions::default())
        .await
        .expect("session starts");

    assert_eq!(handle.stop().await, TerminalSignal::Stopped);
    let events = collect_until_terminated(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Terminated {
            signal: TerminalSignal::Stopped,
            ..
        })
    ));
}

#[test]
fn command_template_substitutes_placeholders() {
    let template: Vec<String> = ["run", "{target}", "--module={module}", "--id", "{session_id}"]
        .into_iter()
        .map(str::to_owned)
        .collect();

    let rendered = render_command(&template, &params(), "abc");

    assert_eq!(rendered, vec!["run", "10.0.0.5", "--module=recon", "--id", "abc"]);
}
