//! Unit tests for the per-session stream pipeline.

use assessment_relay::config::GlobalConfig;
use assessment_relay::models::event::{DiagnosticKind, SessionEvent};
use assessment_relay::models::session::TerminalSignal;
use assessment_relay::stream::processor::{ProcessorOutput, StreamProcessor};

fn processor(auto_confirm: Option<bool>) -> StreamProcessor {
    StreamProcessor::from_config(&GlobalConfig::default(), auto_confirm).expect("defaults compile")
}

fn frame(payload: &str) -> String {
    let config = GlobalConfig::default();
    format!(
        "{}{payload}{}",
        config.stream.begin_sentinel, config.stream.end_sentinel
    )
}

fn events(outputs: Vec<ProcessorOutput>) -> Vec<SessionEvent> {
    outputs
        .into_iter()
        .filter_map(|output| match output {
            ProcessorOutput::Event(event) => Some(event),
            ProcessorOutput::Respond(_) => None,
        })
        .collect()
}

fn chunk_text(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::OutputChunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn frame_types(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Frame { frame } => Some(frame.kind.type_name().to_owned()),
            _ => None,
        })
        .collect()
}

fn tool_stream() -> String {
    format!(
        "{}hello\nworld\n{}",
        frame(r#"{"type":"tool_start","tool_name":"python_repl"}"#),
        frame(r#"{"type":"tool_end"}"#)
    )
}

// ── Tool windows ──────────────────────────────────────────────────────────────

#[test]
fn tool_window_output_is_reconstructed_between_frames() {
    let mut processor = processor(None);

    let events = events(processor.process(tool_stream().as_bytes()));

    assert_eq!(chunk_text(&events), "hello\nworld\n");
    assert_eq!(frame_types(&events), vec!["tool_start", "tool_end"]);
    assert!(matches!(events.first(), Some(SessionEvent::Frame { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::Frame { frame }) if frame.kind.type_name() == "tool_end"));
    match &events[1] {
        SessionEvent::OutputChunk {
            tool_name,
            sequence,
            ..
        } => {
            assert_eq!(tool_name, "python_repl");
            assert_eq!(*sequence, 0);
        }
        other => panic!("expected output chunk, got {other:?}"),
    }
}

#[test]
fn tool_window_reconstruction_survives_byte_by_byte_feeding() {
    let mut processor = processor(None);
    let mut collected = Vec::new();

    for byte in tool_stream().as_bytes() {
        collected.extend(events(processor.process(std::slice::from_ref(byte))));
    }
    collected.extend(events(processor.finish()));

    assert_eq!(chunk_text(&collected), "hello\nworld\n");
    assert_eq!(frame_types(&collected), vec!["tool_start", "tool_end"]);
}

#[test]
fn consolidated_tool_output_suppresses_raw_chunks() {
    let mut processor = processor(None);
    let stream = format!(
        "{}raw copy\n{}{}",
        frame(r#"{"type":"tool_start","tool_name":"curl"}"#),
        frame(r#"{"type":"tool_output","tool_name":"curl","output":"raw copy\n"}"#),
        frame(r#"{"type":"tool_end","tool_name":"curl"}"#)
    );

    let events = events(processor.process(stream.as_bytes()));

    assert!(chunk_text(&events).is_empty());
    assert_eq!(frame_types(&events), vec!["tool_start", "tool_output", "tool_end"]);
}

#[test]
fn step_boundary_closes_the_open_window() {
    let mut processor = processor(None);
    let stream = format!(
        "{}partial{}after",
        frame(r#"{"type":"tool_start","tool_name":"nmap"}"#),
        frame(r#"{"type":"step","index":2}"#)
    );

    let events = events(processor.process(stream.as_bytes()));

    assert_eq!(chunk_text(&events), "partial");
}

#[test]
fn finish_force_flushes_an_open_window() {
    let mut processor = processor(None);
    let stream = format!(
        "{}still running",
        frame(r#"{"type":"tool_start","tool_name":"sqlmap"}"#)
    );

    let during = events(processor.process(stream.as_bytes()));
    assert!(chunk_text(&during).is_empty());

    let at_end = events(processor.finish());
    assert_eq!(chunk_text(&at_end), "still running");
}

// ── Faults and completion ─────────────────────────────────────────────────────

#[test]
fn malformed_frame_becomes_a_diagnostic() {
    let mut processor = processor(None);
    let stream = format!(
        "{}{}{}",
        frame(r#"{"type":"message","content":"one"}"#),
        frame("not-json"),
        frame(r#"{"type":"message","content":"two"}"#)
    );

    let events = events(processor.process(stream.as_bytes()));

    assert_eq!(events.len(), 3);
    assert_eq!(frame_types(&events), vec!["message", "message"]);
    assert!(matches!(
        &events[1],
        SessionEvent::Diagnostic {
            kind: DiagnosticKind::FrameParse,
            ..
        }
    ));
}

#[test]
fn completion_marker_is_tracked() {
    let mut processor = processor(None);
    assert_eq!(
        processor.completion().on_stream_end(),
        TerminalSignal::Stopped
    );

    processor.process(frame(r#"{"type":"complete","summary":"3 findings"}"#).as_bytes());

    assert_eq!(
        processor.completion().on_stream_end(),
        TerminalSignal::Complete
    );
}

// ── Prompts ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn raw_prompt_text_produces_a_response() {
    let mut processor = processor(Some(true));

    let outputs = processor.process(b"Really continue? [y/n] ");

    let responses: Vec<_> = outputs
        .iter()
        .filter_map(|output| match output {
            ProcessorOutput::Respond(response) => Some(response),
            ProcessorOutput::Event(_) => None,
        })
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].text, "y");
}

#[tokio::test(start_paused = true)]
async fn prompts_inside_frames_are_not_answered() {
    let mut processor = processor(Some(true));

    let outputs = processor
        .process(frame(r#"{"type":"message","content":"Continue? [y/n]"}"#).as_bytes());

    assert!(outputs
        .iter()
        .all(|output| matches!(output, ProcessorOutput::Event(_))));
}

#[tokio::test(start_paused = true)]
async fn prompt_text_split_by_a_frame_is_not_joined() {
    let mut processor = processor(Some(true));
    let stream = format!(
        "Continue? {}[y/n] ",
        frame(r#"{"type":"status","message":"scanning"}"#)
    );

    let outputs = processor.process(stream.as_bytes());

    assert!(outputs
        .iter()
        .all(|output| matches!(output, ProcessorOutput::Event(_))));
    let later = processor.process(b"Proceed? [y/n] ");
    assert!(later
        .iter()
        .any(|output| matches!(output, ProcessorOutput::Respond(_))));
}

#[test]
fn prompts_are_ignored_when_auto_confirm_is_off() {
    let mut processor = processor(None);
    let outputs = processor.process(b"Continue? [y/n]");
    assert!(outputs
        .iter()
        .all(|output| matches!(output, ProcessorOutput::Event(_))));
}
