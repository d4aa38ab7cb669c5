use replyflow::engine::VariantTag;
use replyflow::{CallTrace, JsonlTraceSink, TraceError, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    call_index: usize,
    variant_tag: String,
    error: Option<String>,
}

fn make_trace(call_index: usize) -> CallTrace {
    CallTrace {
        timestamp_ms: 0,
        run_id: "run".to_string(),
        call_index,
        seed: 42 + call_index as u32,
        variant_tag: VariantTag::for_index(call_index),
        instruction: "Ask a brief clarifying question.".to_string(),
        input_hash: "input_hash".to_string(),
        model: "ibm/granite-3-8b-instruct".to_string(),
        temperature: 0.25,
        top_p: 0.8,
        top_k: 20,
        max_new_tokens: 120,
        latency_ms: 12,
        token_count: Some(9),
        avg_log_prob: Some(-1.1),
        emptied: false,
        error_code: None,
        error: None,
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(0)).unwrap();
    sink.record(make_trace(1)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: TraceRow = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.call_index, 0);
    assert_eq!(first.variant_tag, "primary");
    assert!(first.error.is_none());
    let second: TraceRow = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.variant_tag, "alt");
}

#[test]
fn jsonl_trace_sink_fails_on_unwritable_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing").join("trace.jsonl");
    assert!(matches!(JsonlTraceSink::new(&path), Err(TraceError::Io(_))));
}
