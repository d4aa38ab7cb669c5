use std::process::Command;

use replyflow::{GenerationResponse, RankRequest};
use serde_json::json;
use tempfile::tempdir;

fn cli() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_replyflow"));
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn rank_subcommand_writes_shortlist() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("gens.json");
    let out = dir.path().join("resp.json");

    let req = json!({
        "prompt": "Want to grab coffee tomorrow?",
        "generations": [
            {"text": "Assistant: Coffee tomorrow sounds great!", "avgLogProb": -0.7},
            {"text": "\"Sorry, I'm busy tomorrow.\"", "avgLogProb": -1.0},
            {"text": "[SYSTEM]", "avgLogProb": -0.2},
            {"text": "What time were you thinking?", "avgLogProb": -0.9},
            {"text": "Only if it's decaf."}
        ],
        "preferCount": 3
    });
    let parsed: RankRequest = serde_json::from_value(req.clone()).unwrap();
    assert_eq!(parsed.generations.len(), 5);
    std::fs::write(&input, serde_json::to_string(&req).unwrap()).unwrap();

    let status = cli()
        .arg("rank")
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let resp: GenerationResponse =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert!((3..=4).contains(&resp.meta.used_k), "{}", resp.meta.used_k);
    assert_eq!(resp.meta.model_id, "offline");
    assert_eq!(resp.candidates[0].text, "Coffee tomorrow sounds great!");
    assert!(resp.candidates.iter().all(|c| !c.text.contains("SYSTEM")));
    assert_eq!(resp.meta.dropped, 5 - resp.meta.used_k);
}

#[test]
fn plan_subcommand_prints_seeded_plan() {
    let dir = tempdir().unwrap();
    let request = dir.path().join("req.json");
    std::fs::write(
        &request,
        json!({"prompt": "hi", "callCount": 4, "decoding": {"stop": ["Bye"]}}).to_string(),
    )
    .unwrap();

    let output = cli()
        .arg("plan")
        .arg("--request")
        .arg(&request)
        .args(["--seed", "100"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["baseSeed"], 100);
    let calls = plan["calls"].as_array().unwrap();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0]["seed"], 100);
    assert_eq!(calls[3]["seed"], 103);
    assert_eq!(calls[0]["variantTag"], "primary");
    assert!(calls[0]["params"]["temperature"].as_f64().unwrap() <= 0.25);
    assert_eq!(plan["stopSequences"][0], "Bye");
    assert_eq!(plan["stopSequences"].as_array().unwrap().len(), 6);
}

#[test]
fn generate_without_configuration_fails() {
    let dir = tempdir().unwrap();
    let request = dir.path().join("req.json");
    let out = dir.path().join("resp.json");
    std::fs::write(&request, json!({"prompt": "hi"}).to_string()).unwrap();

    let output = cli()
        .env_remove("WATSONX_API_KEY")
        .env_remove("WATSONX_PROJECT_ID")
        .arg("generate")
        .arg("--request")
        .arg(&request)
        .arg("--out")
        .arg(&out)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("WATSONX_API_KEY"));
    assert!(!out.exists());
}
