//! Workflow journeys: classifier routing, template rendering, streaming

use std::sync::Arc;

use serde_json::json;

use mnemo_core::MemoryConfig;
use mnemo_e2e::mocks::MockModel;
use mnemo_workflow::{
    CancelToken, WorkflowConfig, WorkflowEvent, WorkflowExecutor, WorkflowRunInput,
};

fn run_input(message: &str) -> WorkflowRunInput {
    WorkflowRunInput {
        message: message.to_string(),
        user_id: "u1".to_string(),
        workspace_id: "w1".to_string(),
        ..Default::default()
    }
}

fn classifier_workflow(categories: &[&str]) -> WorkflowConfig {
    let ends: Vec<serde_json::Value> = (1..=categories.len())
        .map(|i| {
            json!({
                "id": format!("end_{i}"),
                "type": "end",
                "config": {"outputs": [format!("routed-{i}")]}
            })
        })
        .collect();

    let mut nodes = vec![
        json!({"id": "start", "type": "start", "config": {}}),
        json!({
            "id": "classify",
            "type": "question-classifier",
            "config": {
                "input_variable": "{{sys.message}}",
                "categories": categories
                    .iter()
                    .map(|name| json!({"class_name": name}))
                    .collect::<Vec<_>>(),
            }
        }),
    ];
    nodes.extend(ends);

    let mut edges = vec![json!({"source": "start", "target": "classify"})];
    for i in 1..=categories.len() {
        edges.push(json!({
            "source": "classify",
            "target": format!("end_{i}"),
            "branch": format!("CASE{i}")
        }));
    }

    serde_json::from_value(json!({"nodes": nodes, "edges": edges})).unwrap()
}

// Two-category classification: "我想买一台笔记本电脑" -> 产品咨询 -> CASE1
#[tokio::test]
async fn classifier_two_categories_routes_case1() {
    let model = Arc::new(MockModel::new());
    model.push_reply("产品咨询");

    let executor = WorkflowExecutor::new(
        classifier_workflow(&["产品咨询", "售后服务"]),
        model,
        MemoryConfig::default(),
    )
    .unwrap();
    let output = executor.execute(run_input("我想买一台笔记本电脑")).await.unwrap();

    let classify = &output.node_outputs["classify"]["output"];
    assert_eq!(classify["class_name"], "产品咨询");
    assert_eq!(classify["output"], "CASE1");
    assert_eq!(output.output, "routed-1");
}

// Four-category classification: "我的订单什么时候能到？" -> 订单查询 -> CASE2
#[tokio::test]
async fn classifier_four_categories_routes_case2() {
    let model = Arc::new(MockModel::new());
    model.push_reply("订单查询");

    let executor = WorkflowExecutor::new(
        classifier_workflow(&["产品咨询", "订单查询", "售后服务", "投诉建议"]),
        model,
        MemoryConfig::default(),
    )
    .unwrap();
    let output = executor.execute(run_input("我的订单什么时候能到？")).await.unwrap();

    assert_eq!(output.node_outputs["classify"]["output"]["output"], "CASE2");
    assert_eq!(output.output, "routed-2");
}

// Jinja default() filter produces the fallback for a missing variable in
// non-strict mode; without the filter the value renders empty
#[tokio::test]
async fn jinja_default_filter_and_non_strict_mode() {
    let config: WorkflowConfig = serde_json::from_value(json!({
        "nodes": [
            {"id": "start", "type": "start", "config": {}},
            {
                "id": "render",
                "type": "jinja-render",
                "config": {
                    "template": "[{{ name | default('Guest') }}][{{ name }}]",
                    "mapping": [{"name": "name", "value": "conv.ghost"}],
                    "strict": false
                }
            },
            {"id": "end", "type": "end", "config": {"outputs": ["{{render.output}}"]}}
        ],
        "edges": [
            {"source": "start", "target": "render"},
            {"source": "render", "target": "end"}
        ]
    }))
    .unwrap();

    let executor =
        WorkflowExecutor::new(config, Arc::new(MockModel::new()), MemoryConfig::default()).unwrap();
    let output = executor.execute(run_input("x")).await.unwrap();
    // Missing variable: default() yields Guest, the bare reference renders empty
    assert_eq!(output.output, "[Guest][]");
}

// Full streaming run over the public event surface
#[tokio::test]
async fn streaming_run_public_surface() {
    let model = Arc::new(MockModel::new());
    model.push_reply("streamed reply");

    let config: WorkflowConfig = serde_json::from_value(json!({
        "nodes": [
            {"id": "start", "type": "start", "config": {}},
            {
                "id": "llm1",
                "type": "llm",
                "config": {"user_prompt": "{{sys.message}}", "streaming": true}
            },
            {"id": "end", "type": "end", "config": {"outputs": ["Answer: ", "{{llm1.output}}"]}}
        ],
        "edges": [
            {"source": "start", "target": "llm1"},
            {"source": "llm1", "target": "end"}
        ]
    }))
    .unwrap();

    let executor = Arc::new(
        WorkflowExecutor::new(config, model, MemoryConfig::default()).unwrap(),
    );
    let (mut rx, handle) = executor.execute_stream(run_input("hello"), CancelToken::new());

    let mut assembled = String::new();
    let mut saw_start = false;
    let mut end_output = None;
    while let Some(event) = rx.recv().await {
        if !event.is_public() {
            continue;
        }
        match event {
            WorkflowEvent::Start { .. } => saw_start = true,
            WorkflowEvent::Message { chunk } => assembled.push_str(&chunk),
            WorkflowEvent::End { output, .. } => end_output = Some(output),
            _ => {}
        }
    }
    let output = handle.await.unwrap().unwrap();

    assert!(saw_start);
    assert_eq!(assembled, "Answer: streamed reply");
    assert_eq!(end_output.as_deref(), Some("Answer: streamed reply"));
    assert_eq!(output.output, assembled);
}

// A memory-style read workflow: classify, then answer via llm, with the
// conversation variable counting turns across the run
#[tokio::test]
async fn combined_assigner_and_branch_flow() {
    let model = Arc::new(MockModel::new());

    let config: WorkflowConfig = serde_json::from_value(json!({
        "nodes": [
            {"id": "start", "type": "start", "config": {}},
            {
                "id": "bump",
                "type": "assigner",
                "config": {"assignments": [{
                    "variable_selector": "{{conv.turns}}",
                    "operation": "add",
                    "value": 1
                }]}
            },
            {
                "id": "gate",
                "type": "if-else",
                "config": {"cases": [{
                    "logical_operator": "and",
                    "expressions": [{
                        "left": "{{conv.turns}}",
                        "operator": "ge",
                        "right": 1,
                        "input_type": "constant"
                    }]
                }]}
            },
            {"id": "end_active", "type": "end", "config": {"outputs": ["turn ", "{{conv.turns}}"]}},
            {"id": "end_idle", "type": "end", "config": {"outputs": ["idle"]}}
        ],
        "edges": [
            {"source": "start", "target": "bump"},
            {"source": "bump", "target": "gate"},
            {"source": "gate", "target": "end_active", "branch": "CASE1"},
            {"source": "gate", "target": "end_idle", "branch": "CASE2"}
        ],
        "variables": [{"name": "turns", "type": "number", "default": 0}]
    }))
    .unwrap();

    let executor = WorkflowExecutor::new(config, model, MemoryConfig::default()).unwrap();
    let output = executor.execute(run_input("x")).await.unwrap();
    assert_eq!(output.output, "turn 1");
    assert_eq!(output.conv_variables["turns"], json!(1));
}
