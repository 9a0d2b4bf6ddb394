//! Memory journeys: ingest -> retrieve -> orchestrate against real storage

use mnemo_core::{
    IngestRequest, NodeCategory, ReadRequest, SearchRequest, SearchSwitch, SearchType,
    StorageType, TurnMessage, INSUFFICIENT_EVIDENCE,
};
use mnemo_e2e::harness::TestEngine;
use mnemo_e2e::mocks::extraction_reply;

fn turn(user: &str, assistant: &str) -> Vec<TurnMessage> {
    vec![
        TurnMessage {
            role: "user".to_string(),
            content: user.to_string(),
        },
        TurnMessage {
            role: "assistant".to_string(),
            content: assistant.to_string(),
        },
    ]
}

fn ingest_request(end_user_id: &str, messages: Vec<TurnMessage>) -> IngestRequest {
    IngestRequest {
        end_user_id: end_user_id.to_string(),
        messages,
        storage_type: StorageType::Graph,
        config_id: None,
        language: None,
    }
}

fn search_request(end_user_id: &str, query: &str, limit: usize) -> SearchRequest {
    SearchRequest {
        end_user_id: end_user_id.to_string(),
        query_text: query.to_string(),
        search_type: SearchType::Hybrid,
        include: vec![],
        limit,
        rerank_alpha: None,
        activation_boost_factor: None,
        use_forgetting_rerank: false,
    }
}

#[tokio::test]
async fn ingest_creates_expected_node_counts() {
    let engine = TestEngine::new();
    engine.model.push_reply(extraction_reply(
        "The user moved to Berlin",
        "Berlin",
        "The user relocated to Berlin",
    ));

    let report = engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I moved to Berlin last month", "Noted!")),
            &engine.config,
        )
        .await
        .unwrap();

    assert_eq!(report.chunks, 1);
    assert_eq!(report.statements, 1);
    assert_eq!(report.entities_created, 1);
    assert_eq!(report.entities_deduped, 0);
    assert_eq!(report.summaries, 1);

    // dialogue + chunk + statement + entity + summary
    let counts = engine.store.count_nodes("u1").unwrap();
    assert_eq!(counts.total(), 5);
}

#[tokio::test]
async fn second_turn_dedups_entities_case_insensitively() {
    let engine = TestEngine::new();
    engine.model.push_reply(extraction_reply(
        "The user moved to Berlin",
        "Berlin",
        "User relocated",
    ));
    engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I moved to Berlin", "ok")),
            &engine.config,
        )
        .await
        .unwrap();

    engine.model.push_reply(extraction_reply(
        "The user works in berlin",
        "BERLIN",
        "User works there",
    ));
    let report = engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I also work in berlin", "ok")),
            &engine.config,
        )
        .await
        .unwrap();

    assert_eq!(report.entities_created, 0);
    assert_eq!(report.entities_deduped, 1);
    // Still exactly one entity under the scope
    assert_eq!(engine.store.count_nodes("u1").unwrap().entities, 1);
}

#[tokio::test]
async fn hybrid_search_finds_ingested_memory_and_updates_activation() {
    let engine = TestEngine::new();
    engine.model.push_reply(extraction_reply(
        "The user moved to Berlin",
        "Berlin",
        "The user relocated to Berlin",
    ));
    engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I moved to Berlin", "great")),
            &engine.config,
        )
        .await
        .unwrap();

    let response = engine
        .retriever
        .search(&search_request("u1", "Berlin", 5), &engine.config)
        .await
        .unwrap();

    let reranked = response.reranked_results.unwrap();
    let statements = &reranked[&NodeCategory::Statement];
    assert!(!statements.is_empty());
    assert!(statements.len() <= 5);
    // Knowledge nodes carry activation after retrieval touched them
    assert!(statements.iter().all(|s| s.activation_score.is_some()));
    // Items with activation precede those without within each category
    for items in reranked.values() {
        let first_nil = items
            .iter()
            .position(|i| i.activation_score.is_none())
            .unwrap_or(items.len());
        assert!(items[first_nil..].iter().all(|i| i.activation_score.is_none()));
    }
    // Scope isolation: another user sees nothing
    let other = engine
        .retriever
        .search(&search_request("u2", "Berlin", 5), &engine.config)
        .await
        .unwrap();
    assert_eq!(other.combined_summary.total_keyword_results, 0);
}

#[tokio::test]
async fn empty_query_returns_error_summary() {
    let engine = TestEngine::new();
    let response = engine
        .retriever
        .search(&search_request("u1", "   ", 5), &engine.config)
        .await
        .unwrap();

    assert_eq!(response.combined_summary.error.as_deref(), Some("Empty query"));
    let reranked = response.reranked_results.unwrap();
    assert!(!reranked.is_empty());
    assert!(reranked.values().all(|v| v.is_empty()));
}

#[tokio::test]
async fn subset_include_omits_other_categories() {
    let engine = TestEngine::new();
    engine.model.push_reply(extraction_reply(
        "The user moved to Berlin",
        "Berlin",
        "relocation summary",
    ));
    engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I moved to Berlin", "ok")),
            &engine.config,
        )
        .await
        .unwrap();

    let mut request = search_request("u1", "Berlin", 5);
    request.include = vec![NodeCategory::Statement];
    let response = engine.retriever.search(&request, &engine.config).await.unwrap();

    // Omitted categories are present as empty lists; no query ran for them
    let reranked = response.reranked_results.unwrap();
    assert!(!reranked[&NodeCategory::Statement].is_empty());
    assert!(reranked[&NodeCategory::Entity].is_empty());
    assert!(reranked[&NodeCategory::Summary].is_empty());
    let keyword = response.keyword_search.unwrap();
    assert!(!keyword[&NodeCategory::Statement].is_empty());
    assert!(keyword[&NodeCategory::Entity].is_empty());
    assert!(keyword[&NodeCategory::Chunk].is_empty());
}

#[tokio::test]
async fn read_orchestrator_summarizes_retrieved_evidence() {
    let engine = TestEngine::new();
    engine.model.push_reply(extraction_reply(
        "The user moved to Berlin",
        "Berlin",
        "The user relocated to Berlin",
    ));
    engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("I moved to Berlin", "ok")),
            &engine.config,
        )
        .await
        .unwrap();

    // Script: sub-query decomposition, then the final summary
    engine
        .model
        .push_reply(r#"{"sub_queries": ["Where does the user live"]}"#);
    engine.model.push_reply("The user lives in Berlin.");

    let result = engine
        .orchestrator
        .read(
            &ReadRequest {
                end_user_id: "u1".to_string(),
                message: "Where do I live?".to_string(),
                history: vec![],
                search_switch: SearchSwitch::Retrieve,
                config_id: None,
            },
            &engine.config,
        )
        .await
        .unwrap();

    assert_eq!(result.answer, "The user lives in Berlin.");
    assert!(!result.intermediate_outputs.is_empty());

    // The QA pair landed in short-term memory
    let cached = engine.relational.get_short_term_memory("u1").unwrap().unwrap();
    assert_eq!(cached.answer, "The user lives in Berlin.");
}

#[tokio::test]
async fn insufficient_evidence_answer_is_not_cached() {
    let engine = TestEngine::new();
    // No memories ingested: evidence is empty, the sentinel comes back
    engine.model.push_reply(r#"{"sub_queries": ["anything"]}"#);

    let result = engine
        .orchestrator
        .read(
            &ReadRequest {
                end_user_id: "u1".to_string(),
                message: "What is my favourite color?".to_string(),
                history: vec![],
                search_switch: SearchSwitch::Retrieve,
                config_id: None,
            },
            &engine.config,
        )
        .await
        .unwrap();

    assert_eq!(result.answer, INSUFFICIENT_EVIDENCE);
    assert!(engine.relational.get_short_term_memory("u1").unwrap().is_none());
}

#[tokio::test]
async fn context_only_switch_skips_retrieval_and_cache() {
    let engine = TestEngine::new();
    engine.model.push_reply("Just chatting!");

    let result = engine
        .orchestrator
        .read(
            &ReadRequest {
                end_user_id: "u1".to_string(),
                message: "hello there".to_string(),
                history: turn("hi", "hello"),
                search_switch: SearchSwitch::ContextOnly,
                config_id: None,
            },
            &engine.config,
        )
        .await
        .unwrap();

    assert_eq!(result.answer, "Just chatting!");
    assert!(engine.relational.get_short_term_memory("u1").unwrap().is_none());
}

#[tokio::test]
async fn extraction_failure_persists_nothing() {
    let engine = TestEngine::new();
    // Both the first attempt and the stricter retry return garbage
    engine.model.push_reply("not json");
    engine.model.push_reply("still not json");

    let result = engine
        .pipeline
        .ingest(
            &ingest_request("u1", turn("remember this", "ok")),
            &engine.config,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(engine.store.count_nodes("u1").unwrap().total(), 0);
}
