//! Test Harness
//!
//! One temp SQLite database per test, with the full engine stack wired over
//! the scripted mock provider.

use std::sync::Arc;

use tempfile::TempDir;

use mnemo_core::{
    GraphStore, HybridRetriever, IngestionPipeline, MemoryConfig, ReadOrchestrator,
    RelationalStore,
};

use crate::mocks::MockModel;

/// Fully wired engine over temp storage
pub struct TestEngine {
    /// Keeps the temp directory alive for the test's duration
    _dir: TempDir,
    pub store: Arc<GraphStore>,
    pub relational: Arc<RelationalStore>,
    pub model: Arc<MockModel>,
    pub pipeline: IngestionPipeline,
    pub retriever: Arc<HybridRetriever>,
    pub orchestrator: ReadOrchestrator,
    pub config: MemoryConfig,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("mnemo.db");

        let store = Arc::new(GraphStore::new(Some(db_path.clone())).expect("graph store"));
        let relational = Arc::new(RelationalStore::new(Some(db_path)).expect("relational store"));
        let model = Arc::new(MockModel::new());

        let pipeline = IngestionPipeline::new(store.clone(), model.clone());
        let retriever = Arc::new(HybridRetriever::new(store.clone(), model.clone()));
        let orchestrator =
            ReadOrchestrator::new(retriever.clone(), model.clone(), relational.clone());

        Self {
            _dir: dir,
            store,
            relational,
            model,
            pipeline,
            retriever,
            orchestrator,
            config: MemoryConfig::default(),
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
