//! The shipped example configuration must stay loadable.

use std::fs;

use hybrid_rag::config::{load, ContextOrder, StreamPolicy};
use hybrid_rag::PipelineConfig;
use tempfile::TempDir;

const DEMO_CONFIG: &str = include_str!("../demos/config.yaml");

#[test]
fn test_demo_config_parses() {
    let config = PipelineConfig::from_yaml(DEMO_CONFIG).unwrap();

    assert_eq!(config.retrieval.vector_top_k, 24);
    assert_eq!(config.context.order, ContextOrder::FactsFirst);
    assert_eq!(
        config.safety.stream_policy,
        StreamPolicy::ClassifyPrefix { prefix_chars: 120 }
    );
    assert!(config.escalation.webhook_url.is_none());
}

#[test]
fn test_audit_log_resolves_against_project_root() {
    let temp = TempDir::new().unwrap();
    let config_dir = temp.path().join(".hybrid-rag");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("config.yaml");
    fs::write(&config_path, DEMO_CONFIG).unwrap();

    let loaded = load(Some(&config_path)).unwrap();

    assert_eq!(loaded.source.as_deref(), Some(config_path.as_path()));
    assert_eq!(
        loaded.config.escalation.audit_log,
        Some(temp.path().join("logs/escalations.jsonl"))
    );
}
