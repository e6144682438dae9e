//! Scenario: worker settings come from layered config with stable hashing.
//!
//! GREEN when:
//! - A local overlay overrides base worker options without disturbing the rest.
//! - The canonical hash ignores key order but not values.
//! - Settings parse out of the merged document with documented defaults for
//!   anything a layer does not mention.

use std::time::Duration;

use lxp_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
worker:
  concurrency: 4
  retry_delay_secs: 30
  stale_running_secs: 1800
  max_attempts: 5
  frozen_job_types:
    - chat_respond
    - refine_taxonomy
database:
  max_connections: 10
"#;

const OVERLAY_YAML: &str = r#"
worker:
  concurrency: 12
  retry_delay_secs: 5
"#;

#[test]
fn overlay_overrides_worker_options_only() {
    std::env::remove_var(lxp_config::ENV_WORKER_CONCURRENCY);
    let cfg = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let s = cfg.worker_settings();

    assert_eq!(s.concurrency, 12, "overlay must win for concurrency");
    assert_eq!(s.retry_delay, Duration::from_secs(5));
    assert_eq!(
        s.stale_running,
        Duration::from_secs(1800),
        "untouched base value must survive the merge"
    );
    assert_eq!(s.max_attempts, 5);
    assert_eq!(
        s.frozen_job_types,
        vec!["chat_respond".to_string(), "refine_taxonomy".to_string()]
    );

    // Non-worker sections are untouched by worker settings extraction.
    assert_eq!(
        cfg.config_json
            .pointer("/database/max_connections")
            .and_then(|v| v.as_i64()),
        Some(10)
    );
}

#[test]
fn hash_stable_across_key_reordering() {
    let reordered = r#"
database:
  max_connections: 10
worker:
  frozen_job_types:
    - chat_respond
    - refine_taxonomy
  max_attempts: 5
  stale_running_secs: 1800
  retry_delay_secs: 30
  concurrency: 4
"#;
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[reordered]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn hash_differs_when_values_differ() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(a.config_hash, b.config_hash);
}

#[test]
fn empty_layers_yield_pure_defaults() {
    std::env::remove_var(lxp_config::ENV_WORKER_CONCURRENCY);
    let cfg = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let s = cfg.worker_settings();
    assert_eq!(s.concurrency, 4);
    assert_eq!(s.max_attempts, 5);
    assert!(s.frozen_job_types.is_empty());
    assert!(s.heartbeat_bound_ok());
}
