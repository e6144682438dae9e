//! Layered configuration for the job-execution substrate.
//!
//! YAML files are deep-merged in order (later files win), canonicalized to
//! JSON with sorted keys, and hashed so a process can report exactly which
//! configuration it booted with. Typed accessors live in
//! [`WorkerSettings`]; everything else is read through JSON pointers.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;

pub mod settings;

pub use settings::WorkerSettings;

/// Env var naming the worker pool size. Overrides the config file.
pub const ENV_WORKER_CONCURRENCY: &str = "WORKER_CONCURRENCY";

/// Read YAML files and fold them into one document, earliest first, so
/// a later layer wins wherever both define a key. The folded document is
/// canonicalized and hashed.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for p in paths {
        let raw = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let layer = parse_yaml_layer(&raw).with_context(|| format!("parse yaml: {p}"))?;
        merged = merge_layer(merged, layer);
    }
    Ok(finish(merged))
}

/// Merge already-read YAML documents in order. Test-friendly variant of
/// [`load_layered_yaml`].
pub fn load_layered_yaml_from_strings(layers: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for (i, raw) in layers.iter().enumerate() {
        let layer = parse_yaml_layer(raw).with_context(|| format!("parse yaml layer {i}"))?;
        merged = merge_layer(merged, layer);
    }
    Ok(finish(merged))
}

/// Same as [`load_layered_yaml`] but silently skips paths that do not exist.
/// Used by the daemon so an env-only deployment can boot without any file.
pub fn load_layered_yaml_existing(paths: &[&str]) -> Result<LoadedConfig> {
    let present: Vec<&str> = paths
        .iter()
        .copied()
        .filter(|p| std::path::Path::new(p).exists())
        .collect();
    load_layered_yaml(&present)
}

fn parse_yaml_layer(raw: &str) -> Result<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(raw)?;
    serde_json::to_value(yaml).context("yaml->json conversion failed")
}

fn finish(merged: Value) -> LoadedConfig {
    let mut canonical = String::new();
    write_canonical(&merged, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    LoadedConfig {
        config_json: merged,
        canonical_json: canonical,
        config_hash,
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Typed worker settings with env overrides applied.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::from_config(&self.config_json)
    }
}

// ---------------------------------------------------------------------------
// Pointer accessors
// ---------------------------------------------------------------------------

pub fn cfg_bool(v: &Value, ptr: &str, default: bool) -> bool {
    v.pointer(ptr).and_then(|x| x.as_bool()).unwrap_or(default)
}

pub fn cfg_i64(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(|x| x.as_i64())
}

pub fn cfg_str<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

pub fn cfg_duration_secs(v: &Value, ptr: &str, default: Duration) -> Duration {
    cfg_i64(v, ptr)
        .filter(|n| *n > 0)
        .map(|n| Duration::from_secs(n as u64))
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Merge + canonicalization
// ---------------------------------------------------------------------------

/// Fold one overlay into the accumulated document, consuming both.
/// Objects merge key-wise (recursing where both sides carry the key);
/// arrays and scalars are replaced wholesale by the overlay.
fn merge_layer(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => merge_layer(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Append the canonical rendering of `v` to `out`: compact separators,
/// object keys emitted in sorted order at every depth. This is the byte
/// stream that gets hashed, so it must not depend on map insertion order.
fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key escaping is serde_json's; only the ordering is ours.
                out.push_str(&serde_json::to_string(key).expect("string key serializes"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).expect("json scalar serializes"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_scalars_and_merges_objects() {
        let base = json!({"worker": {"max_attempts": 5, "retry_delay_secs": 30}});
        let merged = merge_layer(base, json!({"worker": {"max_attempts": 3}, "extra": true}));
        assert_eq!(merged["worker"]["max_attempts"], 3);
        assert_eq!(merged["worker"]["retry_delay_secs"], 30);
        assert_eq!(merged["extra"], true);
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let base = json!({"worker": {"frozen_job_types": ["a", "b"]}});
        let merged = merge_layer(base, json!({"worker": {"frozen_job_types": ["c"]}}));
        assert_eq!(merged["worker"]["frozen_job_types"], json!(["c"]));
    }

    #[test]
    fn canonical_hash_is_key_order_independent() {
        let a = finish(json!({"b": 1, "a": {"y": 2, "x": 3}}));
        let b = finish(json!({"a": {"x": 3, "y": 2}, "b": 1}));
        assert_eq!(a.config_hash, b.config_hash);
        assert_eq!(a.canonical_json, b.canonical_json);
        assert_eq!(a.canonical_json, r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn canonical_form_escapes_strings_and_keeps_array_order() {
        let cfg = finish(json!({"note": "a \"quoted\" value", "seq": [3, 1, 2]}));
        assert_eq!(
            cfg.canonical_json,
            r#"{"note":"a \"quoted\" value","seq":[3,1,2]}"#
        );
    }

    #[test]
    fn missing_files_are_skipped_by_existing_loader() {
        let cfg = load_layered_yaml_existing(&["/definitely/not/here.yaml"]).unwrap();
        assert_eq!(cfg.config_json, json!({}));
        assert_eq!(cfg.canonical_json, "{}");
    }

    #[test]
    fn duration_pointer_ignores_non_positive() {
        let v = json!({"worker": {"retry_delay_secs": 0}});
        assert_eq!(
            cfg_duration_secs(&v, "/worker/retry_delay_secs", Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
