//! Berth apply: spec/state differencing, content hashing and chart value merging.

#![forbid(unsafe_code)]

use berth_core::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

/// Fields the remote system assigns or never echoes back; ignored by every diff.
pub const REMOTE_MANAGED: &[&str] = &["id", "creation_time", "update_time", "access_secret"];

fn max_values_bytes() -> usize {
    std::env::var("BERTH_MAX_VALUES_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_values_nodes() -> usize {
    std::env::var("BERTH_MAX_VALUES_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Count structural differences of `target` relative to `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Dotted paths of top-level-and-nested fields that differ, for logs and status messages.
pub fn changed_paths(target: &Json, base: &Json) -> Vec<String> {
    fn walk(prefix: &str, a: &Json, b: &Json, out: &mut Vec<String>) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                let keys: std::collections::BTreeSet<&String> = ao.keys().chain(bo.keys()).collect();
                for k in keys {
                    let path = if prefix.is_empty() { k.clone() } else { format!("{}.{}", prefix, k) };
                    match (ao.get(k), bo.get(k)) {
                        (Some(av), Some(bv)) if av == bv => {}
                        (Some(av), Some(bv)) => walk(&path, av, bv, out),
                        _ => out.push(path),
                    }
                }
            }
            (av, bv) => { if av != bv { out.push(prefix.to_string()); } }
        }
    }
    let mut out = Vec::new();
    walk("", target, base, &mut out);
    out
}

/// Drop remote-managed fields at any depth.
pub fn strip_remote_managed(mut v: Json) -> Json {
    fn walk(v: &mut Json) {
        match v {
            Json::Object(map) => {
                for k in REMOTE_MANAGED { map.remove(*k); }
                for (_k, vv) in map.iter_mut() { walk(vv); }
            }
            Json::Array(arr) => { for vv in arr.iter_mut() { walk(vv); } }
            _ => {}
        }
    }
    walk(&mut v);
    v
}

/// Structural diff of two remote representations, ignoring remote-managed fields.
pub fn diff_remote<T: Serialize>(want: &T, held: &T) -> DiffSummary {
    let want = strip_remote_managed(serde_json::to_value(want).unwrap_or(Json::Null));
    let held = strip_remote_managed(serde_json::to_value(held).unwrap_or(Json::Null));
    diff_summary(&want, &held)
}

/// Paths that differ between two remote representations.
pub fn drifted_fields<T: Serialize>(want: &T, held: &T) -> Vec<String> {
    let want = strip_remote_managed(serde_json::to_value(want).unwrap_or(Json::Null));
    let held = strip_remote_managed(serde_json::to_value(held).unwrap_or(Json::Null));
    changed_paths(&want, &held)
}

/// Rebuild `v` with object keys inserted in sorted order at every depth.
fn canonical(v: Json) -> Json {
    match v {
        Json::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Json> = map.into_iter().collect();
            Json::Object(sorted.into_iter().map(|(k, v)| (k, canonical(v))).collect())
        }
        Json::Array(arr) => Json::Array(arr.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Content hash of a resolved configuration. Key order never affects the result.
pub fn spec_hash<T: Serialize>(resolved: &T) -> EngineResult<String> {
    let value = serde_json::to_value(resolved)
        .map_err(|e| EngineError::Internal(format!("serializing resolved spec: {}", e)))?;
    let bytes = serde_json::to_vec(&canonical(value))
        .map_err(|e| EngineError::Internal(format!("serializing resolved spec: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Deep-merge `overlay` into `base`. Objects merge key-wise, everything else is replaced.
pub fn merge_values(base: &mut Json, overlay: Json) {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, ov) in o {
                match b.get_mut(&k) {
                    Some(bv) => merge_values(bv, ov),
                    None => { b.insert(k, ov); }
                }
            }
        }
        (b, o) => *b = o,
    }
}

/// Parse a chart values document (YAML or JSON) with size guards.
pub fn parse_values(doc: &str) -> EngineResult<Json> {
    if doc.len() > max_values_bytes() {
        return Err(EngineError::Validation(format!("values document too large (>{} bytes)", max_values_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(doc)
        .map_err(|e| EngineError::Validation(format!("parsing values YAML: {}", e)))?;
    let json = serde_json::to_value(val)
        .map_err(|e| EngineError::Validation(format!("converting values YAML to JSON: {}", e)))?;
    if json_node_budget_exceeded(&json, max_values_nodes()) {
        return Err(EngineError::Validation(format!("values document too complex (>{} nodes)", max_values_nodes())));
    }
    match json {
        Json::Null => Ok(Json::Object(Default::default())),
        Json::Object(_) => Ok(json),
        _ => Err(EngineError::Validation("values document must be a mapping".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({
            "a": 1,
            "b": { "x": 1 },
            "c": [1, 2, 3]
        });
        let target = serde_json::json!({
            "a": 2,                // scalar update
            "b": { "x": 1, "y": 2 }, // object add
            "c": [1, 9],           // array element update + removals
            "d": true              // key add
        });
        let s = diff_summary(&target, &base);
        assert_eq!(s.adds, 2);
        assert_eq!(s.updates, 2);
        assert_eq!(s.removes, 1);
    }

    #[test]
    fn remote_managed_fields_never_count() {
        #[derive(Serialize)]
        struct R { id: i64, name: &'static str, insecure: bool, credential: C }
        #[derive(Serialize)]
        struct C { access_key: &'static str, access_secret: &'static str }
        let want = R { id: 0, name: "r1", insecure: false, credential: C { access_key: "k", access_secret: "s" } };
        let held = R { id: 42, name: "r1", insecure: false, credential: C { access_key: "k", access_secret: "" } };
        assert!(diff_remote(&want, &held).is_empty());
        let held = R { id: 42, name: "r1", insecure: true, credential: C { access_key: "k", access_secret: "" } };
        assert_eq!(drifted_fields(&want, &held), vec!["insecure".to_string()]);
    }

    #[test]
    fn spec_hash_is_stable_and_sensitive() {
        let a = serde_json::json!({"chart": "harbor", "values": {"b": 1, "a": {"x": true}}});
        let b = serde_json::json!({"values": {"a": {"x": true}, "b": 1}, "chart": "harbor"});
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&a).unwrap());
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
        let c = serde_json::json!({"chart": "harbor", "values": {"b": 2, "a": {"x": true}}});
        assert_ne!(spec_hash(&a).unwrap(), spec_hash(&c).unwrap());
        assert_eq!(spec_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn merge_is_deep_for_objects_and_replaces_scalars() {
        let mut base = serde_json::json!({"expose": {"type": "ingress", "tls": {"enabled": true}}, "list": [1]});
        merge_values(&mut base, serde_json::json!({"expose": {"tls": {"enabled": false}}, "list": [2, 3], "new": 1}));
        assert_eq!(base, serde_json::json!({"expose": {"type": "ingress", "tls": {"enabled": false}}, "list": [2, 3], "new": 1}));
    }

    #[test]
    fn values_must_be_a_mapping() {
        assert!(parse_values("a: 1\nb: {c: 2}\n").is_ok());
        assert_eq!(parse_values("").unwrap(), serde_json::json!({}));
        let e = parse_values("- 1\n- 2\n").unwrap_err();
        assert!(matches!(e, EngineError::Validation(_)));
    }
}
