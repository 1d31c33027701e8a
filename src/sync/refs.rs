//! Reference translation between UUIDs and portable refs.
//!
//! Inside the platform, entity payloads point at workflows by UUID. UUIDs
//! differ between environments, so on export each reference is rewritten
//! to `path::function_name` and resolved back to a local UUID on import.
//!
//! The set of reference fields per entity kind is given as a small subset
//! of JSONPath (`$.a`, `[*]`, `..key`), see [`EntityKind::ref_paths`].
//!
//! [`EntityKind::ref_paths`]: crate::model::EntityKind::ref_paths

use std::collections::HashMap;

use serde_json::Value;

use crate::model::Workflow;
use crate::sync::types::{SyncError, SyncResult};

/// Separator between file path and symbol in a portable ref.
pub const PORTABLE_SEPARATOR: &str = "::";

/// Bidirectional UUID ⇄ portable ref table.
///
/// Built fresh for every sync run and passed explicitly to every call that
/// needs it. Entries for workflows that no longer exist are simply absent.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRefMap {
    by_id: HashMap<String, String>,
    by_ref: HashMap<String, String>,
}

impl WorkflowRefMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mapping. The first id registered for a portable ref wins.
    pub fn insert(&mut self, id: &str, portable_ref: &str) {
        if let Some(existing) = self.by_ref.get(portable_ref) {
            if existing != id {
                tracing::warn!(
                    portable_ref,
                    kept = %existing,
                    ignored = id,
                    "Duplicate portable ref; keeping first workflow"
                );
            }
            return;
        }
        self.by_id.insert(id.to_string(), portable_ref.to_string());
        self.by_ref.insert(portable_ref.to_string(), id.to_string());
    }

    /// Portable form of a UUID, if known.
    #[must_use]
    pub fn portable(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    /// Local UUID for a portable ref, if known.
    #[must_use]
    pub fn resolve(&self, portable_ref: &str) -> Option<&str> {
        self.by_ref.get(portable_ref).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate `(id, portable_ref)` pairs sorted by portable ref.
    #[must_use]
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .by_id
            .iter()
            .map(|(id, r)| (id.as_str(), r.as_str()))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(b.1));
        entries
    }
}

/// Build the ref map from the current workflow snapshot.
#[must_use]
pub fn build_ref_map(workflows: &[Workflow]) -> WorkflowRefMap {
    let mut map = WorkflowRefMap::new();
    for workflow in workflows {
        map.insert(&workflow.id, &workflow.portable_ref());
    }
    map
}

/// Replace every known UUID at the given reference paths with its portable
/// ref. Unknown UUIDs are left untouched.
///
/// # Errors
///
/// Returns [`SyncError::MalformedPayload`] if a reference field holds
/// something other than a string or null.
pub fn to_portable(payload: &Value, ref_paths: &[&str], map: &WorkflowRefMap) -> SyncResult<Value> {
    let mut out = payload.clone();
    for expr in ref_paths {
        let segments = parse_path(expr);
        visit_refs(&mut out, &segments, expr, &mut |slot| {
            if let Some(portable) = map.portable(slot) {
                *slot = portable.to_string();
            }
        })?;
    }
    Ok(out)
}

/// Resolve every portable ref at the given reference paths to a local UUID.
///
/// Refs with no local target stay in the payload verbatim and are returned
/// in the second element, in the order they were found.
///
/// # Errors
///
/// Returns [`SyncError::MalformedPayload`] if a reference field holds
/// something other than a string or null.
pub fn to_internal(
    payload: &Value,
    ref_paths: &[&str],
    map: &WorkflowRefMap,
) -> SyncResult<(Value, Vec<String>)> {
    let mut out = payload.clone();
    let mut unresolved = Vec::new();
    for expr in ref_paths {
        let segments = parse_path(expr);
        visit_refs(&mut out, &segments, expr, &mut |slot| {
            if !slot.contains(PORTABLE_SEPARATOR) {
                return;
            }
            match map.resolve(slot) {
                Some(id) => *slot = id.to_string(),
                None => {
                    tracing::warn!(portable_ref = %slot, "Unresolved reference left as-is");
                    unresolved.push(slot.clone());
                }
            }
        })?;
    }
    Ok((out, unresolved))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Wildcard,
    Descendant(String),
}

/// Parse `$.a.b[*]..c` into segments. Unrecognized characters end the key
/// they appear in.
fn parse_path(expr: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = expr.strip_prefix('$').unwrap_or(expr);

    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("[*]") {
            segments.push(Segment::Wildcard);
            rest = r;
        } else if let Some(r) = rest.strip_prefix("..") {
            let (key, r) = take_key(r);
            segments.push(Segment::Descendant(key));
            rest = r;
        } else if let Some(r) = rest.strip_prefix('.') {
            let (key, r) = take_key(r);
            if key == "*" {
                segments.push(Segment::Wildcard);
            } else {
                segments.push(Segment::Child(key));
            }
            rest = r;
        } else {
            // Skip anything we don't understand
            rest = &rest[rest.chars().next().map_or(1, char::len_utf8)..];
        }
    }
    segments
}

fn take_key(s: &str) -> (String, &str) {
    let end = s.find(['.', '[']).unwrap_or(s.len());
    (s[..end].to_string(), &s[end..])
}

/// Apply `f` to every string matched by `segments`.
fn visit_refs(
    value: &mut Value,
    segments: &[Segment],
    expr: &str,
    f: &mut dyn FnMut(&mut String),
) -> SyncResult<()> {
    let Some((head, tail)) = segments.split_first() else {
        return match value {
            Value::String(s) => {
                f(s);
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(SyncError::MalformedPayload {
                field: expr.to_string(),
                found: json_type(other).to_string(),
            }),
        };
    };

    match head {
        Segment::Child(key) => {
            if let Some(child) = value.as_object_mut().and_then(|o| o.get_mut(key)) {
                visit_refs(child, tail, expr, f)?;
            }
        }
        Segment::Wildcard => match value {
            Value::Array(items) => {
                for item in items {
                    visit_refs(item, tail, expr, f)?;
                }
            }
            Value::Object(map) => {
                for item in map.values_mut() {
                    visit_refs(item, tail, expr, f)?;
                }
            }
            _ => {}
        },
        Segment::Descendant(key) => match value {
            Value::Object(map) => {
                for (k, child) in map.iter_mut() {
                    if k == key {
                        visit_refs(child, tail, expr, f)?;
                    } else {
                        visit_refs(child, segments, expr, f)?;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    visit_refs(item, segments, expr, f)?;
                }
            }
            _ => {}
        },
    }
    Ok(())
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use serde_json::json;

    const BILLING: &str = "6b1c0a52-8f0e-4f6e-9d57-3f3b8a1d2c10";
    const NOTIFY: &str = "0f9e8d7c-6b5a-4e3d-8c2b-1a0f9e8d7c6b";

    fn sample_map() -> WorkflowRefMap {
        let mut map = WorkflowRefMap::new();
        map.insert(BILLING, "workflows/billing.py::charge");
        map.insert(NOTIFY, "workflows/notify.py::send_email");
        map
    }

    fn sample_app() -> Value {
        json!({
            "pages": [
                {
                    "title": "Home",
                    "launch_workflow_id": NOTIFY,
                    "components": [
                        {"type": "button", "workflow_id": BILLING},
                        {"type": "table", "rowActions": [{"workflow_id": NOTIFY}]},
                        {"type": "text", "workflow_id": null}
                    ]
                }
            ],
            "theme": {"workflow_id": BILLING}
        })
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("$.pages[*]..workflow_id"),
            vec![
                Segment::Child("pages".into()),
                Segment::Wildcard,
                Segment::Descendant("workflow_id".into()),
            ]
        );
        assert_eq!(
            parse_path("$.fields[*].data_provider_id"),
            vec![
                Segment::Child("fields".into()),
                Segment::Wildcard,
                Segment::Child("data_provider_id".into()),
            ]
        );
    }

    #[test]
    fn test_to_portable_rewrites_known_ids_only_under_ref_paths() {
        let out = to_portable(&sample_app(), EntityKind::Application.ref_paths(), &sample_map())
            .unwrap();

        let page = &out["pages"][0];
        assert_eq!(page["launch_workflow_id"], "workflows/notify.py::send_email");
        assert_eq!(page["components"][0]["workflow_id"], "workflows/billing.py::charge");
        assert_eq!(
            page["components"][1]["rowActions"][0]["workflow_id"],
            "workflows/notify.py::send_email"
        );
        assert_eq!(page["components"][2]["workflow_id"], Value::Null);
        // Outside $.pages, so not a reference field
        assert_eq!(out["theme"]["workflow_id"], BILLING);
    }

    #[test]
    fn test_round_trip_restores_payload() {
        let payload = sample_app();
        let paths = EntityKind::Application.ref_paths();
        let map = sample_map();

        let portable = to_portable(&payload, paths, &map).unwrap();
        let (internal, unresolved) = to_internal(&portable, paths, &map).unwrap();

        assert_eq!(internal, payload);
        assert!(unresolved.is_empty());
    }

    #[test]
    fn test_unknown_ids_fail_open_and_unknown_refs_degrade() {
        let payload = json!({"tool_ids": [BILLING, "11111111-2222-4333-8444-555555555555"]});
        let paths = EntityKind::Agent.ref_paths();

        let portable = to_portable(&payload, paths, &sample_map()).unwrap();
        assert_eq!(portable["tool_ids"][0], "workflows/billing.py::charge");
        assert_eq!(portable["tool_ids"][1], "11111111-2222-4333-8444-555555555555");

        // Importing into an environment that knows none of these workflows
        let mut other = WorkflowRefMap::new();
        other.insert("99999999-0000-4000-8000-000000000000", "workflows/other.py::run");
        let (internal, unresolved) = to_internal(&portable, paths, &other).unwrap();

        assert_eq!(unresolved, vec!["workflows/billing.py::charge"]);
        assert_eq!(internal["tool_ids"][0], "workflows/billing.py::charge");
        // A bare UUID is not a portable ref and is not reported
        assert_eq!(internal["tool_ids"][1], "11111111-2222-4333-8444-555555555555");
    }

    #[test]
    fn test_wrong_type_at_ref_field_is_malformed() {
        let payload = json!({"workflow_id": 42});
        let err = to_portable(&payload, EntityKind::Form.ref_paths(), &sample_map()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::MalformedPayload { ref found, .. } if found == "number"
        ));
    }

    #[test]
    fn test_form_fields_and_missing_keys() {
        let payload = json!({
            "workflow_id": BILLING,
            "fields": [{"name": "a", "data_provider_id": NOTIFY}, {"name": "b"}]
        });
        let out = to_portable(&payload, EntityKind::Form.ref_paths(), &sample_map()).unwrap();
        assert_eq!(out["workflow_id"], "workflows/billing.py::charge");
        assert_eq!(out["fields"][0]["data_provider_id"], "workflows/notify.py::send_email");
        assert!(out["fields"][1].get("data_provider_id").is_none());
    }

    #[test]
    fn test_duplicate_portable_ref_keeps_first() {
        let mut map = WorkflowRefMap::new();
        map.insert("a", "w.py::f");
        map.insert("b", "w.py::f");
        assert_eq!(map.resolve("w.py::f"), Some("a"));
        assert_eq!(map.portable("b"), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_build_ref_map() {
        let workflows = vec![Workflow {
            id: BILLING.into(),
            path: "workflows/billing.py".into(),
            function_name: "charge".into(),
            created_at: 0,
        }];
        let map = build_ref_map(&workflows);
        assert_eq!(map.portable(BILLING), Some("workflows/billing.py::charge"));
        assert_eq!(map.resolve("workflows/billing.py::charge"), Some(BILLING));
    }
}
