//! Dynamic, schema-less context values and dotted-path access.
//!
//! Contexts in the declarative document are free-form maps (§3). Representing
//! them as a sum type rather than `serde_json::Value` directly keeps
//! `Ord`/`Eq` available on the pieces the engine actually compares, and uses
//! a `BTreeMap` so two contexts with identical content always serialize
//! identically — relevant to the replay-determinism property (§8).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single context/event value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    /// Build an empty map context.
    pub fn empty_map() -> Self {
        ContextValue::Map(BTreeMap::new())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ContextValue>> {
        match self {
            ContextValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, ContextValue>> {
        match self {
            ContextValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Int(i) => Some(*i as f64),
            ContextValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Resolve a dotted path (`"a.b.c"`) against this value. Returns `None`
    /// ("unset") if any intermediate segment is missing or not a map.
    pub fn get_path(&self, path: &str) -> Option<&ContextValue> {
        let mut current = self;
        for segment in path.split('.') {
            if segment.is_empty() {
                continue;
            }
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate maps as needed. Used by
    /// triggered hooks mutating instance context (e.g. accumulating a
    /// quantity in Scenario A).
    pub fn set_path(&mut self, path: &str, value: ContextValue) {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return;
        }
        let mut current = self;
        for segment in &segments[..segments.len() - 1] {
            if current.as_map().is_none() {
                *current = ContextValue::empty_map();
            }
            let map = current.as_map_mut().expect("just normalized to map");
            current = map
                .entry((*segment).to_string())
                .or_insert_with(ContextValue::empty_map);
        }
        if current.as_map().is_none() {
            *current = ContextValue::empty_map();
        }
        let map = current.as_map_mut().expect("just normalized to map");
        map.insert(segments[segments.len() - 1].to_string(), value);
    }

    /// Expand `{{path}}` placeholders inside a template string, resolving
    /// paths against this value. Unresolved placeholders expand to an empty
    /// string, matching the "unset" semantics used elsewhere.
    pub fn expand_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            if let Some(end) = after.find("}}") {
                let path = after[..end].trim();
                let replacement = self
                    .get_path(path)
                    .map(ContextValue::to_display_string)
                    .unwrap_or_default();
                out.push_str(&replacement);
                rest = &after[end + 2..];
            } else {
                out.push_str("{{");
                rest = after;
                break;
            }
        }
        out.push_str(rest);
        out
    }

    fn to_display_string(&self) -> String {
        match self {
            ContextValue::Null => String::new(),
            ContextValue::Bool(b) => b.to_string(),
            ContextValue::Int(i) => i.to_string(),
            ContextValue::Float(f) => f.to_string(),
            ContextValue::String(s) => s.clone(),
            ContextValue::List(_) | ContextValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        ContextValue::Int(i)
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => ContextValue::Null,
            serde_json::Value::Bool(b) => ContextValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ContextValue::Int(i)
                } else {
                    ContextValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => ContextValue::String(s),
            serde_json::Value::Array(a) => {
                ContextValue::List(a.into_iter().map(ContextValue::from).collect())
            }
            serde_json::Value::Object(o) => ContextValue::Map(
                o.into_iter()
                    .map(|(k, v)| (k, ContextValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, ContextValue)]) -> ContextValue {
        ContextValue::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn get_path_resolves_nested() {
        let ctx = map(&[("order", map(&[("id", "O1".into())]))]);
        assert_eq!(ctx.get_path("order.id"), Some(&ContextValue::from("O1")));
    }

    #[test]
    fn get_path_missing_is_none() {
        let ctx = map(&[("order", map(&[("id", "O1".into())]))]);
        assert_eq!(ctx.get_path("order.missing"), None);
        assert_eq!(ctx.get_path("missing.id"), None);
    }

    #[test]
    fn set_path_creates_intermediate_maps() {
        let mut ctx = ContextValue::empty_map();
        ctx.set_path("order.id", "O1".into());
        assert_eq!(ctx.get_path("order.id"), Some(&ContextValue::from("O1")));
    }

    #[test]
    fn template_expansion_substitutes_and_tolerates_missing() {
        let ctx = map(&[("orderId", "O1".into()), ("amount", ContextValue::Int(100))]);
        assert_eq!(
            ctx.expand_template("order={{orderId}} amount={{amount}} x={{missing}}"),
            "order=O1 amount=100 x="
        );
    }
}
