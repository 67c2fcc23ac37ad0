//! Values available to bindable operation fields at compile time.

use super::operation::BindingKind;
use serde_json::Value;
use std::collections::HashMap;

/// Message, flow, global and environment scopes a binding can read from.
#[derive(Debug, Clone, Default)]
pub struct BindingContext {
    message: Value,
    flow: HashMap<String, Value>,
    global: HashMap<String, Value>,
    /// Consulted before the process environment
    env: HashMap<String, String>,
}

impl BindingContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a run triggered by `message`.
    pub fn with_message(message: Value) -> Self {
        Self {
            message,
            ..Default::default()
        }
    }

    /// Set a flow-scoped value.
    pub fn set_flow(&mut self, key: impl Into<String>, value: Value) {
        self.flow.insert(key.into(), value);
    }

    /// Set a global value.
    pub fn set_global(&mut self, key: impl Into<String>, value: Value) {
        self.global.insert(key.into(), value);
    }

    /// Set an environment value, shadowing the process environment.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Message that triggered the run.
    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Resolve a bindable field. `None` when the reference cannot be followed.
    pub fn resolve(&self, kind: BindingKind, raw: Option<&Value>) -> Option<Value> {
        let raw = raw?;
        match kind {
            BindingKind::Literal => Some(raw.clone()),
            BindingKind::Msg => {
                let path = raw.as_str()?;
                lookup_path(&self.message, path.strip_prefix("msg.").unwrap_or(path)).cloned()
            }
            BindingKind::Flow => self.flow.get(raw.as_str()?).cloned(),
            BindingKind::Global => self.global.get(raw.as_str()?).cloned(),
            BindingKind::Env => {
                let name = raw.as_str()?;
                self.env
                    .get(name)
                    .cloned()
                    .or_else(|| std::env::var(name).ok())
                    .map(Value::String)
            }
            BindingKind::Unsupported => None,
        }
    }

    /// Resolve to non-empty text. Numbers and booleans are formatted.
    pub fn resolve_text(&self, kind: BindingKind, raw: Option<&Value>) -> Option<String> {
        match self.resolve(kind, raw)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Resolve to a number, parsing text if needed.
    pub fn resolve_number(&self, kind: BindingKind, raw: Option<&Value>) -> Option<f64> {
        match self.resolve(kind, raw)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_paths() {
        let ctx = BindingContext::with_message(json!({
            "payload": { "unit": "DMM1", "points": [ { "volts": 10 } ] }
        }));
        let unit = Value::from("payload.unit");
        assert_eq!(
            ctx.resolve_text(BindingKind::Msg, Some(&unit)).as_deref(),
            Some("DMM1")
        );
        let prefixed = Value::from("msg.payload.points.0.volts");
        assert_eq!(ctx.resolve_number(BindingKind::Msg, Some(&prefixed)), Some(10.0));
        let missing = Value::from("payload.nothing");
        assert_eq!(ctx.resolve(BindingKind::Msg, Some(&missing)), None);
    }

    #[test]
    fn test_flow_global_and_env() {
        let mut ctx = BindingContext::new();
        ctx.set_flow("unit", json!("SRC1"));
        ctx.set_global("settle", json!(250));
        ctx.set_env("CALSEQ_TEST_UNIT", "DMM2");

        let key = Value::from("unit");
        assert_eq!(ctx.resolve_text(BindingKind::Flow, Some(&key)).as_deref(), Some("SRC1"));
        let settle = Value::from("settle");
        assert_eq!(ctx.resolve_number(BindingKind::Global, Some(&settle)), Some(250.0));
        let env = Value::from("CALSEQ_TEST_UNIT");
        assert_eq!(ctx.resolve_text(BindingKind::Env, Some(&env)).as_deref(), Some("DMM2"));
    }

    #[test]
    fn test_literals_and_blank_text() {
        let ctx = BindingContext::new();
        assert_eq!(
            ctx.resolve_text(BindingKind::Literal, Some(&json!(22))).as_deref(),
            Some("22")
        );
        assert_eq!(ctx.resolve_text(BindingKind::Literal, Some(&json!("  "))), None);
        assert_eq!(ctx.resolve_number(BindingKind::Literal, Some(&json!("1.5"))), Some(1.5));
        assert_eq!(ctx.resolve(BindingKind::Unsupported, Some(&json!("x"))), None);
        assert_eq!(ctx.resolve(BindingKind::Literal, None), None);
    }
}
