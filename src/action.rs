//! Turns loosely-typed `computer_call` actions into validated commands.
//!
//! Each kind has a fixed, ordered list of field lookups. Only `wait` and
//! `screenshot` tolerate missing parameters; everything else fails loudly
//! rather than guessing coordinates or text.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::AgentError;
use crate::cua::{ActionKind, ActionRequest};

pub const DEFAULT_WAIT_MS: u64 = 1000;

// Lookup order for the wait duration: direct ms, nested params.ms, direct time, nested params.time.
const WAIT_FIELDS: [&str; 4] = ["/ms", "/params/ms", "/time", "/params/time"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedAction {
    Click { x: i64, y: i64, button: String },
    DoubleClick { x: i64, y: i64 },
    Type { text: String },
    Keypress { keys: Vec<String> },
    Scroll { x: i64, y: i64, scroll_x: i64, scroll_y: i64 },
    Drag { path: Vec<Point> },
    Move { x: i64, y: i64 },
    Wait { ms: u64 },
    Screenshot,
}

impl NormalizedAction {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedAction::Click { .. } => "click",
            NormalizedAction::DoubleClick { .. } => "double_click",
            NormalizedAction::Type { .. } => "type",
            NormalizedAction::Keypress { .. } => "keypress",
            NormalizedAction::Scroll { .. } => "scroll",
            NormalizedAction::Drag { .. } => "drag",
            NormalizedAction::Move { .. } => "move",
            NormalizedAction::Wait { .. } => "wait",
            NormalizedAction::Screenshot => "screenshot",
        }
    }

    /// Typed fields as a JSON object, without the `type` tag.
    pub fn parameters(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("type");
                Value::Object(map)
            }
            _ => json!({}),
        }
    }
}

pub fn normalize(request: &ActionRequest) -> Result<NormalizedAction, AgentError> {
    let raw = &request.raw;
    let kind = request.kind.as_str();
    let action = match &request.kind {
        ActionKind::Click => NormalizedAction::Click {
            x: int(raw, kind, "x")?,
            y: int(raw, kind, "y")?,
            button: raw
                .get("button")
                .and_then(Value::as_str)
                .unwrap_or("left")
                .to_string(),
        },
        ActionKind::DoubleClick => NormalizedAction::DoubleClick {
            x: int(raw, kind, "x")?,
            y: int(raw, kind, "y")?,
        },
        ActionKind::Type => NormalizedAction::Type {
            text: raw
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| missing(kind, "text"))?
                .to_string(),
        },
        ActionKind::Keypress => NormalizedAction::Keypress { keys: keys(raw, kind)? },
        ActionKind::Scroll => NormalizedAction::Scroll {
            x: int(raw, kind, "x")?,
            y: int(raw, kind, "y")?,
            scroll_x: int(raw, kind, "scroll_x")?,
            scroll_y: int(raw, kind, "scroll_y")?,
        },
        ActionKind::Drag => NormalizedAction::Drag { path: path(raw, kind)? },
        ActionKind::Move => NormalizedAction::Move {
            x: int(raw, kind, "x")?,
            y: int(raw, kind, "y")?,
        },
        ActionKind::Wait => NormalizedAction::Wait {
            ms: WAIT_FIELDS
                .iter()
                .find_map(|ptr| raw.pointer(ptr).and_then(as_int))
                .map(|ms| ms.max(0) as u64)
                .unwrap_or(DEFAULT_WAIT_MS),
        },
        ActionKind::Screenshot => NormalizedAction::Screenshot,
        ActionKind::Unknown(name) => {
            return Err(AgentError::Normalization(format!("Unknown action type: {name}")));
        }
    };
    Ok(action)
}

fn missing(kind: &str, field: &str) -> AgentError {
    AgentError::Normalization(format!("Could not extract {field} for {kind} action"))
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

fn int(raw: &Value, kind: &str, field: &str) -> Result<i64, AgentError> {
    raw.get(field).and_then(as_int).ok_or_else(|| missing(kind, field))
}

fn keys(raw: &Value, kind: &str) -> Result<Vec<String>, AgentError> {
    let v = raw
        .get("keys")
        .or_else(|| raw.get("key"))
        .ok_or_else(|| missing(kind, "keys"))?;
    match v {
        Value::String(key) => Ok(vec![key.clone()]),
        Value::Array(items) if items.is_empty() => Err(missing(kind, "keys")),
        Value::Array(items) => items
            .iter()
            .map(|k| k.as_str().map(str::to_string).ok_or_else(|| missing(kind, "keys")))
            .collect(),
        _ => Err(missing(kind, "keys")),
    }
}

fn path(raw: &Value, kind: &str) -> Result<Vec<Point>, AgentError> {
    let items = raw
        .get("path")
        .or_else(|| raw.get("points"))
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| missing(kind, "path"))?;
    items
        .iter()
        .map(|p| {
            let x = p.get("x").and_then(as_int);
            let y = p.get("y").and_then(as_int);
            match (x, y) {
                (Some(x), Some(y)) => Ok(Point { x, y }),
                _ => Err(missing(kind, "path")),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(action: Value) -> ActionRequest {
        let kind = action.get("type").and_then(Value::as_str).unwrap_or("unknown");
        ActionRequest {
            call_id: "call_1".into(),
            kind: ActionKind::parse(kind),
            raw: action,
            pending_safety_checks: vec![],
        }
    }

    fn err_text(action: Value) -> String {
        normalize(&req(action)).unwrap_err().to_string()
    }

    #[test]
    fn minimal_parameters_normalize_for_every_kind() {
        let cases = [
            (json!({"type": "click", "x": 1, "y": 2}), NormalizedAction::Click { x: 1, y: 2, button: "left".into() }),
            (json!({"type": "double_click", "x": 1, "y": 2}), NormalizedAction::DoubleClick { x: 1, y: 2 }),
            (json!({"type": "type", "text": ""}), NormalizedAction::Type { text: String::new() }),
            (json!({"type": "keypress", "keys": ["CTRL", "c"]}), NormalizedAction::Keypress { keys: vec!["CTRL".into(), "c".into()] }),
            (
                json!({"type": "scroll", "x": 5, "y": 6, "scroll_x": 0, "scroll_y": -3}),
                NormalizedAction::Scroll { x: 5, y: 6, scroll_x: 0, scroll_y: -3 },
            ),
            (json!({"type": "drag", "path": [{"x": 0, "y": 0}]}), NormalizedAction::Drag { path: vec![Point { x: 0, y: 0 }] }),
            (json!({"type": "move", "x": 9, "y": 8}), NormalizedAction::Move { x: 9, y: 8 }),
            (json!({"type": "wait"}), NormalizedAction::Wait { ms: 1000 }),
            (json!({"type": "screenshot"}), NormalizedAction::Screenshot),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize(&req(raw)).unwrap(), expected);
        }
    }

    #[test]
    fn missing_required_fields_name_the_kind() {
        for (raw, kind) in [
            (json!({"type": "click", "x": 1}), "click"),
            (json!({"type": "double_click"}), "double_click"),
            (json!({"type": "type"}), "type"),
            (json!({"type": "keypress"}), "keypress"),
            (json!({"type": "keypress", "keys": []}), "keypress"),
            (json!({"type": "scroll", "x": 1, "y": 1, "scroll_y": 2}), "scroll"),
            (json!({"type": "drag", "path": []}), "drag"),
            (json!({"type": "move", "y": 3}), "move"),
        ] {
            let msg = err_text(raw);
            assert!(msg.contains(&format!("{kind} action")), "{msg}");
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(err_text(json!({"type": "teleport"})), "action normalization failed: Unknown action type: teleport");
    }

    #[test]
    fn click_button_passes_through() {
        let a = normalize(&req(json!({"type": "click", "x": 1, "y": 2, "button": "back"}))).unwrap();
        assert_eq!(a, NormalizedAction::Click { x: 1, y: 2, button: "back".into() });
    }

    #[test]
    fn bare_key_becomes_single_element_list() {
        let a = normalize(&req(json!({"type": "keypress", "keys": "ENTER"}))).unwrap();
        assert_eq!(a, NormalizedAction::Keypress { keys: vec!["ENTER".into()] });
        let legacy = normalize(&req(json!({"type": "keypress", "key": "ESC"}))).unwrap();
        assert_eq!(legacy, NormalizedAction::Keypress { keys: vec!["ESC".into()] });
    }

    #[test]
    fn type_preserves_line_breaks() {
        let a = normalize(&req(json!({"type": "type", "text": "a\nb\n"}))).unwrap();
        assert_eq!(a, NormalizedAction::Type { text: "a\nb\n".into() });
    }

    #[test]
    fn wait_fields_follow_precedence() {
        let ms = |raw: Value| match normalize(&req(raw)).unwrap() {
            NormalizedAction::Wait { ms } => ms,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ms(json!({"type": "wait"})), 1000);
        assert_eq!(ms(json!({"type": "wait", "time": 250})), 250);
        assert_eq!(ms(json!({"type": "wait", "params": {"time": 40}})), 40);
        assert_eq!(ms(json!({"type": "wait", "params": {"ms": 30}, "time": 250})), 30);
        assert_eq!(ms(json!({"type": "wait", "ms": 10, "params": {"ms": 30}})), 10);
    }

    #[test]
    fn drag_keeps_point_order_and_accepts_legacy_field() {
        let a = normalize(&req(json!({"type": "drag", "points": [{"x": 0, "y": 0}, {"x": 10, "y": 10}, {"x": 20, "y": 5}]}))).unwrap();
        assert_eq!(
            a,
            NormalizedAction::Drag { path: vec![Point { x: 0, y: 0 }, Point { x: 10, y: 10 }, Point { x: 20, y: 5 }] }
        );
    }

    #[test]
    fn float_coordinates_are_rounded() {
        let a = normalize(&req(json!({"type": "move", "x": 10.6, "y": 2.2}))).unwrap();
        assert_eq!(a, NormalizedAction::Move { x: 11, y: 2 });
    }

    #[test]
    fn parameters_omit_the_tag() {
        let a = NormalizedAction::Scroll { x: 1, y: 2, scroll_x: 0, scroll_y: 4 };
        assert_eq!(a.kind(), "scroll");
        assert_eq!(a.parameters(), json!({"x": 1, "y": 2, "scroll_x": 0, "scroll_y": 4}));
        assert_eq!(NormalizedAction::Screenshot.parameters(), json!({}));
    }
}
