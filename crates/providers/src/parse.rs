//! Forgiving parser for LLM stage output.
//!
//! Four strategies, tried in order: strict JSON, JSON repair, per-field
//! semantic extraction, schema-defaulted object. The winning strategy is
//! reported to the caller for the stage's metrics entry. Parsing never
//! panics; an empty or whitespace-only output is a schema failure.

use cox_domain::error::{Error, Result};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema specs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    StringList,
    /// Arbitrary JSON; only satisfiable by the strict/repair passes.
    Object,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Value,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: Value::Null,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind, default: Value) -> Self {
        Self {
            name,
            kind,
            required: false,
            default,
        }
    }
}

/// A named output schema — the minimal contract the parser enforces.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    pub name: &'static str,
    pub fields: Vec<FieldSpec>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parse result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    Strict,
    Repair,
    FieldExtraction,
    SchemaDefault,
}

impl ParseStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStrategy::Strict => "strict",
            ParseStrategy::Repair => "repair",
            ParseStrategy::FieldExtraction => "field_extraction",
            ParseStrategy::SchemaDefault => "schema_default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub value: Value,
    pub strategy: ParseStrategy,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse raw stage output against a schema.
pub fn parse_stage_output(raw: &str, schema: &SchemaSpec) -> Result<ParsedOutput> {
    if raw.trim().is_empty() {
        return Err(Error::Schema {
            schema: schema.name.to_string(),
            message: "empty stage output".into(),
        });
    }

    // 1. Strict.
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(obj) = conform(value, schema) {
            return Ok(ParsedOutput {
                value: obj,
                strategy: ParseStrategy::Strict,
            });
        }
    }

    // 2. Repair.
    let repaired = repair_json(raw);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        if let Some(obj) = conform(value, schema) {
            return Ok(ParsedOutput {
                value: obj,
                strategy: ParseStrategy::Repair,
            });
        }
    }

    // 3. Per-field extraction.
    if let Some(obj) = extract_fields(raw, schema) {
        return Ok(ParsedOutput {
            value: obj,
            strategy: ParseStrategy::FieldExtraction,
        });
    }

    // 4. Schema-defaulted object — only when no field is required (a
    //    required field we could not recover is a schema failure).
    if schema.fields.iter().all(|f| !f.required) {
        let mut obj = Map::new();
        for field in &schema.fields {
            obj.insert(field.name.to_string(), field.default.clone());
        }
        return Ok(ParsedOutput {
            value: Value::Object(obj),
            strategy: ParseStrategy::SchemaDefault,
        });
    }

    Err(Error::Schema {
        schema: schema.name.to_string(),
        message: "output satisfied no parser strategy".into(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategy 1/2 support: conform a parsed value to the schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check required fields and fill defaults. Returns `None` when a required
/// field is missing or has the wrong kind.
fn conform(value: Value, schema: &SchemaSpec) -> Option<Value> {
    let mut obj = match value {
        Value::Object(m) => m,
        _ => return None,
    };

    for field in &schema.fields {
        let matches = obj.get(field.name).map(|v| kind_matches(v, field.kind));
        match matches {
            Some(true) => {}
            _ if field.required => return None,
            // Absent or wrong-kind optional value: use the default.
            _ => {
                obj.insert(field.name.to_string(), field.default.clone());
            }
        }
    }
    Some(Value::Object(obj))
}

fn kind_matches(v: &Value, kind: FieldKind) -> bool {
    match kind {
        FieldKind::String => v.is_string(),
        FieldKind::Number => v.is_number(),
        FieldKind::Bool => v.is_boolean(),
        FieldKind::StringList => {
            v.as_array()
                .map(|xs| xs.iter().all(Value::is_string))
                .unwrap_or(false)
        }
        FieldKind::Object => v.is_object() || v.is_array(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategy 2: JSON repair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Best-effort repair: strip code fences and prose around the outermost
/// JSON object, drop trailing commas, balance quotes and brackets.
pub fn repair_json(raw: &str) -> String {
    let mut s = strip_code_fences(raw);

    // Cut prose before the first brace and after the last closer.
    if let Some(start) = s.find(['{', '[']) {
        s = s[start..].to_string();
    }
    if let Some(end) = s.rfind(['}', ']']) {
        s = s[..=end].to_string();
    }

    // Trailing commas before a closer.
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Look ahead past whitespace; drop the comma if a closer follows.
                let mut ahead = chars.clone();
                let mut next_meaningful = None;
                for a in ahead.by_ref() {
                    if !a.is_whitespace() {
                        next_meaningful = Some(a);
                        break;
                    }
                }
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    // Close an unterminated string.
    if in_string {
        out.push('"');
    }

    // Balance brackets (outside strings).
    let mut stack = Vec::new();
    let mut in_str = false;
    let mut esc = false;
    for c in out.chars() {
        if in_str {
            if esc {
                esc = false;
            } else if c == '\\' {
                esc = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }

    out
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop an optional language tag, then everything after the closing fence.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        let body = body.rsplit_once("```").map(|(b, _)| b).unwrap_or(body);
        return body.trim().to_string();
    }
    trimmed.to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategy 3: field extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Targeted regex per schema field over the raw text. Succeeds when every
/// required field was recovered.
fn extract_fields(raw: &str, schema: &SchemaSpec) -> Option<Value> {
    let mut obj = Map::new();
    for field in &schema.fields {
        let extracted = match field.kind {
            FieldKind::String => extract_string(raw, field.name).map(Value::String),
            FieldKind::Number => extract_number(raw, field.name),
            FieldKind::Bool => extract_bool(raw, field.name).map(Value::Bool),
            FieldKind::StringList => extract_string_list(raw, field.name),
            // Nested objects are beyond regex recovery.
            FieldKind::Object => None,
        };
        match extracted {
            Some(v) => {
                obj.insert(field.name.to_string(), v);
            }
            None if field.required => return None,
            None => {
                obj.insert(field.name.to_string(), field.default.clone());
            }
        }
    }
    Some(Value::Object(obj))
}

fn extract_string(raw: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#,
        regex::escape(name)
    );
    let re = regex::Regex::new(&pattern).ok()?;
    let captured = re.captures(raw)?.get(1)?.as_str();
    serde_json::from_str::<String>(&format!("\"{captured}\"")).ok()
}

fn extract_number(raw: &str, name: &str) -> Option<Value> {
    let pattern = format!(r#""{}"\s*:\s*(-?\d+(?:\.\d+)?)"#, regex::escape(name));
    let re = regex::Regex::new(&pattern).ok()?;
    let captured = re.captures(raw)?.get(1)?.as_str();
    serde_json::from_str::<Value>(captured).ok()
}

fn extract_bool(raw: &str, name: &str) -> Option<bool> {
    let pattern = format!(r#""{}"\s*:\s*(true|false)"#, regex::escape(name));
    let re = regex::Regex::new(&pattern).ok()?;
    Some(re.captures(raw)?.get(1)?.as_str() == "true")
}

fn extract_string_list(raw: &str, name: &str) -> Option<Value> {
    let pattern = format!(r#""{}"\s*:\s*\[([^\]]*)\]"#, regex::escape(name));
    let re = regex::Regex::new(&pattern).ok()?;
    let inner = re.captures(raw)?.get(1)?.as_str();
    let item_re = regex::Regex::new(r#""((?:[^"\\]|\\.)*)""#).ok()?;
    let items: Vec<Value> = item_re
        .captures_iter(inner)
        .filter_map(|c| {
            let s = c.get(1)?.as_str();
            serde_json::from_str::<String>(&format!("\"{s}\"")).ok()
        })
        .map(Value::String)
        .collect();
    Some(Value::Array(items))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
