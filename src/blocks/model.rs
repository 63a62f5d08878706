// src/blocks/model.rs - Serialized block graph as produced by the editor
use super::BlockKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// JSON nesting accepted before a graph is rejected outright.
///
/// Every `next` link opens another object, so one statement chain holds at
/// most `MAX_DOCUMENT_DEPTH - 2` blocks (fewer when its last block has
/// inputs). Longer programs split into several top-level chains, which do
/// not add depth. Deserializing and dropping a chain both recurse per link,
/// so this also bounds stack use.
pub const MAX_DOCUMENT_DEPTH: usize = 512;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("block graph JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("block graph nests deeper than {max} levels (a statement chain adds one level per block)")]
    TooDeep { max: usize },
}

/// A literal value on a block field or in an unconnected socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// What is plugged into a socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Literal(FieldValue),
    Block(Box<BlockInstance>),
}

/// One node of the editor's block graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInstance {
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<BlockInstance>>,
}

impl BlockInstance {
    pub fn new(kind: BlockKind) -> Self {
        Self { kind, id: None, fields: BTreeMap::new(), inputs: BTreeMap::new(), next: None }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_literal(mut self, socket: &str, value: impl Into<FieldValue>) -> Self {
        self.inputs.insert(socket.to_string(), Binding::Literal(value.into()));
        self
    }

    pub fn with_input(mut self, socket: &str, block: BlockInstance) -> Self {
        self.inputs.insert(socket.to_string(), Binding::Block(Box::new(block)));
        self
    }

    /// Append `next` at the end of this block's statement chain.
    pub fn then(mut self, next: BlockInstance) -> Self {
        let tail = match self.next.take() {
            Some(existing) => existing.then(next),
            None => next,
        };
        self.next = Some(Box::new(tail));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn input(&self, socket: &str) -> Option<&Binding> {
        self.inputs.get(socket)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// The whole program: independent statement chains, compiled in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockGraph {
    #[serde(default)]
    pub blocks: Vec<BlockInstance>,
}

impl BlockGraph {
    pub fn new(blocks: Vec<BlockInstance>) -> Self {
        Self { blocks }
    }

    /// Parse editor JSON, rejecting absurdly nested documents before serde sees them.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        if json_depth(json) > MAX_DOCUMENT_DEPTH {
            return Err(GraphError::TooDeep { max: MAX_DOCUMENT_DEPTH });
        }
        let mut de = serde_json::Deserializer::from_str(json);
        de.disable_recursion_limit();
        let graph = BlockGraph::deserialize(&mut de)?;
        de.end()?;
        Ok(graph)
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Maximum bracket nesting of a JSON document, ignoring brackets inside strings.
fn json_depth(json: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for b in json.bytes() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max = max.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}
