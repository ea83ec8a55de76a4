//! Program graph adapter
//!
//! The block editor owns the program graph. This module reads the editor's
//! JSON workspace serialization (or a programmatically assembled graph) and
//! exposes it as a flat arena of typed blocks that the compiler walks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::GraphError;

/// Identifier of a block inside one program graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A literal field value as the editor stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Renders the value the way the editor's code generators read it.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => format_number(*n),
            FieldValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.as_str() {
                "TRUE" | "true" => Some(true),
                "FALSE" | "false" => Some(false),
                _ => None,
            },
            FieldValue::Number(_) => None,
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            // Variable fields are serialized as `{"id": ...}`
            Value::Object(map) => map
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| FieldValue::Text(s.to_string())),
            _ => None,
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One node of the program graph.
///
/// `inputs` maps a slot name to the first block connected to it. For value
/// slots that is the single child producing the value; for statement slots it
/// is the head of a chain linked through `next`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub block_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub inputs: BTreeMap<String, BlockId>,
    pub next: Option<BlockId>,
    pub position: Option<(f64, f64)>,
}

impl Block {
    pub fn new(id: impl Into<BlockId>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            fields: BTreeMap::new(),
            inputs: BTreeMap::new(),
            next: None,
            position: None,
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn with_text(self, name: &str, value: &str) -> Self {
        self.with_field(name, FieldValue::Text(value.to_string()))
    }

    pub fn with_number(self, name: &str, value: f64) -> Self {
        self.with_field(name, FieldValue::Number(value))
    }

    pub fn with_input(mut self, name: &str, child: impl Into<BlockId>) -> Self {
        self.inputs.insert(name.to_string(), child.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<BlockId>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some((x, y));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn input(&self, name: &str) -> Option<&BlockId> {
        self.inputs.get(name)
    }
}

impl From<String> for BlockId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Arena view of the editor's program graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramGraph {
    blocks: HashMap<BlockId, Block>,
    top: Vec<BlockId>,
}

impl ProgramGraph {
    /// Parses the editor's JSON workspace serialization.
    pub fn from_json_str(text: &str) -> Result<Self, GraphError> {
        let doc: WorkspaceDoc = serde_json::from_str(text)?;
        Self::from_document(doc)
    }

    pub fn from_value(value: Value) -> Result<Self, GraphError> {
        let doc: WorkspaceDoc = serde_json::from_value(value)?;
        Self::from_document(doc)
    }

    fn from_document(doc: WorkspaceDoc) -> Result<Self, GraphError> {
        let mut flattener = Flattener::default();
        let mut top = Vec::new();
        let raw_blocks = doc.blocks.map(|section| section.blocks).unwrap_or_default();
        for raw in raw_blocks {
            let position = raw.position();
            let id = flattener.flatten(raw)?;
            top.push((id, position));
        }

        // Top blocks run in on-screen order: top to bottom, then left to right.
        top.sort_by(|(_, a), (_, b)| {
            let (ax, ay) = a.unwrap_or((0.0, 0.0));
            let (bx, by) = b.unwrap_or((0.0, 0.0));
            ay.total_cmp(&by).then(ax.total_cmp(&bx))
        });

        debug!(
            "Loaded program graph with {} blocks ({} top-level)",
            flattener.blocks.len(),
            top.len()
        );

        Ok(Self {
            blocks: flattener.blocks,
            top: top.into_iter().map(|(id, _)| id).collect(),
        })
    }

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Top-level blocks in execution order.
    pub fn top_blocks(&self) -> &[BlockId] {
        &self.top
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Mutable access to field `field` of every block whose type is in `types`.
    pub fn fields_mut<'a>(
        &'a mut self,
        types: &'a [&'a str],
        field: &'a str,
    ) -> impl Iterator<Item = &'a mut FieldValue> + 'a {
        self.blocks
            .values_mut()
            .filter(move |block| types.contains(&block.block_type.as_str()))
            .filter_map(move |block| block.fields.get_mut(field))
    }
}

/// Assembles a graph block by block, without going through a document.
///
/// Unlike the document path this can express shared or cyclic links, which
/// the compiler rejects.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: ProgramGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, block: Block) -> Self {
        self.graph.blocks.insert(block.id.clone(), block);
        self
    }

    /// Appends a top-level block; top blocks run in the order they are added.
    pub fn top(mut self, block: Block) -> Self {
        self.graph.top.push(block.id.clone());
        self.block(block)
    }

    pub fn build(self) -> ProgramGraph {
        self.graph
    }
}

#[derive(Debug, Deserialize)]
struct WorkspaceDoc {
    #[serde(default)]
    blocks: Option<BlocksSection>,
}

#[derive(Debug, Deserialize)]
struct BlocksSection {
    #[serde(default)]
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    #[serde(default)]
    inputs: BTreeMap<String, RawConnection>,
    #[serde(default)]
    next: Option<RawConnection>,
}

impl RawBlock {
    fn position(&self) -> Option<(f64, f64)> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    #[serde(default)]
    block: Option<Box<RawBlock>>,
    #[serde(default)]
    shadow: Option<Box<RawBlock>>,
}

impl RawConnection {
    // A real block plugged into a slot hides the slot's shadow.
    fn into_block(self) -> Option<RawBlock> {
        self.block.or(self.shadow).map(|b| *b)
    }
}

#[derive(Default)]
struct Flattener {
    blocks: HashMap<BlockId, Block>,
    generated: usize,
}

impl Flattener {
    fn flatten(&mut self, raw: RawBlock) -> Result<BlockId, GraphError> {
        let position = raw.position();
        let id = match raw.id {
            Some(id) => BlockId(id),
            None => {
                self.generated += 1;
                BlockId(format!("auto-{}", self.generated))
            }
        };
        if self.blocks.contains_key(&id) {
            return Err(GraphError::DuplicateId(id.0));
        }

        let mut block = Block::new(id.clone(), raw.block_type);
        block.position = position;
        for (name, value) in &raw.fields {
            if let Some(field) = FieldValue::from_json(value) {
                block.fields.insert(name.clone(), field);
            }
        }
        // Reserve the id before descending so a duplicate further down is caught.
        self.blocks.insert(id.clone(), block.clone());

        for (name, connection) in raw.inputs {
            if let Some(child) = connection.into_block() {
                let child_id = self.flatten(child)?;
                block.inputs.insert(name, child_id);
            }
        }
        if let Some(next) = raw.next.and_then(RawConnection::into_block) {
            block.next = Some(self.flatten(next)?);
        }

        self.blocks.insert(id.clone(), block);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flattens_nested_document() {
        let graph = ProgramGraph::from_value(json!({
            "blocks": {
                "languageVersion": 0,
                "blocks": [{
                    "type": "mouse_click",
                    "id": "click",
                    "x": 10, "y": 20,
                    "inputs": {
                        "X": {"shadow": {"type": "math_number", "id": "sx", "fields": {"NUM": 5}},
                              "block": {"type": "math_number", "id": "bx", "fields": {"NUM": 7}}}
                    },
                    "next": {"block": {"type": "browser_refresh", "id": "refresh"}}
                }]
            }
        }))
        .unwrap();

        assert_eq!(graph.top_blocks(), &[BlockId::from("click")]);
        let click = graph.block(&"click".into()).unwrap();
        assert_eq!(click.input("X"), Some(&BlockId::from("bx")));
        assert_eq!(click.next, Some(BlockId::from("refresh")));
        assert!(graph.block(&"sx".into()).is_none());
    }

    #[test]
    fn test_top_blocks_sorted_by_position() {
        let graph = ProgramGraph::from_value(json!({
            "blocks": {"blocks": [
                {"type": "browser_refresh", "id": "low", "x": 0, "y": 300},
                {"type": "browser_refresh", "id": "right", "x": 200, "y": 10},
                {"type": "browser_refresh", "id": "left", "x": 0, "y": 10}
            ]}
        }))
        .unwrap();

        let order: Vec<&str> = graph.top_blocks().iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["left", "right", "low"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = ProgramGraph::from_value(json!({
            "blocks": {"blocks": [
                {"type": "browser_refresh", "id": "a",
                 "next": {"block": {"type": "browser_refresh", "id": "a"}}}
            ]}
        }));
        assert!(matches!(result, Err(GraphError::DuplicateId(id)) if id == "a"));
    }

    #[test]
    fn test_missing_ids_are_generated() {
        let graph = ProgramGraph::from_value(json!({
            "blocks": {"blocks": [
                {"type": "browser_refresh", "next": {"block": {"type": "mouse_middle_click"}}}
            ]}
        }))
        .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.top_blocks()[0].as_str(), "auto-1");
    }

    #[test]
    fn test_empty_workspace() {
        let graph = ProgramGraph::from_json_str("{}").unwrap();
        assert!(graph.is_empty());
        assert!(graph.top_blocks().is_empty());
    }

    #[test]
    fn test_field_value_conversions() {
        assert_eq!(FieldValue::Number(3.0).as_text(), "3");
        assert_eq!(FieldValue::Number(2.5).as_text(), "2.5");
        assert_eq!(FieldValue::Text(" 42 ".into()).as_number(), Some(42.0));
        assert_eq!(FieldValue::Text("TRUE".into()).as_bool(), Some(true));
        assert_eq!(FieldValue::Bool(false).as_text(), "FALSE");
    }
}
