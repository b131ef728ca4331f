//! Canvas data model: typed nodes and connectors.
//!
//! Entities are stored in the Yrs document as JSON strings keyed by id, so
//! the serde representation below is the replicated format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Data key a node uses to reference a binary asset (e.g. an image path).
pub const ASSET_PATH_KEY: &str = "asset-path";

/// 2D position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Node kinds understood by the canvas.
///
/// Unknown kinds written by a newer peer decode as [`NodeType::Unknown`]
/// instead of failing the whole entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Text,
    Sticky,
    Image,
    Shape,
    Frame,
    Group,
    Prompt,
    Response,
    #[serde(other)]
    Unknown,
}

/// A canvas node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Caller-generated, unique within a document.
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Type-specific payload. Also carries transient UI keys locally.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Local selection flag. Never replicated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(default)]
    pub z_index: i64,
    /// Containment parent (e.g. the frame this node sits in).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Node {
    /// Create a node with a fresh random id.
    pub fn new(node_type: NodeType, position: Position) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), node_type, position)
    }

    pub fn with_id(id: impl Into<String>, node_type: NodeType, position: Position) -> Self {
        Self {
            id: id.into(),
            node_type,
            position,
            width: None,
            height: None,
            data: Map::new(),
            selected: None,
            z_index: 0,
            parent_id: None,
        }
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Asset path referenced by this node, if any.
    pub fn asset_path(&self) -> Option<&str> {
        self.data.get(ASSET_PATH_KEY).and_then(Value::as_str)
    }
}

/// Connector payload: routing points and marker/style attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeData {
    #[serde(default)]
    pub points: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_end: Option<String>,
    #[serde(default)]
    pub style: Map<String, Value>,
}

/// A connector between two nodes.
///
/// `source` and `target` are not enforced: an edge whose endpoint is
/// missing is kept and simply not rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub data: EdgeData,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            data: EdgeData::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_json_shape() {
        let node = Node::with_id("a", NodeType::Sticky, Position::new(1.0, 2.0))
            .with_parent("frame-1")
            .with_data("text", "hello");
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["type"], "sticky");
        assert_eq!(json["parentId"], "frame-1");
        assert_eq!(json["zIndex"], 0);
        assert!(json.get("selected").is_none());
        assert!(json.get("width").is_none());
    }

    #[test]
    fn test_unknown_node_type_decodes() {
        let json = r#"{"id":"x","type":"hologram","position":{"x":0.0,"y":0.0}}"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.node_type, NodeType::Unknown);
        assert!(node.data.is_empty());
    }

    #[test]
    fn test_asset_path_lookup() {
        let node = Node::new(NodeType::Image, Position::ORIGIN)
            .with_data(ASSET_PATH_KEY, "assets/cat.png");
        assert_eq!(node.asset_path(), Some("assets/cat.png"));
        assert_eq!(Node::new(NodeType::Text, Position::ORIGIN).asset_path(), None);
    }

    #[test]
    fn test_new_nodes_get_distinct_ids() {
        let a = Node::new(NodeType::Text, Position::ORIGIN);
        let b = Node::new(NodeType::Text, Position::ORIGIN);
        assert_ne!(a.id, b.id);
    }
}
