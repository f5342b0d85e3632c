//! Structured documents exchanged with the transport.
//!
//! A [`Node`] has a tag, string attributes and either no content, raw bytes,
//! or child nodes. The transport owns the binary encoding; this crate only
//! builds and reads the tree.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeContent {
    /// No content.
    #[default]
    Empty,
    /// Byte leaf.
    Bytes(Vec<u8>),
    /// Child nodes.
    Children(Vec<Node>),
}

/// A structured document element.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Element tag.
    pub tag: String,
    /// Attributes.
    pub attrs: BTreeMap<String, String>,
    /// Content.
    pub content: NodeContent,
}

impl Node {
    /// Creates an empty node.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: NodeContent::Empty,
        }
    }

    /// Adds an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(key.into(), value.to_string());
        self
    }

    /// Sets byte content.
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    /// Sets child content.
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Children(children);
        self
    }

    /// Returns an attribute value.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Returns a required attribute value.
    pub fn required_attr(&self, key: &str) -> ProtocolResult<&str> {
        self.attr(key).ok_or_else(|| {
            ProtocolError::malformed(format!("<{}> is missing attribute {key}", self.tag))
        })
    }

    /// Parses an attribute as an unsigned integer.
    pub fn attr_u64(&self, key: &str) -> ProtocolResult<Option<u64>> {
        self.attr(key)
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    ProtocolError::malformed(format!(
                        "<{}> attribute {key}={v} is not a number",
                        self.tag
                    ))
                })
            })
            .transpose()
    }

    /// Parses an attribute as a boolean; absent means false.
    pub fn attr_bool(&self, key: &str) -> bool {
        matches!(self.attr(key), Some("true"))
    }

    /// Returns the child nodes (empty for leaf nodes).
    pub fn children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Children(children) => children,
            _ => &[],
        }
    }

    /// Returns the first child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|c| c.tag == tag)
    }

    /// Returns the first child with the given tag or an error.
    pub fn required_child(&self, tag: &str) -> ProtocolResult<&Node> {
        self.child(tag)
            .ok_or_else(|| ProtocolError::malformed(format!("<{}> has no <{tag}> child", self.tag)))
    }

    /// Returns all children with the given tag.
    pub fn children_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children().iter().filter(move |c| c.tag == tag)
    }

    /// Returns the byte content, if any.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the byte content or an error.
    pub fn required_bytes(&self) -> ProtocolResult<&[u8]> {
        self.bytes()
            .ok_or_else(|| ProtocolError::malformed(format!("<{}> has no byte content", self.tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_accessors() {
        let node = Node::new("collection")
            .with_attr("name", "regular")
            .with_attr("version", 7)
            .with_attr("return_snapshot", false)
            .with_children(vec![
                Node::new("patch").with_bytes(vec![1]),
                Node::new("patch").with_bytes(vec![2]),
            ]);

        assert_eq!(node.attr("name"), Some("regular"));
        assert_eq!(node.attr_u64("version").unwrap(), Some(7));
        assert!(!node.attr_bool("return_snapshot"));
        assert_eq!(node.children_with_tag("patch").count(), 2);
        assert_eq!(node.required_child("patch").unwrap().bytes(), Some(&[1u8][..]));
        assert!(node.required_child("snapshot").is_err());
        assert!(node.required_bytes().is_err());
    }

    #[test]
    fn bad_number_attribute() {
        let node = Node::new("collection").with_attr("version", "seven");
        assert!(node.attr_u64("version").is_err());
        assert_eq!(node.attr_u64("missing").unwrap(), None);
    }
}
