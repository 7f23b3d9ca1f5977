//! Tree serializer: host node tree → HTML string.
//!
//! The sandbox resolves components down to host elements and hands them over
//! as a flat event list (`"text"`, `{"tag", "attrs", "html"?}`, `0` to close).
//! [`parse_events`] rebuilds the tree without recursion; [`HtmlSerializer`]
//! writes it out with React-compatible escaping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deepest element nesting accepted from the sandbox.
pub const MAX_TREE_DEPTH: usize = 2048;

/// Elements that never have content and are written as `<tag/>`.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("Invalid tag name '{0}'")]
    InvalidTagName(String),

    #[error("Invalid attribute name '{name}' on <{tag}>")]
    InvalidAttributeName { tag: String, name: String },

    #[error("<{0}> is a void element and cannot have children")]
    VoidElementChildren(String),

    #[error("Element tree nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("Malformed element tree: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementNode {
    pub tag: String,
    pub attrs: Vec<(String, AttrValue)>,
    pub children: Vec<Node>,
    /// Raw inner HTML from `dangerouslySetInnerHTML`.
    pub html: Option<String>,
}

impl ElementNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            html: None,
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.push((name.into(), value));
        self
    }

    pub fn child(mut self, node: Node) -> Self {
        self.children.push(node);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Element(ElementNode),
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }
}

impl From<ElementNode> for Node {
    fn from(element: ElementNode) -> Self {
        Node::Element(element)
    }
}

#[derive(Debug, Deserialize)]
struct OpenTag {
    tag: String,
    #[serde(default)]
    attrs: Vec<(String, AttrValue)>,
    #[serde(default)]
    html: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Event {
    Text(String),
    Open(OpenTag),
    Close(u8),
}

/// Rebuild the node forest from the sandbox's event list.
pub fn parse_events(json: &str) -> Result<Vec<Node>, SerializeError> {
    let events: Vec<Event> = serde_json::from_str(json).map_err(|e| SerializeError::Malformed(e.to_string()))?;

    let mut roots = Vec::new();
    let mut open: Vec<ElementNode> = Vec::new();

    for event in events {
        match event {
            Event::Text(text) => attach(&mut open, &mut roots, Node::Text(text)),
            Event::Open(tag) => {
                if open.len() >= MAX_TREE_DEPTH {
                    return Err(SerializeError::TooDeep(MAX_TREE_DEPTH));
                }
                open.push(ElementNode {
                    tag: tag.tag,
                    attrs: tag.attrs,
                    children: Vec::new(),
                    html: tag.html,
                });
            }
            Event::Close(_) => {
                let element = open
                    .pop()
                    .ok_or_else(|| SerializeError::Malformed("close without open".to_string()))?;
                attach(&mut open, &mut roots, Node::Element(element));
            }
        }
    }

    if let Some(element) = open.last() {
        return Err(SerializeError::Malformed(format!("<{}> was never closed", element.tag)));
    }
    Ok(roots)
}

fn attach(open: &mut [ElementNode], roots: &mut Vec<Node>, node: Node) {
    match open.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

/// Serializes a resolved node forest. Must be deterministic.
pub trait TreeSerializer: Send + Sync {
    fn serialize(&self, nodes: &[Node]) -> Result<String, SerializeError>;
}

/// `renderToString`-compatible HTML output.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlSerializer;

impl TreeSerializer for HtmlSerializer {
    fn serialize(&self, nodes: &[Node]) -> Result<String, SerializeError> {
        let mut out = String::new();
        write_children(&mut out, nodes, 0)?;
        Ok(out)
    }
}

fn write_children(out: &mut String, nodes: &[Node], depth: usize) -> Result<(), SerializeError> {
    let mut previous_text = false;
    for node in nodes {
        match node {
            Node::Text(text) => {
                // Keeps adjacent text nodes distinct for hydration.
                if previous_text {
                    out.push_str("<!-- -->");
                }
                escape_into(out, text);
                previous_text = true;
            }
            Node::Element(element) => {
                write_element(out, element, depth + 1)?;
                previous_text = false;
            }
        }
    }
    Ok(())
}

fn write_element(out: &mut String, element: &ElementNode, depth: usize) -> Result<(), SerializeError> {
    if depth > MAX_TREE_DEPTH {
        return Err(SerializeError::TooDeep(MAX_TREE_DEPTH));
    }
    let tag = element.tag.as_str();
    if !is_valid_tag(tag) {
        return Err(SerializeError::InvalidTagName(tag.to_string()));
    }

    out.push('<');
    out.push_str(tag);
    for (name, value) in &element.attrs {
        if !is_valid_attribute(name) {
            return Err(SerializeError::InvalidAttributeName {
                tag: tag.to_string(),
                name: name.clone(),
            });
        }
        match value {
            AttrValue::Flag(false) => {}
            AttrValue::Flag(true) => {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"\"");
            }
            AttrValue::Text(text) => {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                escape_into(out, text);
                out.push('"');
            }
        }
    }

    if VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str()) {
        if !element.children.is_empty() || element.html.is_some() {
            return Err(SerializeError::VoidElementChildren(tag.to_string()));
        }
        out.push_str("/>");
        return Ok(());
    }

    out.push('>');
    match &element.html {
        Some(html) => out.push_str(html),
        None => write_children(out, &element.children, depth)?,
    }
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
    Ok(())
}

/// `[a-zA-Z][a-zA-Z0-9:_.-]*`
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-'))
}

/// `[a-zA-Z_:][a-zA-Z0-9_:.-]*`
fn is_valid_attribute(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-'))
}

/// Escape text for both element content and quoted attribute values.
pub fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
}
