//! Response body formats and parsers.
//!
//! [`Parser::Registry`] maps a [`Format`] to a built-in decoder (XML, JSON,
//! YAML, pass-through for HTML/plain). [`Parser::Custom`] replaces the registry
//! entirely: it receives every body together with the explicit format (if any),
//! and content-type sniffing is switched off while it is active.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::HttpError;

/// Key holding element text when an XML element also has attributes or children.
pub const XML_CONTENT_KEY: &str = "__content__";

/// Logical body representation, independent of the wire content-type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Xml,
    Json,
    Yaml,
    Html,
    Plain,
}

impl Format {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Xml => "xml",
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::Html => "html",
            Format::Plain => "plain",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(Format::Xml),
            "json" => Ok(Format::Json),
            "yaml" => Ok(Format::Yaml),
            "html" => Ok(Format::Html),
            "plain" => Ok(Format::Plain),
            other => Err(HttpError::configuration(format!(
                "unsupported format '{other}'"
            ))),
        }
    }
}

/// Media types recognised by the built-in registry, matched by substring.
const SUPPORTED_MIMETYPES: &[(&str, Format)] = &[
    ("text/xml", Format::Xml),
    ("application/xml", Format::Xml),
    ("text/json", Format::Json),
    ("application/json", Format::Json),
    ("text/javascript", Format::Json),
    ("application/javascript", Format::Json),
];

/// Map a `Content-Type` value to a format using the built-in registry.
///
/// Parameters such as `; charset=utf-8` are ignored.
#[must_use]
pub fn format_from_mimetype(content_type: &str) -> Option<Format> {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if media_type.is_empty() {
        return None;
    }
    SUPPORTED_MIMETYPES
        .iter()
        .find(|(mime, _)| media_type.contains(mime))
        .map(|(_, format)| *format)
}

/// Signature of a caller-supplied body parser.
///
/// Returning `Ok(None)` marks the payload as nil.
pub type ParserFn = dyn Fn(&str, Option<Format>) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>
    + Send
    + Sync;

/// Body parser: the built-in registry or a caller-supplied function.
#[derive(Clone, Default)]
pub enum Parser {
    #[default]
    Registry,
    Custom(Arc<ParserFn>),
}

impl Parser {
    /// Wrap a closure as a custom parser.
    #[must_use]
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, Option<Format>) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Parser::Custom(Arc::new(f))
    }

    #[must_use]
    pub fn is_custom(&self) -> bool {
        matches!(self, Parser::Custom(_))
    }

    /// Sniff a format from a content type. Always `None` for a custom parser.
    #[must_use]
    pub fn format_from_mimetype(&self, content_type: &str) -> Option<Format> {
        match self {
            Parser::Registry => format_from_mimetype(content_type),
            Parser::Custom(_) => None,
        }
    }

    /// Parse `body` according to `format`.
    ///
    /// # Errors
    /// Returns `HttpError::Parse` if the body is malformed for the format.
    pub fn parse(&self, body: &str, format: Option<Format>) -> Result<Option<Value>, HttpError> {
        match self {
            Parser::Registry => parse_body(body, format),
            Parser::Custom(f) => f(body, format).map_err(|source| HttpError::Parse {
                format,
                source,
            }),
        }
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parser::Registry => f.write_str("Registry"),
            Parser::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Parse `body` with the built-in registry.
///
/// Blank bodies and a literal `null` yield `None`. HTML, plain and unknown
/// formats return the body unchanged as a JSON string.
///
/// # Errors
/// Returns `HttpError::Parse` if the body is malformed for the format.
pub fn parse_body(body: &str, format: Option<Format>) -> Result<Option<Value>, HttpError> {
    if body.trim().is_empty() || body == "null" {
        return Ok(None);
    }

    let parsed = match format {
        Some(Format::Json) => serde_json::from_str::<Value>(body).map_err(|e| HttpError::Parse {
            format,
            source: Box::new(e),
        })?,
        Some(Format::Yaml) => {
            serde_saphyr::from_str::<Value>(body).map_err(|e| HttpError::Parse {
                format,
                source: Box::new(e),
            })?
        }
        Some(Format::Xml) => xml_to_value(body).map_err(|e| HttpError::Parse {
            format,
            source: Box::new(e),
        })?,
        Some(Format::Html | Format::Plain) | None => Value::String(body.to_owned()),
    };

    Ok(match parsed {
        Value::Null => None,
        other => Some(other),
    })
}

#[derive(Debug, thiserror::Error)]
enum XmlError {
    #[error(transparent)]
    Syntax(#[from] quick_xml::Error),
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("document has no root element")]
    NoRoot,
}

#[derive(Default)]
struct XmlNode {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl XmlNode {
    fn open(start: &BytesStart<'_>) -> Result<Self, XmlError> {
        let mut node = XmlNode {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..XmlNode::default()
        };
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            node.fields.insert(key, Value::String(value));
        }
        Ok(node)
    }

    fn close(self) -> (String, Value) {
        let value = if self.fields.is_empty() {
            if self.text.is_empty() {
                Value::Null
            } else {
                Value::String(self.text)
            }
        } else {
            let mut fields = self.fields;
            if !self.text.is_empty() {
                fields.insert(XML_CONTENT_KEY.to_owned(), Value::String(self.text));
            }
            Value::Object(fields)
        };
        (self.name, value)
    }
}

/// Insert a child, collapsing repeated siblings into an ordered array.
fn insert_child(fields: &mut Map<String, Value>, name: String, value: Value) {
    match fields.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            fields.insert(name, value);
        }
    }
}

fn xml_to_value(body: &str) -> Result<Value, XmlError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut root = Map::new();
    let mut stack: Vec<XmlNode> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(XmlNode::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = XmlNode::open(&start)?.close();
                let parent = stack.last_mut().map_or(&mut root, |n| &mut n.fields);
                insert_child(parent, name, value);
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    let (name, value) = node.close();
                    let parent = stack.last_mut().map_or(&mut root, |n| &mut n.fields);
                    insert_child(parent, name, value);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(node) = stack.pop() {
        return Err(XmlError::Unclosed(node.name));
    }
    if root.is_empty() {
        return Err(XmlError::NoRoot);
    }
    Ok(Value::Object(root))
}
