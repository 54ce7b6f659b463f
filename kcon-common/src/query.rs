//! Path queries over decoded resource descriptions.
//!
//! Resource descriptions returned by the cluster (JSON or YAML) are decoded
//! into a single tree shape, [`serde_json::Value`], and addressed with a
//! small path grammar:
//!
//! ```text
//! path    := segment ( "." prop | "[" index "]" )*
//! segment := prop | "[" index "]"
//! ```
//!
//! e.g. `metadata.name`, `spec.containers[0].image`, `[2]`. A leading `.`
//! is accepted (`.status.phase`). The empty path addresses the whole
//! document.
//!
//! Absence (`NotFound`) is kept distinct from a structurally wrong path
//! (`TypeMismatch`) and from unparseable input (`ParseFailure`) so callers
//! can decide which outcomes are fatal.

use std::fmt;

use serde_json::Value;

/// Input format of a resource description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

/// What could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseTarget {
    /// The path expression itself.
    Path(String),
    /// The document text.
    Document(DocumentFormat),
}

impl fmt::Display for ParseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "path {path:?}"),
            Self::Document(format) => write!(f, "{format} document"),
        }
    }
}

/// Why a segment did not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// The map has no such property.
    Property(String),
    /// The index is outside `[0, len)`.
    Index { index: usize, len: usize },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(name) => write!(f, "property {name:?} not present"),
            Self::Index { index, len } => {
                write!(f, "index {index} out of range (length {len})")
            }
        }
    }
}

/// Query failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The addressed value does not exist. Not fatal; the caller decides.
    #[error("{path}: {missing}")]
    NotFound { path: String, missing: Missing },

    /// The path expects a map or sequence where the document has something else.
    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The document or the path expression could not be parsed.
    #[error("Error parsing {target}: {message}")]
    ParseFailure { target: ParseTarget, message: String },
}

impl QueryError {
    /// Whether this is the non-fatal "absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Prop(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prop(name) => write!(f, ".{name}"),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    segments: Vec<Segment>,
}

impl PathExpr {
    /// Parse a path string. Surrounding whitespace is ignored.
    pub fn parse(path: &str) -> Result<Self, QueryError> {
        let path = path.trim();
        let fail = |message: String| QueryError::ParseFailure {
            target: ParseTarget::Path(path.to_string()),
            message,
        };

        let bytes = path.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;

        // A leading '.' is tolerated, kubectl jsonpath style.
        if bytes.first() == Some(&b'.') {
            pos = 1;
            if bytes.len() == 1 {
                return Ok(Self { segments });
            }
        }

        let mut expect_prop = true;
        while pos < bytes.len() {
            match bytes[pos] {
                b'[' => {
                    let close = path[pos..]
                        .find(']')
                        .map(|offset| pos + offset)
                        .ok_or_else(|| fail(format!("missing index after '[' at offset {pos}")))?;
                    let digits = &path[pos + 1..close];
                    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(fail(format!("invalid index {digits:?} at offset {pos}")));
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|err| fail(format!("invalid index {digits:?}: {err}")))?;
                    segments.push(Segment::Index(index));
                    pos = close + 1;
                    expect_prop = false;
                }
                b'.' if !expect_prop => {
                    pos += 1;
                    expect_prop = true;
                    if pos == bytes.len() {
                        return Err(fail("trailing '.'".to_string()));
                    }
                }
                b'.' | b']' => {
                    return Err(fail(format!(
                        "unexpected {:?} at offset {pos}",
                        bytes[pos] as char
                    )));
                }
                _ if expect_prop => {
                    let end = path[pos..]
                        .find(['.', '[', ']'])
                        .map(|offset| pos + offset)
                        .unwrap_or(bytes.len());
                    segments.push(Segment::Prop(path[pos..end].to_string()));
                    pos = end;
                    expect_prop = false;
                }
                _ => {
                    return Err(fail(format!("expected '.' or '[' at offset {pos}")));
                }
            }
        }

        Ok(Self { segments })
    }

    /// The parsed segments, in order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk `root` and return the textual form of the addressed value.
    ///
    /// Scalars render as their plain text (strings unquoted); maps and
    /// sequences render as compact JSON.
    pub fn evaluate(&self, root: &Value) -> Result<String, QueryError> {
        let mut node = root;
        let mut walked = String::new();

        for segment in &self.segments {
            walked.push_str(&segment.to_string());
            node = match (segment, node) {
                (Segment::Prop(name), Value::Object(map)) => {
                    map.get(name).ok_or_else(|| QueryError::NotFound {
                        path: display_path(&walked),
                        missing: Missing::Property(name.clone()),
                    })?
                }
                (Segment::Index(index), Value::Array(items)) => {
                    items.get(*index).ok_or_else(|| QueryError::NotFound {
                        path: display_path(&walked),
                        missing: Missing::Index {
                            index: *index,
                            len: items.len(),
                        },
                    })?
                }
                (Segment::Prop(_), other) => {
                    return Err(QueryError::TypeMismatch {
                        path: display_path(&walked),
                        expected: "map",
                        found: kind_of(other),
                    });
                }
                (Segment::Index(_), other) => {
                    return Err(QueryError::TypeMismatch {
                        path: display_path(&walked),
                        expected: "sequence",
                        found: kind_of(other),
                    });
                }
            };
        }

        Ok(render(node))
    }
}

fn display_path(walked: &str) -> String {
    walked.strip_prefix('.').unwrap_or(walked).to_string()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Null and containers use their canonical JSON form.
        other => other.to_string(),
    }
}

/// A decoded resource description.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
}

impl Document {
    /// Decode JSON text.
    pub fn from_json(text: &str) -> Result<Self, QueryError> {
        serde_json::from_str(text)
            .map(|root| Self { root })
            .map_err(|err| parse_failure(DocumentFormat::Json, err, text))
    }

    /// Decode YAML text into the same tree shape as JSON.
    pub fn from_yaml(text: &str) -> Result<Self, QueryError> {
        serde_yaml_ng::from_str(text)
            .map(|root| Self { root })
            .map_err(|err| parse_failure(DocumentFormat::Yaml, err, text))
    }

    /// Decode text in the given format.
    pub fn parse(format: DocumentFormat, text: &str) -> Result<Self, QueryError> {
        match format {
            DocumentFormat::Json => Self::from_json(text),
            DocumentFormat::Yaml => Self::from_yaml(text),
        }
    }

    /// Wrap an already-decoded tree.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// The decoded tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Evaluate a path string against this document.
    pub fn query(&self, path: &str) -> Result<String, QueryError> {
        PathExpr::parse(path)?.evaluate(&self.root)
    }

    /// Like [`query`](Self::query) but maps `NotFound` to `Ok(None)`.
    pub fn lookup(&self, path: &str) -> Result<Option<String>, QueryError> {
        match self.query(path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn parse_failure(format: DocumentFormat, err: impl fmt::Display, text: &str) -> QueryError {
    QueryError::ParseFailure {
        target: ParseTarget::Document(format),
        message: format!("{err}\n{text}"),
    }
}

/// Evaluate `path` against JSON `text`.
pub fn json_value(text: &str, path: &str) -> Result<String, QueryError> {
    Document::from_json(text)?.query(path)
}

/// Evaluate `path` against YAML `text`.
pub fn yaml_value(text: &str, path: &str) -> Result<String, QueryError> {
    Document::from_yaml(text)?.query(path)
}
