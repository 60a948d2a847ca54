use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default cap on string attribute length, in characters.
pub const DEFAULT_MAX_STRING_LEN: usize = 1000;
/// Default cap on the number of elements in an array attribute.
pub const DEFAULT_MAX_ARRAY_LEN: usize = 100;

/// Length limits applied when converting arbitrary input into attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeLimits {
    /// Strings longer than this many characters are truncated
    pub max_string_len: usize,
    /// Arrays are capped at this many elements
    pub max_array_len: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

/// Single element of an array attribute
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// Attribute value types for span metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Scalar>),
}

impl AttributeValue {
    /// Converts arbitrary JSON input into an exportable attribute value.
    ///
    /// Scalars are kept as-is (strings truncated), arrays keep their scalar
    /// elements and stringify nested structures, objects become a JSON string.
    /// `null` has no attribute representation and yields `None`.
    pub fn from_json(value: &serde_json::Value, limits: &AttributeLimits) -> Option<Self> {
        use serde_json::Value;

        let converted = match value {
            Value::Null => return None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(truncate_chars(s, limits.max_string_len)),
            Value::Array(items) => Self::Array(
                items
                    .iter()
                    .filter_map(|item| Scalar::from_json(item, limits))
                    .take(limits.max_array_len)
                    .collect(),
            ),
            Value::Object(_) => Self::String(truncate_chars(&value.to_string(), limits.max_string_len)),
        };
        Some(converted)
    }

    /// Returns the string payload, if this is a string attribute
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interprets the value as a whole number.
    ///
    /// Accepts integers, integral floats and numeric strings, since token
    /// counts arrive in all three shapes depending on the instrumentation.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Self::String(s) => {
                let trimmed = s.trim();
                trimmed.parse::<i64>().ok().or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl Scalar {
    fn from_json(value: &serde_json::Value, limits: &AttributeLimits) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Value::String(s) => Some(Self::String(truncate_chars(s, limits.max_string_len))),
            Value::Array(_) | Value::Object(_) => Some(Self::String(truncate_chars(
                &value.to_string(),
                limits.max_string_len,
            ))),
        }
    }
}

/// Truncates to at most `max_chars` characters without splitting a code point.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Scalar>> for AttributeValue {
    fn from(value: Vec<Scalar>) -> Self {
        Self::Array(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// A single unit-of-work record travelling through the pipeline.
///
/// Mutable until the batch stage takes ownership; after that every setter is
/// a silent no-op so late writers cannot change what gets exported.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Head-based sampling decision carried by the trace
    pub sampled: bool,
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds), `None` while the span is open
    pub end_time: Option<u64>,
    status: SpanStatus,
    status_description: Option<String>,
    attributes: IndexMap<String, AttributeValue>,
    #[serde(skip)]
    ended: bool,
}

impl Span {
    /// Creates a new, sampled, open span starting now
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            sampled: true,
            name: name.into(),
            kind,
            start_time: now_nanos(),
            end_time: None,
            status: SpanStatus::Unset,
            status_description: None,
            attributes: IndexMap::new(),
            ended: false,
        }
    }

    /// Sets the sampling flag (builder style)
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Adds an attribute (builder style)
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Returns `true` if the span has no parent
    pub fn is_root(&self) -> bool {
        self.parent_span_id == 0
    }

    /// Sets an attribute, returning `false` if the span has already ended
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> bool {
        if self.ended {
            return false;
        }
        self.attributes.insert(key.into(), value.into());
        true
    }

    /// Converts arbitrary JSON input and stores it, applying `limits`.
    ///
    /// Returns `false` if the span has ended or the value was `null`.
    pub fn set_json_attribute(
        &mut self,
        key: impl Into<String>,
        value: &serde_json::Value,
        limits: &AttributeLimits,
    ) -> bool {
        match AttributeValue::from_json(value, limits) {
            Some(converted) => self.set_attribute(key, converted),
            None => false,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// All attributes in insertion order
    pub fn attributes(&self) -> &IndexMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn status(&self) -> SpanStatus {
        self.status
    }

    pub fn status_description(&self) -> Option<&str> {
        self.status_description.as_deref()
    }

    /// Sets the status; ignored once the span has ended
    pub fn set_status(&mut self, status: SpanStatus, description: Option<String>) {
        if self.ended {
            return;
        }
        self.status = status;
        self.status_description = description;
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        if self.ended {
            return;
        }
        self.end_time = Some(now_nanos());
        self.status = status;
    }

    /// Duration of the span in nanoseconds, `None` while the span is open
    pub fn duration_nanos(&self) -> Option<u64> {
        self.end_time.map(|end| end.saturating_sub(self.start_time))
    }

    /// Returns `true` once the batch stage has taken ownership
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Stamps the end time if missing and resolves an unset status to `Ok`.
    pub(crate) fn close(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(now_nanos());
        }
        if self.status == SpanStatus::Unset {
            self.status = SpanStatus::Ok;
        }
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }
}

/// Batch of spans for export
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self::with_spans(Vec::new())
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
