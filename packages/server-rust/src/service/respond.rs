//! Error normalization and response encoding.
//!
//! A handler produces an [`Outcome`]: optional data plus an optional error.
//! [`ResponseFormatter::respond`] turns that pair into exactly one HTTP
//! response:
//!
//! | data | error                  | response                                  |
//! |------|------------------------|-------------------------------------------|
//! | any  | none / already-exists  | 200 (201 POST, 204 DELETE without data)   |
//! | some | other                  | 206, data with `errors` merged in         |
//! | none | other                  | the error's status, `{"errors":[...]}`    |

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Body;
use axum::response::Response;
use gantry_core::{ErrorBody, HandlerError};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Body encoding for a response, chosen from the request's `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Xml,
    Text,
}

impl Encoding {
    /// `application/xml` and `text/xml` select XML, `text/plain` selects text,
    /// anything else (including no header) selects JSON.
    #[must_use]
    pub fn from_content_type(headers: &HeaderMap) -> Self {
        let Some(value) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
            return Self::Json;
        };
        let mime = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/xml" | "text/xml" => Self::Xml,
            "text/plain" => Self::Text,
            _ => Self::Json,
        }
    }

    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Text => "text/plain; charset=utf-8",
        }
    }

    fn encode(self, value: &Value) -> Vec<u8> {
        match self {
            Self::Json => serde_json::to_vec(value).unwrap_or_default(),
            Self::Xml => to_xml(value).unwrap_or_else(|err| {
                tracing::error!(error = %err, "failed to encode XML body");
                Vec::new()
            }),
            Self::Text => match value {
                Value::String(s) => s.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            },
        }
    }

    fn encode_errors(self, body: &ErrorBody) -> Vec<u8> {
        if self == Self::Text {
            let mut out = String::new();
            for entry in &body.errors {
                let _ = writeln!(out, "{}: {}", entry.code, entry.reason);
            }
            return out.into_bytes();
        }
        self.encode(&serde_json::to_value(body).unwrap_or(Value::Null))
    }
}

fn to_xml(value: &Value) -> anyhow::Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, "response", value)?;
    Ok(writer.into_inner())
}

/// Arrays become repeated `<item>` children, objects become one child per
/// key, and `null` becomes an empty element.
fn write_element(writer: &mut Writer<Vec<u8>>, tag: &str, value: &Value) -> anyhow::Result<()> {
    if value.is_null() {
        writer.write_event(Event::Empty(BytesStart::new(tag)))?;
        return Ok(());
    }

    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(writer, "item", item)?;
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                write_element(writer, &xml_name(key), child)?;
            }
        }
        Value::String(text) => {
            writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        scalar => {
            writer.write_event(Event::Text(BytesText::new(&scalar.to_string())))?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Maps an arbitrary JSON key onto a valid XML element name.
fn xml_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        name.insert(0, '_');
    }
    name
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a handler hands back: data, an error, both, or neither.
#[derive(Debug, Default)]
pub struct Outcome {
    pub data: Option<Value>,
    pub error: Option<HandlerError>,
}

impl Outcome {
    /// No data, no error.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Successful outcome. JSON `null` counts as no data.
    #[must_use]
    pub fn data(value: Value) -> Self {
        Self {
            data: (!value.is_null()).then_some(value),
            error: None,
        }
    }

    #[must_use]
    pub fn error(err: impl Into<HandlerError>) -> Self {
        Self {
            data: None,
            error: Some(err.into()),
        }
    }

    /// Data that was produced alongside an error.
    #[must_use]
    pub fn partial(value: Value, err: impl Into<HandlerError>) -> Self {
        Self {
            data: (!value.is_null()).then_some(value),
            error: Some(err.into()),
        }
    }
}

impl<T: Serialize> From<Result<T, HandlerError>> for Outcome {
    fn from(result: Result<T, HandlerError>) -> Self {
        match result.map(|data| serde_json::to_value(data)) {
            Ok(Ok(value)) => Self::data(value),
            Ok(Err(err)) => Self::error(HandlerError::Other(err.into())),
            Err(err) => Self::error(err),
        }
    }
}

impl From<HandlerError> for Outcome {
    fn from(err: HandlerError) -> Self {
        Self::error(err)
    }
}

// ---------------------------------------------------------------------------
// ResponseFormatter
// ---------------------------------------------------------------------------

/// Converts handler outcomes into wire responses and counts unknown errors.
#[derive(Debug, Default)]
pub struct ResponseFormatter {
    unknown_errors: AtomicU64,
}

impl ResponseFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unrecognized errors rendered so far.
    #[must_use]
    pub fn unknown_error_count(&self) -> u64 {
        self.unknown_errors.load(Ordering::Relaxed)
    }

    /// Renders `outcome` for a request made with `method`.
    pub fn respond(&self, method: &Method, outcome: Outcome, encoding: Encoding) -> Response {
        let Outcome { data, error } = outcome;
        let error = error.and_then(HandlerError::surfaced);

        match (data, error) {
            (data, None) => success(method, data, encoding),
            (Some(data), Some(err)) => {
                self.observe(&err);
                partial(data, &err, encoding)
            }
            (None, Some(err)) => self.error_response(encoding, &err),
        }
    }

    /// Error-only response: the error's status and the flattened `errors`
    /// body.
    pub fn error_response(&self, encoding: Encoding, err: &HandlerError) -> Response {
        self.observe(err);
        render_error(encoding, err)
    }

    fn observe(&self, err: &HandlerError) {
        for leaf in err.leaves() {
            if matches!(leaf, HandlerError::Other(_)) {
                self.unknown_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("app_unknown_error_total").increment(1);
                tracing::error!(error = ?leaf, "unrecognized handler error");
            }
        }
    }
}

/// Renders `err` without touching the unknown-error counter.
///
/// Used by layers that run outside the dispatcher (auth, panic recovery).
pub fn render_error(encoding: Encoding, err: &HandlerError) -> Response {
    let body = ErrorBody::from_error(err);
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    build(status, encoding, encoding.encode_errors(&body))
}

fn success(method: &Method, data: Option<Value>, encoding: Encoding) -> Response {
    if *method == Method::DELETE && data.is_none() {
        return build(StatusCode::NO_CONTENT, encoding, Vec::new());
    }

    let status = if *method == Method::POST {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    build(status, encoding, encoding.encode(&data.unwrap_or(Value::Null)))
}

fn partial(data: Value, err: &HandlerError, encoding: Encoding) -> Response {
    let errors = serde_json::to_value(ErrorBody::from_error(err).errors).unwrap_or(Value::Null);

    let merged = match data {
        Value::Object(mut map) => {
            map.insert("errors".to_string(), errors);
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map.insert("errors".to_string(), errors);
            Value::Object(map)
        }
    };
    build(StatusCode::PARTIAL_CONTENT, encoding, encoding.encode(&merged))
}

fn build(status: StatusCode, encoding: Encoding, body: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if status != StatusCode::NO_CONTENT {
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(encoding.content_type()),
        );
    }
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
