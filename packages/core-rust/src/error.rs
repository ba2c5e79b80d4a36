//! Handler error taxonomy.
//!
//! Every error a handler can surface is a variant of [`HandlerError`]. Each
//! variant belongs to exactly one [`ErrorKind`], and each kind resolves to one
//! fixed HTTP status and wire `code` through [`ErrorKind::status_code`] and
//! [`ErrorKind::code`]. Nothing downstream inspects error types dynamically.

use std::fmt;

/// Classification of a [`HandlerError`], used as the key of the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-range input.
    InvalidParam,
    /// Required input absent.
    MissingParam,
    /// Lookup by id found nothing.
    EntityNotFound,
    /// Create collided with an existing entity. Swallowed as success.
    EntityAlreadyExists,
    /// Path exists but not under the requested method.
    MethodMissing,
    /// No route matches the path under any method.
    InvalidRoute,
    /// Requested file does not exist.
    FileNotFound,
    /// Request rejected by the auth interceptor.
    Unauthorized,
    /// Opaque backend failure; reason is never surfaced.
    Db,
    /// Anything the table does not recognize.
    Unknown,
}

impl ErrorKind {
    /// Every kind, in table order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::InvalidParam,
        ErrorKind::MissingParam,
        ErrorKind::EntityNotFound,
        ErrorKind::EntityAlreadyExists,
        ErrorKind::MethodMissing,
        ErrorKind::InvalidRoute,
        ErrorKind::FileNotFound,
        ErrorKind::Unauthorized,
        ErrorKind::Db,
        ErrorKind::Unknown,
    ];

    /// HTTP status code for a response carrying only this kind of error.
    ///
    /// `EntityAlreadyExists` reports 200 because the formatter treats it as a
    /// success; the method-specific success code is chosen by the formatter.
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidParam | ErrorKind::MissingParam => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::EntityNotFound | ErrorKind::InvalidRoute | ErrorKind::FileNotFound => 404,
            ErrorKind::MethodMissing => 405,
            ErrorKind::EntityAlreadyExists => 200,
            ErrorKind::Db | ErrorKind::Unknown => 500,
        }
    }

    /// Stable wire `code` string.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidParam => "Invalid Parameter",
            ErrorKind::MissingParam => "Missing Parameter",
            ErrorKind::EntityNotFound => "Entity Not Found",
            ErrorKind::EntityAlreadyExists => "Entity Already Exists",
            ErrorKind::MethodMissing => "Method Not Allowed",
            ErrorKind::InvalidRoute => "Route Not Found",
            ErrorKind::FileNotFound => "File Not Found",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Db => "DB Error",
            ErrorKind::Unknown => "Internal Server Error",
        }
    }

    /// Whether errors of this kind are dropped and the response treated as a success.
    #[must_use]
    pub const fn is_swallowed(self) -> bool {
        matches!(self, ErrorKind::EntityAlreadyExists)
    }
}

/// Error returned by a request handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Incorrect value for parameter: {}", .params.join(", "))]
    InvalidParam { params: Vec<String> },

    #[error("Parameter {} is required for this request", .params.join(", "))]
    MissingParam { params: Vec<String> },

    #[error("No '{entity}' found for Id: '{id}'")]
    EntityNotFound { entity: String, id: String },

    #[error("entity already exists")]
    EntityAlreadyExists,

    #[error("Method '{method}' for '{path}' not defined yet")]
    MethodMissing { method: String, path: String },

    #[error("route not registered")]
    InvalidRoute,

    #[error("File {name} not found")]
    FileNotFound { name: String },

    #[error("{reason}")]
    Unauthorized { reason: String },

    /// Backend failure. Display is fixed so driver details never reach the wire.
    #[error("DB Error")]
    Db(#[source] anyhow::Error),

    #[error(transparent)]
    Multiple(#[from] MultipleErrors),

    /// A panic recovered while serving the request.
    #[error("Some unexpected error has occurred")]
    Panic,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Shorthand for a single invalid parameter.
    pub fn invalid_param(name: impl Into<String>) -> Self {
        HandlerError::InvalidParam {
            params: vec![name.into()],
        }
    }

    /// Shorthand for a single missing parameter.
    pub fn missing_param(name: impl Into<String>) -> Self {
        HandlerError::MissingParam {
            params: vec![name.into()],
        }
    }

    /// Shorthand for an entity lookup miss.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        HandlerError::EntityNotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Wraps a backend error so its details stay server-side.
    pub fn db(err: impl Into<anyhow::Error>) -> Self {
        HandlerError::Db(err.into())
    }

    /// Returns the table key for this error.
    ///
    /// `Multiple` reports the kind of its first sub-error; callers that need
    /// the aggregate status use [`HandlerError::status_code`] instead.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::InvalidParam { .. } => ErrorKind::InvalidParam,
            HandlerError::MissingParam { .. } => ErrorKind::MissingParam,
            HandlerError::EntityNotFound { .. } => ErrorKind::EntityNotFound,
            HandlerError::EntityAlreadyExists => ErrorKind::EntityAlreadyExists,
            HandlerError::MethodMissing { .. } => ErrorKind::MethodMissing,
            HandlerError::InvalidRoute => ErrorKind::InvalidRoute,
            HandlerError::FileNotFound { .. } => ErrorKind::FileNotFound,
            HandlerError::Unauthorized { .. } => ErrorKind::Unauthorized,
            HandlerError::Db(_) => ErrorKind::Db,
            HandlerError::Multiple(m) => m
                .errors
                .first()
                .map_or(ErrorKind::Unknown, HandlerError::kind),
            HandlerError::Panic | HandlerError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Status code of a response carrying only this error.
    ///
    /// For `Multiple` this is the aggregate's own status, never recomputed
    /// from its sub-errors.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::Multiple(m) => m.status_code,
            other => other.kind().status_code(),
        }
    }

    /// Flattens nested `Multiple` errors depth-first into leaf errors.
    #[must_use]
    pub fn leaves(&self) -> Vec<&HandlerError> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a HandlerError>) {
        match self {
            HandlerError::Multiple(m) => {
                for err in &m.errors {
                    err.collect_leaves(out);
                }
            }
            leaf => out.push(leaf),
        }
    }

    /// Strips swallowed leaves, nested ones included.
    ///
    /// Returns `None` when nothing is left to report. A `Multiple` keeps its
    /// own status code and the order of the remaining errors.
    #[must_use]
    pub fn surfaced(self) -> Option<Self> {
        match self {
            HandlerError::Multiple(m) => {
                let status_code = m.status_code;
                let errors: Vec<_> = m.errors.into_iter().filter_map(Self::surfaced).collect();
                (!errors.is_empty())
                    .then(|| HandlerError::Multiple(MultipleErrors::new(status_code, errors)))
            }
            leaf if leaf.kind().is_swallowed() => None,
            leaf => Some(leaf),
        }
    }

    /// Reason string placed on the wire for this (leaf) error.
    #[must_use]
    pub fn wire_reason(&self) -> String {
        match self {
            HandlerError::Db(_) => ErrorKind::Db.code().to_string(),
            other => other.to_string(),
        }
    }
}

/// Several errors surfaced by one request under a single HTTP status.
#[derive(Debug)]
pub struct MultipleErrors {
    /// Status reported for the whole response.
    pub status_code: u16,
    pub errors: Vec<HandlerError>,
}

impl MultipleErrors {
    #[must_use]
    pub fn new(status_code: u16, errors: Vec<HandlerError>) -> Self {
        Self {
            status_code,
            errors,
        }
    }
}

impl fmt::Display for MultipleErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultipleErrors {}
