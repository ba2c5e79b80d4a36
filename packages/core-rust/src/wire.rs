//! Wire-level error shapes.
//!
//! Every error response body has the form
//! `{"errors":[{"code":..,"reason":..,"datetime":{"value":..,"timezone":..}}]}`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Moment an error was produced, split into a timestamp and its zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTime {
    pub value: String,
    pub timezone: String,
}

impl DateTime {
    /// Current instant in UTC, millisecond precision.
    #[must_use]
    pub fn now() -> Self {
        Self {
            value: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            timezone: "UTC".to_string(),
        }
    }
}

/// One structured error as rendered on the wire.
///
/// `status_code` travels with the value for the formatter's benefit but is
/// never serialized; the HTTP status line carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    pub status_code: u16,
    pub code: String,
    pub reason: String,
    pub datetime: DateTime,
}

impl ErrorResponse {
    /// Renders a leaf error. `Multiple` errors must be flattened first.
    #[must_use]
    pub fn from_error(err: &HandlerError, datetime: DateTime) -> Self {
        let kind = err.kind();
        Self {
            status_code: err.status_code(),
            code: kind.code().to_string(),
            reason: err.wire_reason(),
            datetime,
        }
    }
}

/// Body of an error-only response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorResponse>,
}

impl ErrorBody {
    /// Flattens `err` into one entry per leaf error, all sharing one timestamp.
    #[must_use]
    pub fn from_error(err: &HandlerError) -> Self {
        let datetime = DateTime::now();
        Self {
            errors: err
                .leaves()
                .into_iter()
                .map(|leaf| ErrorResponse::from_error(leaf, datetime.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MultipleErrors;

    #[test]
    fn error_body_serializes_expected_shape() {
        let body = ErrorBody::from_error(&HandlerError::invalid_param("id"));
        let json = serde_json::to_value(&body).unwrap();

        let entry = &json["errors"][0];
        assert_eq!(entry["code"], "Invalid Parameter");
        assert_eq!(entry["reason"], "Incorrect value for parameter: id");
        assert_eq!(entry["datetime"]["timezone"], "UTC");
        assert!(entry["datetime"]["value"].is_string());
        assert!(entry.get("status_code").is_none());
    }

    #[test]
    fn multiple_errors_flatten_into_one_array() {
        let err = HandlerError::Multiple(MultipleErrors::new(
            400,
            vec![
                HandlerError::invalid_param("id"),
                HandlerError::db(anyhow::anyhow!("syntax error near WHERE")),
            ],
        ));
        let body = ErrorBody::from_error(&err);

        assert_eq!(body.errors.len(), 2);
        assert_eq!(body.errors[0].code, "Invalid Parameter");
        assert_eq!(body.errors[1].code, "DB Error");
        assert_eq!(body.errors[1].reason, "DB Error");
        assert_eq!(body.errors[0].datetime, body.errors[1].datetime);
    }
}
