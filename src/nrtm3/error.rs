// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM3 wire errors.
//!
//! Every rejected request is answered with a single line
//! `ERROR:<code> <reason>`. Codes are a closed set kept for compatibility
//! with existing mirror clients:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 400 | bad flag combination or empty request |
//! | 401 | requested serial range not available |
//! | 403 | source not servable to this client |
//! | 405 | malformed `-g` value or option syntax |
//! | 406 | unsupported protocol version |

use crate::changelog::SerialId;
use std::fmt;
use thiserror::Error;

/// Legacy numeric NRTM3 error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyCode {
    BadRequest,
    InvalidRange,
    NotAuthorised,
    SyntaxError,
    UnsupportedVersion,
}

impl LegacyCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            LegacyCode::BadRequest => 400,
            LegacyCode::InvalidRange => 401,
            LegacyCode::NotAuthorised => 403,
            LegacyCode::SyntaxError => 405,
            LegacyCode::UnsupportedVersion => 406,
        }
    }
}

impl fmt::Display for LegacyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A request rejected for a protocol reason, carrying its legacy code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Blank request line.
    EmptyRequest,
    /// Both `-q` and `-g`, or neither.
    AmbiguousRequest,
    /// `-k` without `-g`.
    KeepaliveWithoutMirror,
    /// `-q` with something other than `SOURCES` or `VERSION`.
    UnknownInfoOption { value: String },
    /// Source not served to this client.
    UnknownSource { source: String },
    /// Malformed `-g` value.
    Syntax { detail: String },
    /// `-g` names a protocol version other than 3.
    UnsupportedVersion { requested: String },
    /// Mirror range outside the serials currently available.
    InvalidRange { first: SerialId, last: SerialId },
}

impl ProtocolError {
    pub fn syntax(detail: impl Into<String>) -> Self {
        Self::Syntax {
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> LegacyCode {
        match self {
            Self::EmptyRequest
            | Self::AmbiguousRequest
            | Self::KeepaliveWithoutMirror
            | Self::UnknownInfoOption { .. } => LegacyCode::BadRequest,
            Self::InvalidRange { .. } => LegacyCode::InvalidRange,
            Self::UnknownSource { .. } => LegacyCode::NotAuthorised,
            Self::Syntax { .. } => LegacyCode::SyntaxError,
            Self::UnsupportedVersion { .. } => LegacyCode::UnsupportedVersion,
        }
    }

    /// Canonical reason text sent after the code.
    pub fn reason(&self) -> String {
        match self {
            Self::EmptyRequest => "empty request".to_string(),
            Self::AmbiguousRequest => "ambiguous request: use exactly one of -q or -g".to_string(),
            Self::KeepaliveWithoutMirror => "-k is only allowed with -g".to_string(),
            Self::UnknownInfoOption { value } => format!("invalid -q option: {}", value),
            Self::UnknownSource { source } => format!("not authorised to mirror {}", source),
            Self::Syntax { .. } => "syntax error".to_string(),
            Self::UnsupportedVersion { requested } => {
                format!("unsupported protocol version: {}", requested)
            }
            Self::InvalidRange { first, last } => {
                format!("invalid range: Not within {}-{}", first, last)
            }
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR:{} {}", self.code(), self.reason())
    }
}

impl std::error::Error for ProtocolError {}

/// Failure to turn a request line into a [`super::Query`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Semantic violation with a legacy code.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The line could not be tokenized into flags and values
    /// (flag without its value, unknown flag, repeated flag, stray token).
    #[error("option syntax error: {0}")]
    OptionSyntax(String),
}

impl QueryError {
    pub(crate) fn option_syntax(detail: impl Into<String>) -> Self {
        Self::OptionSyntax(detail.into())
    }

    /// Legacy code used on the wire. Option syntax errors go out as 405.
    pub fn code(&self) -> LegacyCode {
        match self {
            Self::Protocol(e) => e.code(),
            Self::OptionSyntax(_) => LegacyCode::SyntaxError,
        }
    }

    /// The `ERROR:<code> <reason>` line for this failure.
    pub fn wire_response(&self) -> String {
        match self {
            Self::Protocol(e) => e.to_string(),
            Self::OptionSyntax(detail) => format!("ERROR:{} {}", self.code(), detail),
        }
    }

    pub fn is_option_syntax(&self) -> bool {
        matches!(self, Self::OptionSyntax(_))
    }

    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(e) => Some(e),
            Self::OptionSyntax(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_code_values() {
        assert_eq!(LegacyCode::BadRequest.as_u16(), 400);
        assert_eq!(LegacyCode::InvalidRange.as_u16(), 401);
        assert_eq!(LegacyCode::NotAuthorised.as_u16(), 403);
        assert_eq!(LegacyCode::SyntaxError.as_u16(), 405);
        assert_eq!(LegacyCode::UnsupportedVersion.as_u16(), 406);
    }

    #[test]
    fn test_protocol_error_wire_format() {
        assert_eq!(
            ProtocolError::UnknownSource { source: "FOO".into() }.to_string(),
            "ERROR:403 not authorised to mirror FOO"
        );
        assert_eq!(
            ProtocolError::InvalidRange { first: 1, last: 9 }.to_string(),
            "ERROR:401 invalid range: Not within 1-9"
        );
        assert!(ProtocolError::syntax("3 fields expected")
            .to_string()
            .starts_with("ERROR:405 "));
    }

    #[test]
    fn test_codes_for_bad_combinations() {
        for err in [
            ProtocolError::EmptyRequest,
            ProtocolError::AmbiguousRequest,
            ProtocolError::KeepaliveWithoutMirror,
            ProtocolError::UnknownInfoOption { value: "foo".into() },
        ] {
            assert_eq!(err.code(), LegacyCode::BadRequest);
        }
    }

    #[test]
    fn test_option_syntax_goes_out_as_405() {
        let err = QueryError::option_syntax("-q requires an argument");
        assert!(err.is_option_syntax());
        assert!(err.protocol().is_none());
        assert_eq!(err.wire_response(), "ERROR:405 -q requires an argument");
    }

    #[test]
    fn test_query_error_transparent_display() {
        let err = QueryError::from(ProtocolError::UnsupportedVersion { requested: "0".into() });
        assert_eq!(err.to_string(), "ERROR:406 unsupported protocol version: 0");
        assert_eq!(err.wire_response(), err.to_string());
    }
}
