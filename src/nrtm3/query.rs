// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM3 request grammar.
//!
//! ```text
//! -q SOURCES|VERSION                    info query
//! [-k] -g SOURCE:3:BEGIN-END|LAST       mirror query, optionally kept alive
//! ```
//!
//! Keywords (`SOURCES`, `VERSION`, `LAST`, source names) are case-insensitive.
//!
//! # Validation Order
//!
//! Checks run in a fixed order so a request with several faults always
//! reports the same code:
//!
//! 1. blank line (400)
//! 2. flag presence: `-q`/`-g` exclusivity, `-k` needs `-g` (400)
//! 3. tokenization: missing values, unknown/repeated flags ([`QueryError::OptionSyntax`])
//! 4. `-q` value (400)
//! 5. `-g` value: source (403), protocol version (406), field count (405), range (405)

use super::error::{ProtocolError, QueryError};
use crate::changelog::SerialId;
use crate::source::{Source, SourceContext};
use std::fmt;
use std::str::FromStr;

/// The only mirror protocol version served.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 3;

/// Legacy wire value of [`SerialEnd::Last`].
pub const LAST_SERIAL_SENTINEL: SerialId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Info,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoOption {
    Sources,
    Version,
}

impl FromStr for InfoOption {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("SOURCES") {
            Ok(InfoOption::Sources)
        } else if s.eq_ignore_ascii_case("VERSION") {
            Ok(InfoOption::Version)
        } else {
            Err(ProtocolError::UnknownInfoOption {
                value: s.to_string(),
            })
        }
    }
}

impl fmt::Display for InfoOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoOption::Sources => f.write_str("SOURCES"),
            InfoOption::Version => f.write_str("VERSION"),
        }
    }
}

/// Upper bound of a mirror range.
///
/// `Last` and an explicit serial equal to the current tail are kept apart:
/// they are different requests even when they select the same entries today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEnd {
    Last,
    At(SerialId),
}

impl SerialEnd {
    /// Legacy integer form (`-1` for `LAST`).
    pub fn as_legacy(&self) -> SerialId {
        match self {
            SerialEnd::Last => LAST_SERIAL_SENTINEL,
            SerialEnd::At(serial) => *serial,
        }
    }

    /// Concrete end serial given the current tail.
    pub fn resolve(&self, tail: SerialId) -> SerialId {
        match self {
            SerialEnd::Last => tail,
            SerialEnd::At(serial) => *serial,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, SerialEnd::Last)
    }
}

/// A validated NRTM3 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Requested source (canonical spelling). Info queries use the
    /// authoritative source.
    pub source: Source,
    pub mode: QueryMode,
    /// Set for info queries only.
    pub info_option: Option<InfoOption>,
    pub serial_begin: SerialId,
    pub serial_end: SerialEnd,
    pub keepalive: bool,
}

/// Flags and values after tokenization, before semantic checks.
#[derive(Debug, Default)]
struct RawFlags<'a> {
    info: Option<&'a str>,
    mirror: Option<&'a str>,
    keepalive: bool,
}

const FLAG_INFO: &str = "-q";
const FLAG_MIRROR: &str = "-g";
const FLAG_KEEPALIVE: &str = "-k";

fn is_flag(token: &str) -> bool {
    matches!(token, FLAG_INFO | FLAG_MIRROR | FLAG_KEEPALIVE)
}

impl Query {
    /// Parse and validate one request line for a client in `context`.
    pub fn parse(context: &SourceContext, args: &str) -> Result<Query, QueryError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(ProtocolError::EmptyRequest.into());
        }

        let has_info = tokens.contains(&FLAG_INFO);
        let has_mirror = tokens.contains(&FLAG_MIRROR);
        let has_keepalive = tokens.contains(&FLAG_KEEPALIVE);

        if has_info == has_mirror {
            return Err(ProtocolError::AmbiguousRequest.into());
        }
        if has_keepalive && !has_mirror {
            return Err(ProtocolError::KeepaliveWithoutMirror.into());
        }

        let flags = tokenize(&tokens)?;

        if let Some(value) = flags.info {
            let option: InfoOption = value.parse()?;
            return Ok(Query {
                source: context.authoritative().clone(),
                mode: QueryMode::Info,
                info_option: Some(option),
                serial_begin: 0,
                serial_end: SerialEnd::Last,
                keepalive: false,
            });
        }

        let value = flags
            .mirror
            .ok_or_else(|| QueryError::option_syntax("-g requires an argument"))?;
        let (source, serial_begin, serial_end) = parse_mirror_value(context, value)?;

        Ok(Query {
            source,
            mode: QueryMode::Mirror,
            info_option: None,
            serial_begin,
            serial_end,
            keepalive: flags.keepalive,
        })
    }

    pub fn is_info(&self) -> bool {
        self.mode == QueryMode::Info
    }

    pub fn is_mirror(&self) -> bool {
        self.mode == QueryMode::Mirror
    }

    /// Metric/log label: `sources`, `version` or `mirror`.
    pub fn kind(&self) -> &'static str {
        match (self.mode, self.info_option) {
            (QueryMode::Info, Some(InfoOption::Sources)) => "sources",
            (QueryMode::Info, _) => "version",
            (QueryMode::Mirror, _) => "mirror",
        }
    }
}

fn tokenize<'a>(tokens: &[&'a str]) -> Result<RawFlags<'a>, QueryError> {
    let mut flags = RawFlags::default();
    let mut iter = tokens.iter().copied();

    while let Some(token) = iter.next() {
        match token {
            FLAG_INFO | FLAG_MIRROR => {
                let value = match iter.next() {
                    Some(value) if !is_flag(value) => value,
                    _ => {
                        return Err(QueryError::option_syntax(format!(
                            "{} requires an argument",
                            token
                        )))
                    }
                };
                let slot = if token == FLAG_INFO {
                    &mut flags.info
                } else {
                    &mut flags.mirror
                };
                if slot.replace(value).is_some() {
                    return Err(QueryError::option_syntax(format!(
                        "{} given more than once",
                        token
                    )));
                }
            }
            FLAG_KEEPALIVE => {
                if flags.keepalive {
                    return Err(QueryError::option_syntax("-k given more than once"));
                }
                flags.keepalive = true;
            }
            other if other.starts_with('-') => {
                return Err(QueryError::option_syntax(format!(
                    "unknown option {}",
                    other
                )));
            }
            other => {
                return Err(QueryError::option_syntax(format!(
                    "unexpected argument {}",
                    other
                )));
            }
        }
    }

    Ok(flags)
}

fn parse_mirror_value(
    context: &SourceContext,
    value: &str,
) -> Result<(Source, SerialId, SerialEnd), QueryError> {
    let fields: Vec<&str> = value.split(':').collect();

    let requested = fields[0];
    let source = context
        .resolve(requested)
        .cloned()
        .ok_or_else(|| ProtocolError::UnknownSource {
            source: requested.to_string(),
        })?;

    let version = fields
        .get(1)
        .ok_or_else(|| ProtocolError::syntax("expected SOURCE:VERSION:RANGE"))?;
    if version.parse::<u32>().ok() != Some(SUPPORTED_PROTOCOL_VERSION) {
        return Err(ProtocolError::UnsupportedVersion {
            requested: version.to_string(),
        }
        .into());
    }

    if fields.len() != 3 {
        return Err(ProtocolError::syntax("expected SOURCE:VERSION:RANGE").into());
    }

    let (begin, end) = parse_range(fields[2])?;
    Ok((source, begin, end))
}

fn parse_range(range: &str) -> Result<(SerialId, SerialEnd), ProtocolError> {
    let (begin, end) = range
        .split_once('-')
        .ok_or_else(|| ProtocolError::syntax("range must be BEGIN-END"))?;

    let begin = parse_serial(begin)?;
    let end = if end.eq_ignore_ascii_case("LAST") {
        SerialEnd::Last
    } else {
        let end = parse_serial(end)?;
        if end < begin {
            return Err(ProtocolError::syntax("range end before begin"));
        }
        SerialEnd::At(end)
    };

    Ok((begin, end))
}

/// Non-negative decimal serial. Signs are rejected.
fn parse_serial(s: &str) -> Result<SerialId, ProtocolError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::syntax(format!("invalid serial {:?}", s)));
    }
    s.parse::<SerialId>()
        .map_err(|_| ProtocolError::syntax(format!("serial out of range {:?}", s)))
}
