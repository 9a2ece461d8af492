/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use axum::{http::StatusCode, response::IntoResponse};
use miette::Diagnostic;
use opentelemetry_otlp::ExporterBuildError;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, io, net::AddrParseError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Error, Debug, Diagnostic)]
pub enum SkeletonCrewError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("Telemetry exporter error: {0}")]
    TraceError(#[from] ExporterBuildError),
    #[error("Tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("API error.")]
    ApiError(#[from] oneshot::error::RecvError),
    #[error("JACK error: {0}")]
    JackError(#[from] jack::Error),
    #[error("Invalid address: {0}")]
    AddrParseError(#[from] AddrParseError),
    #[error("OSC error: {0:?}")]
    OscError(rosc::OscError),
    #[error("Wire codec error: {0}")]
    WireError(#[from] postcard::Error),
    #[error("HTTP request error: {0}")]
    HttpRequestError(#[from] reqwest::Error),
    #[error("JSON serde error: {0}")]
    JsonSerdeError(#[from] serde_json::Error),
    #[error("WAV write error: {0}")]
    WavError(#[from] hound::Error),
    #[cfg(feature = "persistence")]
    #[error("Store error: {0}")]
    StoreError(#[from] rusqlite::Error),
    #[error("General error: {0}")]
    Other(String),
}

impl From<rosc::OscError> for SkeletonCrewError {
    fn from(e: rosc::OscError) -> Self {
        SkeletonCrewError::OscError(e)
    }
}

impl IntoResponse for SkeletonCrewError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{self}")).into_response()
    }
}

pub type SkeletonCrewResult<T> = Result<T, SkeletonCrewError>;

/// Stable wire identifiers for tool and transport failures. These names are
/// part of the protocol and must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgs,
    ToolNotFound,
    ToolExists,
    JackUnavailable,
    EndpointMissing,
    DirectionMismatch,
    AlreadyConnected,
    NotConnected,
    TargetInPast,
    RemoteTimeout,
    IdCollision,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgs => "invalid_args",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolExists => "tool_exists",
            ErrorKind::JackUnavailable => "jack_unavailable",
            ErrorKind::EndpointMissing => "endpoint_missing",
            ErrorKind::DirectionMismatch => "direction_mismatch",
            ErrorKind::AlreadyConnected => "already_connected",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::TargetInPast => "target_in_past",
            ErrorKind::RemoteTimeout => "remote_timeout",
            ErrorKind::IdCollision => "id_collision",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether callers are advised to retry an operation that failed with
    /// this kind. Validation, state and conflict errors never are.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::JackUnavailable | ErrorKind::RemoteTimeout)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope returned by the tool registry and carried over the remote
/// invocation protocol.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn jack_unavailable() -> Self {
        Self::new(ErrorKind::JackUnavailable, "JACK server is not reachable")
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_serialize_as_stable_wire_identifiers() {
        let kinds = [
            (ErrorKind::InvalidArgs, "invalid_args"),
            (ErrorKind::ToolNotFound, "tool_not_found"),
            (ErrorKind::ToolExists, "tool_exists"),
            (ErrorKind::JackUnavailable, "jack_unavailable"),
            (ErrorKind::EndpointMissing, "endpoint_missing"),
            (ErrorKind::DirectionMismatch, "direction_mismatch"),
            (ErrorKind::AlreadyConnected, "already_connected"),
            (ErrorKind::NotConnected, "not_connected"),
            (ErrorKind::TargetInPast, "target_in_past"),
            (ErrorKind::RemoteTimeout, "remote_timeout"),
            (ErrorKind::IdCollision, "id_collision"),
            (ErrorKind::Internal, "internal"),
        ];
        for (kind, expected) in kinds {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{expected}\""));
            assert_eq!(kind.as_str(), expected);
        }
    }

    #[test]
    fn retry_advice_follows_the_error_taxonomy() {
        assert!(ErrorKind::JackUnavailable.retryable());
        assert!(ErrorKind::RemoteTimeout.retryable());
        assert!(!ErrorKind::InvalidArgs.retryable());
        assert!(!ErrorKind::AlreadyConnected.retryable());
        assert!(!ErrorKind::ToolExists.retryable());
    }

    #[test]
    fn tool_error_carries_retry_hint() {
        let e = ToolError::jack_unavailable();
        assert!(e.retryable);
        let e = ToolError::invalid_args("missing field");
        assert!(!e.retryable);
    }
}
