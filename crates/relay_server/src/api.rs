// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and response bodies of the HTTP API.

use std::borrow::Cow;

use relay_core::{ArchiveError, ArchiveInfo, RelayError};
use relay_http::body::BodyError;
use relay_http::response::{self, ErrResponse, GenericResponse, StatusCode};
use serde::{Deserialize, Serialize};

/// Error type that will be serialized as API response, as opposed to logged.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "diagnostic", rename_all = "snake_case")]
pub enum ApiError {
    NotFound(Fields),
    InvalidInput(Fields),
    Conflict(Fields),
    Forbidden(Fields),
    RequestTooBig(Fields),
    NoDelegate(Fields),
    RelayFailed(Fields),
    Interrupted(Fields),
    TimedOut(Fields),
    InternalServerError(Fields),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Fields {
    additional_info: Cow<'static, str>,
}

impl Fields {
    fn new(value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            additional_info: value.into(),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RequestTooBig(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoDelegate(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RelayFailed(_) | Self::Interrupted(_) => StatusCode::BAD_GATEWAY,
            Self::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn additional_info(&self) -> &str {
        match self {
            Self::NotFound(f)
            | Self::InvalidInput(f)
            | Self::Conflict(f)
            | Self::Forbidden(f)
            | Self::RequestTooBig(f)
            | Self::NoDelegate(f)
            | Self::RelayFailed(f)
            | Self::Interrupted(f)
            | Self::TimedOut(f)
            | Self::InternalServerError(f) => &f.additional_info,
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(Fields::new(format!("{what} was not found.")))
    }

    pub fn invalid_input(reason: impl std::fmt::Display) -> Self {
        Self::InvalidInput(Fields::new(reason.to_string()))
    }

    pub fn missing_param(name: &str) -> Self {
        Self::InvalidInput(Fields::new(format!(
            "The request lacks the {name:?} query parameter."
        )))
    }

    pub fn into_response(self) -> GenericResponse {
        response::json(self.status_code(), &self)
    }
}

impl From<ApiError> for ErrResponse {
    fn from(err: ApiError) -> Self {
        ErrResponse(err.into_response())
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let info = Fields::new(err.to_string());
        match err {
            RelayError::ArchiveNotFound(_) => Self::NotFound(info),
            RelayError::InvalidPath(_)
            | RelayError::InvalidEntryName(_)
            | RelayError::InvalidUrl(_) => Self::InvalidInput(info),
            RelayError::PathInUse(_) | RelayError::Archive(ArchiveError::DuplicateEntry(_)) => {
                Self::Conflict(info)
            }
            RelayError::InvalidTicket(_) => Self::Forbidden(info),
            RelayError::NoDelegate { .. } => Self::NoDelegate(info),
            RelayError::Relay { .. } => Self::RelayFailed(info),
            RelayError::Interrupted => Self::Interrupted(info),
            RelayError::TimedOut(_) => Self::TimedOut(info),
            RelayError::Archive(_) => Self::InternalServerError(info),
        }
    }
}

impl From<BodyError> for ApiError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::TooLarge { limit } => Self::RequestTooBig(Fields::new(format!(
                "The JSON request body exceeds the maximum allowed size of {limit} bytes."
            ))),
            err => Self::InvalidInput(Fields::new(err.to_string())),
        }
    }
}

/// `POST /v1/archives`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateArchive {
    pub path: String,
}

/// An open or just-closed archive. `path` is relative to the archive root.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub id: String,
    pub path: String,
}

impl ArchiveSummary {
    pub fn new(info: &ArchiveInfo, root: &relay_core::ConfinedRoot) -> Self {
        Self {
            id: info.id.to_string(),
            path: root.display(&info.path).to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArchiveList {
    pub archives: Vec<ArchiveSummary>,
}

/// `POST /v1/archives/{id}/fetch`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FetchEntry {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EntrySummary {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProxyList {
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerVersion {
    pub server_version: String,
    pub protocol_version: u32,
}
