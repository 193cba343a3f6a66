// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Every error that can cross the control plane carries a stable string
//! code so scripted clients can dispatch without parsing messages. The
//! enums here are the single source of truth for those codes.

use thiserror::Error;

use crate::session::{Capability, Protocol};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("parse error at offset {offset}: unexpected {token}")]
    Parse { offset: usize, token: String },
    #[error("no such table '{0}'")]
    UnknownTable(String),
    #[error("table '{name}' is not available for {protocol} sessions")]
    NotAvailableForProtocol { name: String, protocol: Protocol },
    #[error("no such column '{column}' in '{table}'")]
    UnknownColumn { column: String, table: String },
    #[error("table '{table}' requires a '{column} = <value>' filter")]
    RequiredFilter { table: String, column: String },
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Parse { .. } => "ErrParse",
            QueryError::UnknownTable(_) => "ErrUnknownTable",
            QueryError::NotAvailableForProtocol { .. } => "ErrTableNotAvailableForProtocol",
            QueryError::UnknownColumn { .. } => "ErrUnknownColumn",
            QueryError::RequiredFilter { .. } => "ErrRequiredFilter",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NdapError {
    #[error("debug adapter transport is closed")]
    TransportClosed,
    #[error("debug adapter exited; stderr: {stderr_tail}")]
    ProcessExited { stderr_tail: String },
    #[error("request '{command}' timed out after {timeout_ms}ms")]
    RequestTimeout { command: String, timeout_ms: u64 },
    #[error("request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },
    #[error("invalid Content-Length header: '{0}'")]
    ProtocolHeaderInvalid(String),
    #[error("too many outstanding debug adapter requests")]
    Backpressure,
}

impl NdapError {
    pub fn code(&self) -> &'static str {
        match self {
            NdapError::TransportClosed => "DAP_TRANSPORT_CLOSED",
            NdapError::ProcessExited { .. } => "DAP_PROCESS_EXITED",
            NdapError::RequestTimeout { .. } => "DAP_REQUEST_TIMEOUT",
            NdapError::RequestFailed { .. } => "DAP_REQUEST_FAILED",
            NdapError::ProtocolHeaderInvalid(_) => "DAP_PROTOCOL_HEADER_INVALID",
            NdapError::Backpressure => "DAP_TRANSPORT_BACKPRESSURE",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BwpError {
    #[error("could not parse /json discovery response: {0}")]
    DiscoveryParse(String),
    #[error("nothing listening on {host}:{port}")]
    Unreachable { host: String, port: u16 },
    #[error("discovery request to {host}:{port} timed out")]
    DiscoveryTimeout { host: String, port: u16 },
    #[error("no debug target of type '{0}'")]
    NoTargetOfType(String),
    #[error("devtools transport is closed")]
    TransportClosed,
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },
    #[error("request '{method}' failed: {message}")]
    RequestFailed { method: String, message: String },
    #[error("too many outstanding devtools requests")]
    Backpressure,
}

impl BwpError {
    pub fn code(&self) -> &'static str {
        match self {
            BwpError::DiscoveryParse(_) => "ErrDiscoveryParse",
            BwpError::Unreachable { .. } => "ErrUnreachable",
            BwpError::DiscoveryTimeout { .. } => "ErrDiscoveryTimeout",
            BwpError::NoTargetOfType(_) => "ErrNoTargetOfType",
            BwpError::TransportClosed => "BWP_TRANSPORT_CLOSED",
            BwpError::RequestTimeout { .. } => "BWP_REQUEST_TIMEOUT",
            BwpError::RequestFailed { .. } => "BWP_REQUEST_FAILED",
            BwpError::Backpressure => "BWP_TRANSPORT_BACKPRESSURE",
        }
    }
}

/// A failure from whichever wire a session speaks. Virtual tables and
/// command handlers treat the two transports uniformly through this
/// wrapper.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error(transparent)]
    Ndap(#[from] NdapError),
    #[error(transparent)]
    Bwp(#[from] BwpError),
}

impl WireError {
    pub fn code(&self) -> &'static str {
        match self {
            WireError::Ndap(e) => e.code(),
            WireError::Bwp(e) => e.code(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    Exists(String),
    #[error("no session named '{0}'")]
    Unknown(String),
    #[error("no current session")]
    NoCurrent,
    #[error("session does not support {}", .0.name())]
    CapabilityUnsupported(Capability),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Exists(_) => "ErrSessionExists",
            SessionError::Unknown(_) | SessionError::NoCurrent => "ErrSessionUnknown",
            SessionError::CapabilityUnsupported(_) => "ErrCapabilityUnsupported",
        }
    }
}

/// Errors from the native attach state machine. The codes here are
/// snake_case because they are shared with external device providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttachError {
    #[error("invalid attach request: {0}")]
    InvalidRequest(String),
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("app '{0}' is not installed")]
    AppNotInstalled(String),
    #[error("process {0} is not running")]
    ProcessNotRunning(i64),
    #[error("attach denied or timed out during {stage}")]
    DeniedOrTimeout { stage: String },
    #[error("lldb debug adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("device provider error: {0}")]
    Provider(String),
}

impl AttachError {
    pub fn code(&self) -> &'static str {
        match self {
            AttachError::InvalidRequest(_) => "invalid_request",
            AttachError::DeviceNotFound(_) => "device_not_found",
            AttachError::AppNotInstalled(_) => "app_not_installed",
            AttachError::ProcessNotRunning(_) => "process_not_running",
            AttachError::DeniedOrTimeout { .. } => "attach_denied_or_timeout",
            AttachError::AdapterUnavailable(_) => "lldb_dap_unavailable",
            AttachError::Provider(_) => "provider_error",
        }
    }

    /// The handshake stage the attach failed in, when that is known.
    pub fn phase(&self) -> Option<&str> {
        match self {
            AttachError::DeniedOrTimeout { stage } => Some(stage.as_str()),
            _ => None,
        }
    }
}
