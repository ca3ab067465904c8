//! Network service boundary.
//!
//! The comm manager speaks typed CIP requests; encoding them onto the wire
//! is the transport's job. Implementations must be shareable across tasks.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::domain::{ConnectionType, TransportError, TriggerType};
use crate::layout::ConnectionParams;
use crate::plan::{AttributePath, ServiceCode};

/// CIP general status: success.
pub const STATUS_SUCCESS: u8 = 0x00;
/// CIP general status: connection failure.
pub const STATUS_CONNECTION_FAILURE: u8 = 0x01;
/// CIP general status: path destination unknown.
pub const STATUS_PATH_UNKNOWN: u8 = 0x05;
/// CIP general status: partial transfer.
pub const STATUS_PARTIAL_TRANSFER: u8 = 0x06;
/// CIP general status: attribute not settable.
pub const STATUS_NOT_SETTABLE: u8 = 0x0E;
/// CIP general status: attribute not supported.
pub const STATUS_ATTRIBUTE_UNSUPPORTED: u8 = 0x14;

/// Forward Open service code.
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
/// Forward Close service code.
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;

pub fn status_name(status: u8) -> &'static str {
    match status {
        STATUS_SUCCESS => "success",
        STATUS_CONNECTION_FAILURE => "connection failure",
        STATUS_PATH_UNKNOWN => "path destination unknown",
        STATUS_PARTIAL_TRANSFER => "partial transfer",
        0x08 => "service not supported",
        STATUS_NOT_SETTABLE => "attribute not settable",
        0x13 => "not enough data",
        STATUS_ATTRIBUTE_UNSUPPORTED => "attribute not supported",
        0x15 => "too much data",
        _ => "vendor specific",
    }
}

/// Logical channel a request travels on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "connection", rename_all = "snake_case")]
pub enum ChannelId {
    /// Session carrying unconnected explicit messages.
    Explicit,
    /// Implicit I/O for one named connection.
    Io(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Explicit => f.write_str("explicit"),
            ChannelId::Io(name) => write!(f, "io:{name}"),
        }
    }
}

/// A typed CIP request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum CipRequest {
    ForwardOpen {
        connection: String,
        rpi: Duration,
        connection_type: ConnectionType,
        trigger: TriggerType,
        params: Option<ConnectionParams>,
    },
    ForwardClose {
        connection: String,
    },
    IoData {
        connection: String,
        sequence: u16,
        payload: Vec<u8>,
    },
    Service {
        service: ServiceCode,
        path: AttributePath,
        payload: Vec<u8>,
    },
}

impl CipRequest {
    pub fn service_code(&self) -> Option<u8> {
        match self {
            CipRequest::ForwardOpen { .. } => Some(SERVICE_FORWARD_OPEN),
            CipRequest::ForwardClose { .. } => Some(SERVICE_FORWARD_CLOSE),
            CipRequest::IoData { .. } => None,
            CipRequest::Service { service, .. } => Some(service.code()),
        }
    }
}

/// Response to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CipResponse {
    pub general_status: u8,
    pub payload: Vec<u8>,
}

impl CipResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            general_status: STATUS_SUCCESS,
            payload,
        }
    }

    pub fn status(general_status: u8) -> Self {
        Self {
            general_status,
            payload: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.general_status == STATUS_SUCCESS
    }
}

/// Network service used by the comm manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a logical channel.
    async fn open(&self, channel: &ChannelId) -> Result<(), TransportError>;

    /// Send a request and wait for its response.
    ///
    /// Callers bound the wait with their own timeout; an implementation may
    /// also report [`TransportError::Timeout`] itself.
    async fn send(
        &self,
        channel: &ChannelId,
        request: &CipRequest,
    ) -> Result<CipResponse, TransportError>;

    /// Close a logical channel.
    async fn close(&self, channel: &ChannelId) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ObjectRef;

    #[test]
    fn test_service_codes() {
        let get = CipRequest::Service {
            service: ServiceCode::GetAttributeSingle,
            path: AttributePath {
                object: ObjectRef::new(4, 1),
                attribute: 3,
            },
            payload: vec![],
        };
        assert_eq!(get.service_code(), Some(0x0E));
        let close = CipRequest::ForwardClose {
            connection: "io".into(),
        };
        assert_eq!(close.service_code(), Some(0x4E));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(0), "success");
        assert_eq!(status_name(0x14), "attribute not supported");
        assert_eq!(status_name(0xD0), "vendor specific");
        assert!(CipResponse::ok(vec![]).is_success());
        assert!(!CipResponse::status(STATUS_PATH_UNKNOWN).is_success());
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(ChannelId::Explicit.to_string(), "explicit");
        assert_eq!(ChannelId::Io("a".into()).to_string(), "io:a");
    }
}
