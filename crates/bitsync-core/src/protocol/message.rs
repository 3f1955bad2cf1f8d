//! The message catalogue.
//!
//! Every message is one JSON object whose `command` field selects the
//! variant. Field names match the BitBox wire format
//! (`pathName`, `fileDescriptor`, `hostPort`, ...).

use crate::descriptor::FileMetadata;
use crate::host_port::HostPort;
use serde::{Deserialize, Serialize};

/// All command tags, in catalogue order.
pub const COMMANDS: &[&str] = &[
    "INVALID_PROTOCOL",
    "CONNECTION_REFUSED",
    "HANDSHAKE_REQUEST",
    "HANDSHAKE_RESPONSE",
    "DIRECTORY_CREATE_REQUEST",
    "DIRECTORY_CREATE_RESPONSE",
    "DIRECTORY_DELETE_REQUEST",
    "DIRECTORY_DELETE_RESPONSE",
    "FILE_CREATE_REQUEST",
    "FILE_CREATE_RESPONSE",
    "FILE_MODIFY_REQUEST",
    "FILE_MODIFY_RESPONSE",
    "FILE_DELETE_REQUEST",
    "FILE_DELETE_RESPONSE",
    "FILE_BYTES_REQUEST",
    "FILE_BYTES_RESPONSE",
];

/// One protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// Sent before giving up on a peer that broke the protocol.
    InvalidProtocol { message: String },

    /// Admission refused; lists the peers we are connected to so the
    /// dialer can try them instead.
    ConnectionRefused {
        message: String,
        peers: Vec<HostPort>,
    },

    HandshakeRequest { host_port: HostPort },
    HandshakeResponse { host_port: HostPort },

    DirectoryCreateRequest { path_name: String },
    DirectoryCreateResponse {
        path_name: String,
        message: String,
        status: bool,
    },

    DirectoryDeleteRequest { path_name: String },
    DirectoryDeleteResponse {
        path_name: String,
        message: String,
        status: bool,
    },

    FileCreateRequest {
        file_descriptor: FileMetadata,
        path_name: String,
    },
    FileCreateResponse {
        file_descriptor: FileMetadata,
        path_name: String,
        message: String,
        status: bool,
    },

    FileModifyRequest {
        file_descriptor: FileMetadata,
        path_name: String,
    },
    FileModifyResponse {
        file_descriptor: FileMetadata,
        path_name: String,
        message: String,
        status: bool,
    },

    FileDeleteRequest {
        file_descriptor: FileMetadata,
        path_name: String,
    },
    FileDeleteResponse {
        file_descriptor: FileMetadata,
        path_name: String,
        message: String,
        status: bool,
    },

    FileBytesRequest {
        file_descriptor: FileMetadata,
        path_name: String,
        position: u64,
        length: u64,
    },
    FileBytesResponse {
        file_descriptor: FileMetadata,
        path_name: String,
        position: u64,
        length: u64,
        /// Base64 of the requested range (empty on failure)
        content: String,
        message: String,
        status: bool,
    },
}

impl Message {
    /// The `command` tag of this message.
    pub fn command(&self) -> &'static str {
        match self {
            Message::InvalidProtocol { .. } => "INVALID_PROTOCOL",
            Message::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            Message::HandshakeRequest { .. } => "HANDSHAKE_REQUEST",
            Message::HandshakeResponse { .. } => "HANDSHAKE_RESPONSE",
            Message::DirectoryCreateRequest { .. } => "DIRECTORY_CREATE_REQUEST",
            Message::DirectoryCreateResponse { .. } => "DIRECTORY_CREATE_RESPONSE",
            Message::DirectoryDeleteRequest { .. } => "DIRECTORY_DELETE_REQUEST",
            Message::DirectoryDeleteResponse { .. } => "DIRECTORY_DELETE_RESPONSE",
            Message::FileCreateRequest { .. } => "FILE_CREATE_REQUEST",
            Message::FileCreateResponse { .. } => "FILE_CREATE_RESPONSE",
            Message::FileModifyRequest { .. } => "FILE_MODIFY_REQUEST",
            Message::FileModifyResponse { .. } => "FILE_MODIFY_RESPONSE",
            Message::FileDeleteRequest { .. } => "FILE_DELETE_REQUEST",
            Message::FileDeleteResponse { .. } => "FILE_DELETE_RESPONSE",
            Message::FileBytesRequest { .. } => "FILE_BYTES_REQUEST",
            Message::FileBytesResponse { .. } => "FILE_BYTES_RESPONSE",
        }
    }

    pub fn is_request(&self) -> bool {
        self.command().ends_with("_REQUEST")
    }

    pub fn is_response(&self) -> bool {
        self.command().ends_with("_RESPONSE")
    }

    /// True for the messages allowed before a peer is activated.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::HandshakeRequest { .. }
                | Message::HandshakeResponse { .. }
                | Message::ConnectionRefused { .. }
                | Message::InvalidProtocol { .. }
        )
    }

    /// Path this message is about, if any.
    pub fn path_name(&self) -> Option<&str> {
        match self {
            Message::DirectoryCreateRequest { path_name }
            | Message::DirectoryCreateResponse { path_name, .. }
            | Message::DirectoryDeleteRequest { path_name }
            | Message::DirectoryDeleteResponse { path_name, .. }
            | Message::FileCreateRequest { path_name, .. }
            | Message::FileCreateResponse { path_name, .. }
            | Message::FileModifyRequest { path_name, .. }
            | Message::FileModifyResponse { path_name, .. }
            | Message::FileDeleteRequest { path_name, .. }
            | Message::FileDeleteResponse { path_name, .. }
            | Message::FileBytesRequest { path_name, .. }
            | Message::FileBytesResponse { path_name, .. } => Some(path_name),
            _ => None,
        }
    }

    /// `(status, message)` of a response.
    pub fn outcome(&self) -> Option<(bool, &str)> {
        match self {
            Message::DirectoryCreateResponse {
                status, message, ..
            }
            | Message::DirectoryDeleteResponse {
                status, message, ..
            }
            | Message::FileCreateResponse {
                status, message, ..
            }
            | Message::FileModifyResponse {
                status, message, ..
            }
            | Message::FileDeleteResponse {
                status, message, ..
            }
            | Message::FileBytesResponse {
                status, message, ..
            } => Some((*status, message.as_str())),
            _ => None,
        }
    }

    /// Key shared by a request and the response it produces.
    ///
    /// `None` for messages that are neither (refusals, protocol errors).
    pub fn correlation_key(&self) -> Option<String> {
        let key = match self {
            Message::HandshakeRequest { .. } | Message::HandshakeResponse { .. } => {
                "HANDSHAKE".to_string()
            }
            Message::DirectoryCreateRequest { path_name }
            | Message::DirectoryCreateResponse { path_name, .. } => {
                format!("DIRECTORY_CREATE:{}", path_name)
            }
            Message::DirectoryDeleteRequest { path_name }
            | Message::DirectoryDeleteResponse { path_name, .. } => {
                format!("DIRECTORY_DELETE:{}", path_name)
            }
            Message::FileCreateRequest {
                file_descriptor,
                path_name,
            }
            | Message::FileCreateResponse {
                file_descriptor,
                path_name,
                ..
            } => format!("FILE_CREATE:{}:{}", path_name, file_descriptor.hash),
            Message::FileModifyRequest {
                file_descriptor,
                path_name,
            }
            | Message::FileModifyResponse {
                file_descriptor,
                path_name,
                ..
            } => format!("FILE_MODIFY:{}:{}", path_name, file_descriptor.hash),
            Message::FileDeleteRequest {
                file_descriptor,
                path_name,
            }
            | Message::FileDeleteResponse {
                file_descriptor,
                path_name,
                ..
            } => format!("FILE_DELETE:{}:{}", path_name, file_descriptor.hash),
            Message::FileBytesRequest {
                file_descriptor,
                path_name,
                position,
                ..
            }
            | Message::FileBytesResponse {
                file_descriptor,
                path_name,
                position,
                ..
            } => format!(
                "FILE_BYTES:{}:{}:{}",
                path_name, file_descriptor.hash, position
            ),
            Message::InvalidProtocol { .. } | Message::ConnectionRefused { .. } => return None,
        };
        Some(key)
    }

    // ==================== Constructors ====================

    pub fn invalid_protocol(message: impl Into<String>) -> Self {
        Message::InvalidProtocol {
            message: message.into(),
        }
    }

    pub fn connection_refused(peers: Vec<HostPort>) -> Self {
        Message::ConnectionRefused {
            message: "connection limit reached".to_string(),
            peers,
        }
    }
}
