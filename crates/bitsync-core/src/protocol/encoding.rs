//! Line encoding of messages.
//!
//! One message per line: a UTF-8 JSON object terminated by `\n`. Decoding
//! classifies failures so the connection can log and skip a bad line
//! instead of tearing down.

use super::message::{Message, COMMANDS};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted line length (8 MiB).
///
/// FILE_BYTES responses carry base64 content, so this bounds the usable
/// block size to roughly 6 MiB.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Message has no command field")]
    MissingCommand,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid fields for {command}: {reason}")]
    InvalidFields { command: String, reason: String },
}

impl Message {
    /// Serialize to one newline-terminated JSON line.
    pub fn encode(&self) -> String {
        // Message contains only strings, integers, bools and vectors of
        // those, so serialization cannot fail.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Parse one line (with or without its trailing newline).
    pub fn decode(line: &str) -> Result<Message, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let command = match value.get("command") {
            Some(Value::String(command)) => command.clone(),
            Some(_) => {
                return Err(ProtocolError::Malformed(
                    "command is not a string".to_string(),
                ));
            }
            None if value.is_object() => return Err(ProtocolError::MissingCommand),
            None => {
                return Err(ProtocolError::Malformed(
                    "message is not a JSON object".to_string(),
                ));
            }
        };

        if !COMMANDS.contains(&command.as_str()) {
            return Err(ProtocolError::UnknownCommand(command));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
            command,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FileMetadata;
    use crate::host_port::HostPort;

    fn meta(size: u64) -> FileMetadata {
        FileMetadata::new("9f86d081884c7d659a2feaa0c55ad015", 1_700_000_000_000, size)
    }

    fn catalogue() -> Vec<Message> {
        let long_path = "a/".repeat(500) + "file.txt";
        vec![
            Message::invalid_protocol(""),
            Message::connection_refused(vec![]),
            Message::connection_refused(vec![
                HostPort::new("10.0.0.1", 8111),
                HostPort::new("peer.example", 1),
            ]),
            Message::HandshakeRequest {
                host_port: HostPort::new("localhost", 8111),
            },
            Message::HandshakeResponse {
                host_port: HostPort::new("", 0),
            },
            Message::DirectoryCreateRequest {
                path_name: String::new(),
            },
            Message::DirectoryCreateResponse {
                path_name: long_path.clone(),
                message: "directory created".into(),
                status: true,
            },
            Message::DirectoryDeleteRequest {
                path_name: "docs".into(),
            },
            Message::DirectoryDeleteResponse {
                path_name: "docs".into(),
                message: "pathname does not exist".into(),
                status: false,
            },
            Message::FileCreateRequest {
                file_descriptor: meta(0),
                path_name: "empty.txt".into(),
            },
            Message::FileCreateResponse {
                file_descriptor: meta(0),
                path_name: long_path.clone(),
                message: "file loader ready".into(),
                status: true,
            },
            Message::FileModifyRequest {
                file_descriptor: meta(12),
                path_name: "notes/ünïcode.md".into(),
            },
            Message::FileModifyResponse {
                file_descriptor: meta(12),
                path_name: "notes/a.md".into(),
                message: "local version is newer".into(),
                status: false,
            },
            Message::FileDeleteRequest {
                file_descriptor: meta(3),
                path_name: "a".into(),
            },
            Message::FileDeleteResponse {
                file_descriptor: meta(3),
                path_name: "a".into(),
                message: "file deleted".into(),
                status: true,
            },
            Message::FileBytesRequest {
                file_descriptor: meta(u64::MAX),
                path_name: "big.bin".into(),
                position: 1 << 40,
                length: 1 << 20,
            },
            Message::FileBytesResponse {
                file_descriptor: meta(5),
                path_name: "a".into(),
                position: 0,
                length: 5,
                content: "aGVsbG8=".into(),
                message: "successful read".into(),
                status: true,
            },
        ]
    }

    // ==================== Round trip ====================

    #[test]
    fn test_round_trip_catalogue() {
        for msg in catalogue() {
            let line = msg.encode();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "one line per message");
            assert_eq!(Message::decode(&line).unwrap(), msg);
        }
    }

    #[test]
    fn test_encoded_field_names() {
        let line = Message::FileBytesRequest {
            file_descriptor: meta(5),
            path_name: "a".into(),
            position: 0,
            length: 5,
        }
        .encode();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["command"], "FILE_BYTES_REQUEST");
        assert_eq!(value["pathName"], "a");
        assert_eq!(value["fileDescriptor"]["fileSize"], 5);
        assert_eq!(value["position"], 0);

        let line = Message::HandshakeRequest {
            host_port: HostPort::new("h", 1),
        }
        .encode();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["hostPort"]["host"], "h");
    }

    #[test]
    fn test_decode_accepts_extra_fields() {
        let line = r#"{"command":"DIRECTORY_CREATE_REQUEST","pathName":"d","extra":1}"#;
        assert_eq!(
            Message::decode(line).unwrap(),
            Message::DirectoryCreateRequest {
                path_name: "d".into()
            }
        );
    }

    // ==================== Errors ====================

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            Message::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode("[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"command":5}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_command() {
        assert_eq!(
            Message::decode(r#"{"pathName":"a"}"#),
            Err(ProtocolError::MissingCommand)
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        assert_eq!(
            Message::decode(r#"{"command":"GOSSIP"}"#),
            Err(ProtocolError::UnknownCommand("GOSSIP".into()))
        );
    }

    #[test]
    fn test_decode_invalid_fields() {
        let err = Message::decode(r#"{"command":"FILE_CREATE_REQUEST","pathName":"a"}"#)
            .unwrap_err();
        match err {
            ProtocolError::InvalidFields { command, .. } => {
                assert_eq!(command, "FILE_CREATE_REQUEST")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
