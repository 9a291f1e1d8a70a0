//! The command record written into the replicated log.

use serde::{Deserialize, Serialize};

use crate::WireResult;

/// A state-machine command.
///
/// Exactly one variant is active per record; decoding anything else is an
/// error the state machine surfaces to the submitter rather than a panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Bind `key` to `value`.
    Set {
        /// The key to bind.
        key: String,
        /// The value to bind it to.
        value: String,
    },

    /// Remove the binding for `key`.
    Delete {
        /// The key to unbind.
        key: String,
    },
}

impl Command {
    /// Encodes the command into its on-log representation.
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decodes a command from its on-log representation.
    pub fn decode(data: &[u8]) -> WireResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }

    /// Returns the key this command touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_roundtrip() {
        let cmd = Command::Set {
            key: "key".into(),
            value: "value".into(),
        };
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_delete_roundtrip() {
        let cmd = Command::Delete { key: "key".into() };
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let cmd = Command::Set {
            key: "key".into(),
            value: "value".into(),
        };
        let bytes = cmd.encode().unwrap();
        assert!(Command::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Command::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
