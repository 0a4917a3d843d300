//! Replicated command format.
//!
//! A [`Command`] is encoded exactly once, on the leader that accepted the
//! client write. The resulting bytes are what travels through the Raft log;
//! every replica decodes those same bytes, so the codec must be
//! deterministic and strict.
//!
//! Wire layout: one format version byte followed by the bincode (standard
//! config) encoding of the command.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current command wire format version.
pub const CODEC_VERSION: u8 = 1;

/// Kind of mutation carried by a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

/// A single key mutation replicated through the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub operation: Operation,
    pub key: String,
    /// Unused (empty) for deletes.
    pub value: String,
}

impl Command {
    /// Create a put command.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            operation: Operation::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a delete command.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            value: String::new(),
        }
    }

    /// Encode this command into its replicated byte form.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode(self)
    }

    /// Decode a command from its replicated byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode(bytes)
    }
}

/// Response produced when a command is applied to the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// A put was applied; `replaced` is true if the key already existed.
    Put { replaced: bool },

    /// A delete was applied; `existed` is false for deletes of absent keys.
    Delete { existed: bool },

    /// A log entry that carries no command (blank or membership).
    Noop,
}

/// Failure to encode a command.
#[derive(Debug, Error)]
#[error("failed to encode command: {0}")]
pub struct EncodeError(#[from] bincode::error::EncodeError);

/// Failure to decode a replicated payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty command payload")]
    Empty,

    #[error("unsupported command format version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed command payload: {0}")]
    Malformed(#[from] bincode::error::DecodeError),

    #[error("{0} trailing bytes after command payload")]
    TrailingBytes(usize),
}

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Encode a command into `[version][bincode body]`.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, EncodeError> {
    let body = bincode::serde::encode_to_vec(cmd, config())?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Command, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != CODEC_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let (cmd, read): (Command, usize) = bincode::serde::decode_from_slice(body, config())?;
    if read != body.len() {
        return Err(DecodeError::TrailingBytes(body.len() - read));
    }
    Ok(cmd)
}
