//! Versioned JSON wire format for commands.
//!
//! The document is `{version, id, kind, args, kwargs, orig, result, spammy,
//! in_reply_to}`. Decoding is total over well-formed documents: a kind this
//! build does not know comes back as [`Decoded::Unknown`] instead of an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::{Command, CommandId, CommandKind, CommandPayload};
use crate::error::{WireError, WireResult};

/// Version stamped on every encoded command.
pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct WireCommand {
    version: u32,
    id: CommandId,
    kind: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Value,
    #[serde(default)]
    orig: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default)]
    spammy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<CommandId>,
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A command this build knows how to handle.
    Known(Command),
    /// A well-formed command of a kind introduced by a newer peer.
    Unknown {
        /// Command id.
        id: CommandId,
        /// Kind named on the wire.
        kind: String,
    },
}

/// Encode `command` into a frame body.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if the payload cannot be serialized.
pub fn encode(command: &Command) -> WireResult<Vec<u8>> {
    let encode_err = |source| WireError::Encode { source };
    let mut tagged = match serde_json::to_value(&command.payload).map_err(encode_err)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let wire = WireCommand {
        version: WIRE_VERSION,
        id: command.id,
        kind: command.kind().as_str().to_string(),
        args: command.args.clone(),
        kwargs: tagged.remove("kwargs").unwrap_or(Value::Null),
        orig: command.originated_here,
        result: command.result.clone(),
        spammy: command.spammy,
        in_reply_to: command.in_reply_to,
    };
    serde_json::to_vec(&wire).map_err(encode_err)
}

/// Decode a frame body. The result always has `originated_here == false`.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] when the bytes are not a command document
/// and [`WireError::Payload`] when a known kind carries mismatched arguments.
pub fn decode(bytes: &[u8]) -> WireResult<Decoded> {
    let wire: WireCommand =
        serde_json::from_slice(bytes).map_err(|source| WireError::Malformed { source })?;
    if wire.version != WIRE_VERSION {
        tracing::debug!(
            version = wire.version,
            expected = WIRE_VERSION,
            "decoding command from a different wire version"
        );
    }
    let Ok(kind) = wire.kind.parse::<CommandKind>() else {
        return Ok(Decoded::Unknown {
            id: wire.id,
            kind: wire.kind,
        });
    };

    let mut tagged = Map::new();
    tagged.insert("kind".to_string(), Value::String(kind.as_str().to_string()));
    if !wire.kwargs.is_null() {
        tagged.insert("kwargs".to_string(), wire.kwargs);
    }
    let payload: CommandPayload =
        serde_json::from_value(Value::Object(tagged)).map_err(|source| WireError::Payload {
            kind: wire.kind,
            source,
        })?;

    Ok(Decoded::Known(Command {
        id: wire.id,
        payload,
        args: wire.args,
        originated_here: false,
        result: wire.result,
        spammy: wire.spammy,
        in_reply_to: wire.in_reply_to,
    }))
}
