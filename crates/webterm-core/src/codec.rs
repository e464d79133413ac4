//! JSON codec for the webterm WebSocket protocol.
//!
//! Client frames are either a JSON control object or raw keystrokes; there is
//! no explicit framing to tell them apart. A frame that decodes as a JSON
//! object is always a control message, so a user can never type a literal
//! JSON object into the shell.

use crate::error::WebTermResult;
use crate::messages::{ClientMessage, ControlEnvelope, ServerMessage};

/// Opening delimiter of a notification embedded in the output stream.
pub const JSON_OPEN: &str = "\n<JSON>";
/// Closing delimiter of a notification embedded in the output stream.
pub const JSON_CLOSE: &str = "</JSON>\n";

/// Decode a client frame.
///
/// Returns `None` when the frame is not a JSON object with compatible field
/// types, in which case it is raw terminal input.
pub fn decode_client(data: &[u8]) -> Option<ClientMessage> {
    let first = data.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    serde_json::from_slice::<ControlEnvelope>(data)
        .ok()
        .map(ClientMessage::from)
}

/// Encode a server message as a JSON text frame.
pub fn encode_server(msg: &ServerMessage) -> WebTermResult<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Wrap a server message so it can travel inline with raw shell output.
pub fn wrap_inline(msg: &ServerMessage) -> WebTermResult<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let mut out = Vec::with_capacity(JSON_OPEN.len() + json.len() + JSON_CLOSE.len());
    out.extend_from_slice(JSON_OPEN.as_bytes());
    out.extend(json);
    out.extend_from_slice(JSON_CLOSE.as_bytes());
    Ok(out)
}

/// Extract every well-formed inline notification from a chunk of output text.
pub fn parse_inline(text: &str) -> Vec<ServerMessage> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<JSON>") {
        let body = &rest[start + "<JSON>".len()..];
        let Some(end) = body.find("</JSON>") else {
            break;
        };
        if let Ok(msg) = serde_json::from_str::<ServerMessage>(&body[..end]) {
            found.push(msg);
        }
        rest = &body[end + "</JSON>".len()..];
    }
    found
}
