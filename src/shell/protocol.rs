//! JSON control frames exchanged on a shell socket.
//!
//! Terminal output travels as binary frames; everything else is a text frame
//! carrying one of the messages below.

use serde::{Deserialize, Serialize};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Stdin { data: String },
    Resize { rows: u16, cols: u16 },
    /// The tab was closed; kill the shell instead of detaching.
    Close,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { resumed: bool },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Serializing a plain enum of bools cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
