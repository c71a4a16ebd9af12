//! JSON messages sent by browser terminals (xterm.js style).
//!
//! ```text
//! {"action":"init","type":"xterm-256color","cols":120,"rows":40}
//! {"action":"read","data":"ls\r"}
//! {"action":"resize","cols":100,"rows":30}
//! ```

use serde::{Deserialize, Serialize};

use crate::Window;

/// A message from the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Capabilities reported once after connecting.
    Init {
        /// Terminal type, e.g. `xterm-256color`.
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        term: Option<String>,
        /// Columns.
        #[serde(default)]
        cols: u32,
        /// Rows.
        #[serde(default)]
        rows: u32,
    },
    /// Keyboard input.
    Read {
        /// Typed text.
        data: String,
    },
    /// Terminal resized.
    Resize {
        /// Columns.
        cols: u32,
        /// Rows.
        rows: u32,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed frames or unknown actions.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Window size carried by the message, if any.
    pub fn window(&self) -> Option<Window> {
        match self {
            ClientMessage::Init { cols, rows, .. } | ClientMessage::Resize { cols, rows } => {
                Some(Window::new(*cols, *rows))
            }
            ClientMessage::Read { .. } => None,
        }
    }
}
