//! Inbound notification decoding and validation
//!
//! Submitters (git hooks, CI) send newline-delimited JSON objects:
//! `{"to": <uri or array of uris>, "privmsg": "text", "nick": "override"}`.

use crate::{Error, Result, Target};
use serde::Deserialize;

/// Raw wire form of a notification, before validation
#[derive(Debug, Deserialize)]
struct WireNotification {
    to: ToField,
    privmsg: String,
    #[serde(default)]
    nick: Option<String>,
}

/// The `to` field accepts a single URI string or an array of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToField {
    One(String),
    Many(Vec<String>),
}

impl ToField {
    fn into_uris(self) -> Vec<String> {
        match self {
            ToField::One(uri) => vec![uri],
            ToField::Many(uris) => uris,
        }
    }
}

/// A validated notification ready for dispatch
#[derive(Debug, Clone)]
pub struct Notification {
    /// Destinations, in submission order
    pub targets: Vec<Target>,
    /// Message body
    pub text: String,
    /// Optional nickname override for connections created by this send
    pub nick_hint: Option<String>,
}

impl Notification {
    /// Decode and validate one JSON line
    pub fn from_json_line(line: &str) -> Result<Self> {
        let wire: WireNotification = serde_json::from_str(line)
            .map_err(|e| Error::MalformedInput(format!("Invalid notification JSON: {}", e)))?;

        let uris = wire.to.into_uris();
        if uris.is_empty() {
            return Err(Error::MalformedInput(
                "Notification has empty target list".to_string(),
            ));
        }

        let targets = uris
            .iter()
            .map(|uri| Target::parse(uri))
            .collect::<Result<Vec<_>>>()?;

        // Strip CR/LF so the body can never smuggle extra protocol lines
        let text: String = wire
            .privmsg
            .chars()
            .filter(|c| *c != '\r' && *c != '\n')
            .collect();
        if text.is_empty() {
            return Err(Error::MalformedInput(
                "Notification has empty message text".to_string(),
            ));
        }

        let nick_hint = wire.nick.filter(|nick| !nick.is_empty());

        Ok(Notification {
            targets,
            text,
            nick_hint,
        })
    }
}
