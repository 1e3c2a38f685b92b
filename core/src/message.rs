//! IRC message parsing and handling
//!
//! Client-side subset of the RFC 1459 message format: the verbs the relay
//! sends (NICK, USER, JOIN, PRIVMSG, PONG, QUIT) and everything it needs to
//! understand from server traffic (numerics, PING, JOIN/KICK/PART echoes).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard protocol limit on a line, including the trailing CRLF
pub const MAX_LINE_LEN: usize = 512;

/// IRC message prefix (server or user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl Prefix {
    /// Nickname portion of the prefix, if it is a user prefix
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::User { nick, .. } => Some(nick),
            Prefix::Server(_) => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// IRC commands the relay sends or reacts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Nick,
    User,
    Join,
    Part,
    Kick,
    PrivMsg,
    Notice,
    Ping,
    Pong,
    Quit,
    Error,
    /// Numeric reply from the server (001, 433, 473, ...)
    Reply(u16),
    /// Anything else; carried verbatim and usually ignored
    Custom(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Nick => write!(f, "NICK"),
            Command::User => write!(f, "USER"),
            Command::Join => write!(f, "JOIN"),
            Command::Part => write!(f, "PART"),
            Command::Kick => write!(f, "KICK"),
            Command::PrivMsg => write!(f, "PRIVMSG"),
            Command::Notice => write!(f, "NOTICE"),
            Command::Ping => write!(f, "PING"),
            Command::Pong => write!(f, "PONG"),
            Command::Quit => write!(f, "QUIT"),
            Command::Error => write!(f, "ERROR"),
            Command::Reply(n) => write!(f, "{:03}", n),
            Command::Custom(cmd) => write!(f, "{}", cmd),
        }
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        if s.len() == 3 && s.chars().all(|c| c.is_ascii_digit()) {
            // Always in range for three digits
            return Command::Reply(s.parse().unwrap_or(0));
        }
        match s.to_uppercase().as_str() {
            "NICK" => Command::Nick,
            "USER" => Command::User,
            "JOIN" => Command::Join,
            "PART" => Command::Part,
            "KICK" => Command::Kick,
            "PRIVMSG" => Command::PrivMsg,
            "NOTICE" => Command::Notice,
            "PING" => Command::Ping,
            "PONG" => Command::Pong,
            "QUIT" => Command::Quit,
            "ERROR" => Command::Error,
            _ => Command::Custom(s.to_string()),
        }
    }
}

/// IRC message as defined in RFC 1459
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Optional prefix (server or user)
    pub prefix: Option<Prefix>,
    /// Message command
    pub command: Command,
    /// Message parameters
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message without prefix
    pub fn new(command: Command, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command,
            params,
        }
    }

    /// Parse an IRC message from a line (CRLF already stripped or not)
    pub fn parse(input: &str) -> crate::Result<Self> {
        let input = input.trim_end_matches(['\r', '\n']).trim();
        if input.is_empty() {
            return Err(crate::Error::ProtocolViolation("Empty message".to_string()));
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            let (prefix_str, rest) = stripped
                .split_once(' ')
                .ok_or_else(|| crate::Error::ProtocolViolation("Prefix without command".to_string()))?;
            (Some(Self::parse_prefix(prefix_str)?), rest.trim_start())
        } else {
            (None, input)
        };

        let (command_str, mut rest) = match rest.split_once(' ') {
            Some((cmd, rest)) => (cmd, rest.trim_start()),
            None => (rest, ""),
        };
        if command_str.is_empty() {
            return Err(crate::Error::ProtocolViolation("No command found".to_string()));
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_string());
                    rest = tail.trim_start();
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: Command::from(command_str),
            params,
        })
    }

    fn parse_prefix(prefix_str: &str) -> crate::Result<Prefix> {
        if let Some((nick, user_host)) = prefix_str.split_once('!') {
            let (user, host) = user_host.split_once('@').ok_or_else(|| {
                crate::Error::ProtocolViolation("Invalid user prefix format".to_string())
            })?;
            Ok(Prefix::User {
                nick: nick.to_string(),
                user: user.to_string(),
                host: host.to_string(),
            })
        } else {
            Ok(Prefix::Server(prefix_str.to_string()))
        }
    }

    /// Serialize to a CRLF-terminated wire line, clamped to the protocol limit
    pub fn to_line(&self) -> String {
        let mut result = String::new();

        if let Some(ref prefix) = self.prefix {
            result.push(':');
            result.push_str(&prefix.to_string());
            result.push(' ');
        }

        result.push_str(&self.command.to_string());

        for (i, param) in self.params.iter().enumerate() {
            result.push(' ');
            if i == self.params.len() - 1 && (param.contains(' ') || param.starts_with(':') || param.is_empty()) {
                result.push(':');
            }
            result.push_str(param);
        }

        if result.len() > MAX_LINE_LEN - 2 {
            // Truncate at a char boundary, never send a malformed line
            let mut cut = MAX_LINE_LEN - 2;
            while !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
        }

        result.push_str("\r\n");
        result
    }

    /// First parameter, if any
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line().trim_end())
    }
}

/// Split message text into chunks that each fit a `PRIVMSG <target> :<chunk>`
/// line within the 512-byte limit, preferring word boundaries.
pub fn privmsg_chunks(target: &str, text: &str) -> Vec<String> {
    // "PRIVMSG " + target + " :" + text + "\r\n"
    let budget = MAX_LINE_LEN.saturating_sub(8 + target.len() + 2 + 2).max(1);

    if text.len() <= budget {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split(' ') {
        let needed = if current.is_empty() {
            word.len()
        } else {
            current.len() + 1 + word.len()
        };
        if needed <= budget {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        // A single word longer than the budget is hard-split
        let mut word = word;
        while word.len() > budget {
            let mut cut = budget;
            while !word.is_char_boundary(cut) {
                cut -= 1;
            }
            chunks.push(word[..cut].to_string());
            word = &word[cut..];
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
