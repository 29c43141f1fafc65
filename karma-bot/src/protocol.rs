//! The slice of the IRC line protocol the bot speaks.
//!
//! Inbound lines are classified by [`Inbound::parse`], which is total: any
//! string maps to exactly one variant and short or malformed input becomes
//! [`Inbound::Other`]. Outbound frames are built with [`Outbound`] and
//! encoded with a trailing CRLF.

use std::fmt;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A chat message addressed to a channel or directly to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub target: String,
    pub text: String,
}

impl ChatMessage {
    /// Whether the message was sent to a channel rather than to a user.
    pub fn is_channel_message(&self) -> bool {
        is_channel_name(&self.target)
    }
}

pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keep-alive probe; `token` must be echoed back verbatim in a PONG.
    Probe { token: String },
    Chat(ChatMessage),
    Other,
}

impl Inbound {
    pub fn parse(line: &str) -> Inbound {
        let line = line.trim_end_matches(LINE_ENDINGS);

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(tagged) => match tagged.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix), rest),
                None => return Inbound::Other,
            },
            None => (None, line),
        };

        let rest = rest.trim_start_matches(' ');
        let (command, params) = rest.split_once(' ').unwrap_or((rest, ""));
        let params = params.trim_start_matches(' ');

        match command {
            "PING" => parse_probe(params),
            "PRIVMSG" => prefix
                .and_then(|prefix| parse_privmsg(prefix, params))
                .map_or(Inbound::Other, Inbound::Chat),
            _ => Inbound::Other,
        }
    }
}

fn parse_probe(params: &str) -> Inbound {
    let token = params.trim_end();
    if token.is_empty() {
        return Inbound::Other;
    }
    Inbound::Probe {
        token: token.to_string(),
    }
}

fn parse_privmsg(prefix: &str, params: &str) -> Option<ChatMessage> {
    let sender = prefix.split(['!', '@']).next().unwrap_or_default();
    let (target, trailing) = params.split_once(' ')?;
    let trailing = trailing.trim_start_matches(' ');

    // A trailing parameter without a colon can only be a single word.
    let text = match trailing.strip_prefix(':') {
        Some(text) => text,
        None => trailing.split(' ').next().unwrap_or_default(),
    };

    if sender.is_empty() || target.is_empty() || text.trim().is_empty() {
        return None;
    }

    Some(ChatMessage {
        sender: sender.to_string(),
        target: target.to_string(),
        text: text.to_string(),
    })
}

/// Frames the bot writes to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    User { username: String },
    Nick { nickname: String },
    Join { channel: String },
    Privmsg { target: String, text: String },
    Pong { token: String },
    Quit { reason: String },
}

impl Outbound {
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Outbound::Privmsg {
            target: target.into(),
            text: text.into(),
        }
    }

    /// Wire form of the frame, terminated by CRLF.
    pub fn encode(&self) -> String {
        let mut line = sanitize(&self.to_string());
        line.push_str("\r\n");
        line
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::User { username } => write!(f, "USER {username} 8 * :{username}"),
            Outbound::Nick { nickname } => write!(f, "NICK {nickname}"),
            Outbound::Join { channel } => write!(f, "JOIN {channel}"),
            Outbound::Privmsg { target, text } => write!(f, "PRIVMSG {target} :{text}"),
            Outbound::Pong { token } => write!(f, "PONG {token}"),
            Outbound::Quit { reason } => write!(f, "QUIT :{reason}"),
        }
    }
}

// Line breaks inside a frame would let chat text inject extra commands.
fn sanitize(line: &str) -> String {
    line.replace(LINE_ENDINGS, " ")
}
