//! Command grammar and the replies it produces.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tracing::{debug, error, info, warn};

use crate::{
    VERSION,
    config::SessionConfig,
    error::Result,
    protocol::ChatMessage,
    store::{KarmaEntry, KarmaStore},
    transport::SessionWriter,
};

/// Number of entries listed by `topten` and `bottomten`.
pub const RANKING_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Version,
    Query(Vec<String>),
    TopTen,
    BottomTen,
    Increment(String),
    Decrement(String),
}

impl Command {
    /// Interprets a chat body.
    ///
    /// A body whose first word is the bot's nickname is a directed command;
    /// anything else is only interesting when it ends in `++` or `--`.
    pub fn parse(nickname: &str, text: &str) -> Option<Command> {
        let mut words = text.split_whitespace();
        let first = words.next()?;

        if addresses(nickname, first) {
            return match words.next()? {
                "help" => Some(Command::Help),
                "version" => Some(Command::Version),
                "query" => Some(Command::Query(words.map(str::to_string).collect())),
                "topten" => Some(Command::TopTen),
                "bottomten" => Some(Command::BottomTen),
                _ => None,
            };
        }

        let text = text.trim_end();
        let increment = if text.ends_with("++") {
            true
        } else if text.ends_with("--") {
            false
        } else {
            return None;
        };

        let handle = text.split_whitespace().last()?.trim_matches([':', '+', '-']);
        if handle.is_empty() {
            return None;
        }

        let handle = handle.to_string();
        Some(if increment {
            Command::Increment(handle)
        } else {
            Command::Decrement(handle)
        })
    }
}

// Accepts the usual "nick: ..." and "nick, ..." addressing forms too.
fn addresses(nickname: &str, word: &str) -> bool {
    word.trim_end_matches([':', ',']).eq_ignore_ascii_case(nickname)
}

/// Executes commands against the store and sends the replies.
pub struct Dispatcher<W> {
    config: Arc<SessionConfig>,
    store: Arc<KarmaStore>,
    writer: SessionWriter<W>,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(config: Arc<SessionConfig>, store: Arc<KarmaStore>, writer: SessionWriter<W>) -> Self {
        Self {
            config,
            store,
            writer,
        }
    }

    /// Runs the command carried by `message`, if any, and returns its replies.
    ///
    /// Mutations are on disk by the time this resolves. Only a failure to
    /// persist the store is returned; the session must end on it.
    pub async fn respond(&self, message: &ChatMessage) -> Result<Vec<String>> {
        if message.sender.eq_ignore_ascii_case(&self.config.nickname) {
            return Ok(Vec::new());
        }

        let Some(command) = Command::parse(&self.config.nickname, &message.text) else {
            return Ok(Vec::new());
        };
        debug!(sender = %message.sender, ?command, "dispatching");

        self.execute(&command).await
    }

    /// Sends `replies` to wherever `message` should be answered.
    ///
    /// Replies that cannot be delivered are logged and dropped.
    pub async fn deliver(&self, message: &ChatMessage, replies: Vec<String>) {
        let target = reply_target(message);
        for reply in replies {
            info!(%target, %reply, "reply");
            if let Err(error) = self.writer.privmsg(target, &reply).await {
                warn!(%target, %error, "failed to deliver reply");
            }
        }
    }

    /// Runs `command` and returns the reply lines, in order.
    pub async fn execute(&self, command: &Command) -> Result<Vec<String>> {
        let nickname = &self.config.nickname;
        let replies = match command {
            Command::Help => vec![
                format!(
                    "{nickname} commands available: \"help\", \"version\", \"query <handle> ...\", \"topten\", \"bottomten\"."
                ),
                "Karma can be incremented idiomatically: \"foo++\" and \"bar--\".".to_string(),
            ],
            Command::Version => vec![format!("{nickname} version {VERSION}.")],
            Command::Query(handles) => handles
                .iter()
                .map(|handle| standing(handle, self.store.query(handle)))
                .collect(),
            Command::TopTen => ranking(self.store.top(RANKING_SIZE)),
            Command::BottomTen => ranking(self.store.bottom(RANKING_SIZE)),
            Command::Increment(handle) => vec![self.mutate(handle, true).await?],
            Command::Decrement(handle) => vec![self.mutate(handle, false).await?],
        };
        Ok(replies)
    }

    async fn mutate(&self, handle: &str, increment: bool) -> Result<String> {
        let result = if increment {
            self.store.increment_async(handle).await
        } else {
            self.store.decrement_async(handle).await
        };

        match result {
            Ok(score) => {
                info!(handle, score, increment, "karma changed");
                Ok(format!("Karma for {handle} now {score}"))
            }
            Err(err) => {
                error!(handle, error = %err, "failed to persist karma");
                Err(err)
            }
        }
    }
}

fn standing(handle: &str, score: i64) -> String {
    format!("Karma for {handle} is {score}.")
}

fn ranking(entries: Vec<KarmaEntry>) -> Vec<String> {
    entries
        .iter()
        .map(|entry| standing(&entry.handle, entry.score))
        .collect()
}

/// Channel messages are answered in the channel, private ones privately.
fn reply_target(message: &ChatMessage) -> &str {
    if message.is_channel_message() {
        &message.target
    } else {
        &message.sender
    }
}
