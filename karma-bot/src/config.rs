use std::{fs, path::Path};

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_QUIT_MESSAGE: &str = "Bazinga!";

/// Connection parameters, loaded once before connecting and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server: String,
    pub port: u16,
    pub nickname: String,
    pub username: String,
    pub channel: String,
    pub quit_message: String,
}

/// On-disk shape of the config file. Optional fields get defaults in
/// [`SessionConfig::from_json`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    server: String,
    port: u16,
    nickname: String,
    username: Option<String>,
    channel: String,
    quit_message: Option<String>,
}

impl SessionConfig {
    /// Reads and validates the JSON config file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(content).map_err(|err| Error::Config(err.to_string()))?;

        let config = SessionConfig {
            username: raw.username.unwrap_or_else(|| raw.nickname.clone()),
            quit_message: raw
                .quit_message
                .unwrap_or_else(|| DEFAULT_QUIT_MESSAGE.to_string()),
            server: raw.server,
            port: raw.port,
            nickname: raw.nickname,
            channel: raw.channel,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port cannot be 0".to_string()));
        }

        for (field, value) in [
            ("nickname", &self.nickname),
            ("username", &self.username),
            ("channel", &self.channel),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} cannot be empty")));
            }
            if value.chars().any(char::is_whitespace) {
                return Err(Error::Config(format!(
                    "{field} '{value}' cannot contain whitespace"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_get_defaults() {
        let config = SessionConfig::from_json(
            r##"{"server": "irc.example.net", "port": 6667, "nickname": "karmabot", "channel": "#karma"}"##,
        )
        .expect("valid config");

        assert_eq!(config.username, "karmabot");
        assert_eq!(config.quit_message, DEFAULT_QUIT_MESSAGE);
        assert_eq!(config.port, 6667);
    }

    #[test]
    fn whitespace_in_nickname_is_rejected() {
        let err = SessionConfig::from_json(
            r##"{"server": "irc.example.net", "port": 6667, "nickname": "karma bot", "channel": "#karma"}"##,
        )
        .expect_err("nickname with a space");

        assert!(matches!(err, Error::Config(message) if message.contains("nickname")));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = SessionConfig::from_json("{\"server\": ").expect_err("truncated json");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = SessionConfig::load(Path::new("/definitely/not/here.conf"))
            .expect_err("missing file");
        assert!(matches!(err, Error::Config(_)));
    }
}
