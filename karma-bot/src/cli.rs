use std::path::PathBuf;

use clap::Parser;

const CONFIG_FILE: &str = ".karma-bot.conf";
const KARMA_FILE: &str = ".karma-bot.json";
const LOG_FILE: &str = ".karma-bot.log";

#[derive(Parser, Debug)]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// JSON config file with server, port, nickname, username and channel.
    #[arg(long, default_value_os_t = home_file(CONFIG_FILE))]
    pub config: PathBuf,

    /// Karma database file. Created on the first karma change if missing.
    #[arg(long, default_value_os_t = home_file(KARMA_FILE))]
    pub karma_file: PathBuf,

    /// File the session log is appended to.
    #[arg(long, default_value_os_t = home_file(LOG_FILE))]
    pub log_file: PathBuf,

    /// Print the version and exit.
    #[arg(short = 'v', long)]
    pub version: bool,
}

/// `name` inside the user's home directory, or the working directory when
/// there is no home.
pub fn home_file(name: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}
