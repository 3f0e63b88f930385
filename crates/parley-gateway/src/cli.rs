use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "parley", version, about = "Parley: chat assistant gateway for Telegram")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Serve Telegram users until interrupted.
    Start,
    /// Talk to the assistant from this terminal as one user.
    Chat {
        /// User id to chat as (defaults to the admin id from config).
        #[arg(short, long)]
        user: Option<i64>,
        /// Keep users in memory only instead of the configured users file.
        #[arg(long)]
        ephemeral: bool,
    },
    Check {
        /// Output format: human (default) or json
        #[arg(long, default_value = "human")]
        format: String,
    },
    Version,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_with_global_config() {
        let cli = Cli::try_parse_from(["parley", "chat", "--user", "42", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(
            cli.command,
            Commands::Chat {
                user: Some(42),
                ephemeral: false
            }
        ));
    }

    #[test]
    fn check_defaults_to_human_format() {
        let cli = Cli::try_parse_from(["parley", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { format } if format == "human"));
    }
}
