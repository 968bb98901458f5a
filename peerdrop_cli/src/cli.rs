use clap::{ArgAction, Parser, Subcommand};
use peerdrop_core::transfer::TRANSFER_PORT;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "peerdrop", version, about = "Send files directly between peers")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a config.json to use instead of the platform default
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for peers and save every file they send
    Receive {
        /// Address to listen on
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], TRANSFER_PORT)))]
        bind: SocketAddr,

        /// Directory for received files (defaults to the configured download_dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Connect to a peer and send one or more files
    Send {
        /// Address of the receiving peer
        #[arg(long)]
        peer: SocketAddr,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the effective configuration, optionally saving it as the default
    Config {
        #[arg(long)]
        save: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_defaults() {
        let cli = Cli::try_parse_from(["peerdrop", "receive"]).unwrap();
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Command::Receive { bind, out } => {
                assert_eq!(bind.port(), TRANSFER_PORT);
                assert!(out.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_send_with_global_flags() {
        let cli = Cli::try_parse_from([
            "peerdrop",
            "send",
            "--peer",
            "192.168.1.20:9000",
            "a.txt",
            "b.txt",
            "-vv",
            "--config",
            "/tmp/peerdrop.json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peerdrop.json")));
        match cli.command {
            Command::Send { peer, files } => {
                assert_eq!(peer.to_string(), "192.168.1.20:9000");
                assert_eq!(files.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_config_save_flag() {
        let cli = Cli::try_parse_from(["peerdrop", "config", "--save"]).unwrap();
        assert!(matches!(cli.command, Command::Config { save: true }));
    }

    #[test]
    fn test_send_requires_files() {
        assert!(Cli::try_parse_from(["peerdrop", "send", "--peer", "127.0.0.1:9000"]).is_err());
    }
}
