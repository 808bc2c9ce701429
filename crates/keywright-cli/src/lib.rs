use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "keywright", version, about = "SSH key lifecycle manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Extra settings file applied after the user and project files.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub ssh_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Also log to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Create {
        name: String,
        #[arg(long = "type", short = 't')]
        key_type: Option<String>,
        #[arg(long, short)]
        comment: Option<String>,
        #[arg(long)]
        expiry: Option<i64>,
    },
    List {
        #[arg(long)]
        details: bool,
    },
    Add {
        name: String,
    },
    /// Remove one key from the agent, or all of them.
    Remove {
        name: Option<String>,
    },
    Validate {
        provider: String,
    },
    Rotate {
        name: String,
    },
    Delete {
        name: String,
    },
    Backup {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    Restore {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
    },
    Analyze {
        name: Option<String>,
    },
    Stats {
        name: Option<String>,
    },
    Perms {
        #[command(subcommand)]
        command: PermsCommand,
    },
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },
    Expire {
        #[command(subcommand)]
        command: ExpireCommand,
    },
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum PermsCommand {
    Check { name: String },
    Fix { name: String },
}

#[derive(Subcommand, Debug)]
pub enum HostsCommand {
    List,
    Set {
        host: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    Remove {
        host: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ExpireCommand {
    Set { name: String, days: i64 },
    Remove { name: String },
    Check,
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    Clone {
        /// Remote URL or owner/repo shorthand.
        repo: String,
        #[arg(long, default_value = "github.com")]
        provider: String,
        #[arg(long)]
        key: Option<String>,
        dest: Option<PathBuf>,
        #[arg(long)]
        git_email: Option<String>,
        #[arg(long)]
        git_name: Option<String>,
    },
    Link {
        /// Local checkout whose origin remote is linked.
        #[arg(default_value = ".")]
        path: PathBuf,
        #[arg(long)]
        key: String,
    },
    Links {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create_with_options() {
        let cli = Cli::try_parse_from([
            "keywright",
            "create",
            "id_ed25519_work",
            "--type",
            "ed25519",
            "--comment",
            "me@host",
            "--expiry",
            "90",
            "--ssh-dir",
            "/tmp/keys",
        ])
        .unwrap();
        assert_eq!(cli.ssh_dir, Some(PathBuf::from("/tmp/keys")));
        match cli.command {
            Command::Create {
                name,
                key_type,
                comment,
                expiry,
            } => {
                assert_eq!(name, "id_ed25519_work");
                assert_eq!(key_type.as_deref(), Some("ed25519"));
                assert_eq!(comment.as_deref(), Some("me@host"));
                assert_eq!(expiry, Some(90));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn remove_without_name_means_all() {
        let cli = Cli::try_parse_from(["keywright", "remove"]).unwrap();
        assert!(matches!(cli.command, Command::Remove { name: None }));
    }

    #[test]
    fn hosts_set_rejects_bad_port() {
        assert!(Cli::try_parse_from(["keywright", "hosts", "set", "example.com", "--port", "99999"])
            .is_err());
    }
}
