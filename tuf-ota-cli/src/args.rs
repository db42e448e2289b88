use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tuf_ota_common::RoleType;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// log level of this application, defaults to the config file or Info.
    #[clap(long, value_enum, global = true)]
    pub(crate) log_level: Option<LogLevel>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Manage a repository: keys, signed metadata and targets.
    Repo {
        /// Path to the repository config file.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        #[command(subcommand)]
        command: RepoCommand,
    },
    /// Check for and install updates.
    Client {
        /// Path to the client config file.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        #[command(subcommand)]
        command: ClientCommand,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum RepoCommand {
    /// Generate keys and write `1.root.json` with empty targets.
    Init,
    /// Add artifacts to the targets and sign new targets, snapshot and timestamp.
    Publish {
        /// artifacts to publish, the file name is the target name
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// previous archive, a patch from it to the published artifact is published as well
        #[arg(long, value_name = "ARCHIVE")]
        patch_from: Option<PathBuf>,
    },
    /// Replace the keys of a role and publish the next root version.
    RotateKeys {
        #[arg(long)]
        role: RoleType,
    },
    /// Sign a new timestamp for the current snapshot.
    Timestamp,
}

#[derive(Debug, Subcommand)]
pub(crate) enum ClientCommand {
    /// Refresh the metadata and report a newer version.
    Check,
    /// Download and install the newest version.
    Update,
    /// Check periodically, installing updates if `auto_update` is set.
    Run,
    /// Remove partial downloads and old backups.
    Cleanup,
    /// Complete or revert an interrupted installation.
    Recover,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub(crate) enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Trace,
}

impl From<&LogLevel> for tracing_core::LevelFilter {
    fn from(value: &LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing_core::Level::DEBUG.into(),
            LogLevel::Info => tracing_core::Level::INFO.into(),
            LogLevel::Warn => tracing_core::Level::WARN.into(),
            LogLevel::Error => tracing_core::Level::ERROR.into(),
            LogLevel::Trace => tracing_core::Level::TRACE.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Args, ClientCommand, Command, RepoCommand};
    use clap::Parser;
    use tuf_ota_common::RoleType;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::parse_from([
            "tuf-ota",
            "repo",
            "--config",
            "repo.yaml",
            "rotate-keys",
            "--role",
            "targets",
        ]);
        assert!(matches!(
            args.command,
            Command::Repo {
                command: RepoCommand::RotateKeys {
                    role: RoleType::Targets
                },
                ..
            }
        ));

        let args = Args::parse_from([
            "tuf-ota",
            "client",
            "--config",
            "client.yaml",
            "update",
            "--log-level",
            "debug",
        ]);
        assert!(args.log_level.is_some());
        assert!(matches!(
            args.command,
            Command::Client {
                command: ClientCommand::Update,
                ..
            }
        ));
    }

    #[test]
    fn test_publish_requires_files() {
        let args = ["tuf-ota", "repo", "--config", "r.yaml", "publish"];
        assert!(Args::try_parse_from(args).is_err());
        let args = Args::try_parse_from([
            "tuf-ota",
            "repo",
            "--config",
            "r.yaml",
            "publish",
            "app-2.0.0.tar.gz",
            "--patch-from",
            "app-1.0.0.tar.gz",
        ])
        .unwrap();
        let Command::Repo {
            command: RepoCommand::Publish { files, patch_from },
            ..
        } = args.command
        else {
            panic!("unexpected command");
        };
        assert_eq!(files.len(), 1);
        assert!(patch_from.is_some());
    }
}
