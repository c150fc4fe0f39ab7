//! Sharegate
//!
//! Administrative CLI for share-scoped file access.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use daemon::config::Config;
use daemon::files::UploadSessionManager;
use daemon::orchestrator::Gateway;
use daemon::security::SecurityContext;
use daemon::shares::{JsonShareRegistry, ShareRegistry};
use protocol::messages::{BrowseRequest, CreateArchiveRequest, ExtractArchiveRequest, PathRequest};
use protocol::{ArchiveFormat, Message, Role, Share, User};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sharegate - share-scoped file access and chunked uploads.
#[derive(Parser, Debug)]
#[command(name = "sharegate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage shares
    #[command(subcommand)]
    Shares(SharesCommands),

    /// Show which share roots a user may reach
    Access {
        #[command(flatten)]
        identity: Identity,
    },

    /// List a directory as a user would see it
    Browse {
        /// Absolute path, or share-relative with --share
        path: String,

        /// Resolve the path inside this share
        #[arg(long)]
        share: Option<String>,

        /// Include dot entries
        #[arg(long, short)]
        all: bool,

        #[command(flatten)]
        identity: Identity,
    },

    /// Sum the size of a directory tree
    Du {
        /// Absolute path
        path: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Pack files and directories into an archive
    Archive {
        /// Absolute source paths
        #[arg(required = true)]
        sources: Vec<String>,

        /// Absolute path of the archive to create
        #[arg(long, short)]
        output: String,

        /// Archive format (default: from the output extension)
        #[arg(long, short, value_enum)]
        format: Option<FormatArg>,

        #[command(flatten)]
        identity: Identity,
    },

    /// Unpack an archive into a directory
    Extract {
        /// Absolute path of the archive
        archive: String,

        /// Absolute destination directory
        destination: String,

        #[command(flatten)]
        identity: Identity,
    },

    /// Delete leftover partial uploads
    PurgeUploads,
}

/// Subcommands for share management.
#[derive(Subcommand, Debug, Clone)]
pub enum SharesCommands {
    /// List all shares
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Add or replace a share
    Add {
        /// Share name
        name: String,

        /// Absolute root directory
        path: PathBuf,

        /// Anyone may access the share
        #[arg(long)]
        guest_ok: bool,

        /// Users granted access (repeatable)
        #[arg(long = "user", value_name = "USER")]
        users: Vec<String>,

        /// Groups granted access (repeatable)
        #[arg(long = "group", value_name = "GROUP")]
        groups: Vec<String>,

        /// Reject writes for non-admins
        #[arg(long)]
        read_only: bool,

        /// Hide the share from non-admins
        #[arg(long)]
        disabled: bool,
    },

    /// Remove a share
    Remove {
        /// Share name
        name: String,
    },
}

/// Identity a command acts as.
#[derive(clap::Args, Debug, Clone)]
pub struct Identity {
    /// User name to act as
    #[arg(long = "as", value_name = "USER", default_value = "admin")]
    pub username: String,

    /// Role of that user
    #[arg(long, value_enum, default_value = "admin")]
    pub role: RoleArg,

    /// Group memberships (repeatable)
    #[arg(long = "member-of", value_name = "GROUP")]
    pub groups: Vec<String>,
}

impl Identity {
    fn user(&self) -> User {
        User::new(0, self.username.clone(), self.role.into()).with_groups(self.groups.clone())
    }
}

/// Role accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleArg {
    /// Reaches every share and path
    Admin,
    /// Reaches granted shares
    User,
    /// Reaches guest shares and explicit grants
    Guest,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::User => Role::User,
            RoleArg::Guest => Role::Guest,
        }
    }
}

/// Archive format accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    /// Deflate-compressed zip
    Zip,
    /// Uncompressed tar
    Tar,
    /// Gzip-compressed tar
    #[value(alias = "tgz")]
    TarGz,
}

impl From<FormatArg> for ArchiveFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Zip => ArchiveFormat::Zip,
            FormatArg::Tar => ArchiveFormat::Tar,
            FormatArg::TarGz => ArchiveFormat::TarGz,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;
    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Shares(cmd) => run_shares(&config, cmd),
        Commands::Access { identity } => {
            let registry = JsonShareRegistry::open(config.registry_path())?;
            let ctx = SecurityContext::resolve(&identity.user(), &registry.list_shares()?);
            if ctx.is_admin() {
                println!("{} is an admin and may reach every path", identity.username);
            }
            if ctx.allowed_roots().is_empty() {
                println!("No shares available to {}", identity.username);
            }
            for root in ctx.allowed_roots() {
                let mode = if root.read_only { "ro" } else { "rw" };
                println!("{:<20} {}  {}", root.share, mode, root.path.display());
            }
            Ok(())
        }
        Commands::Browse {
            path,
            share,
            all,
            identity,
        } => {
            let request = Message::Browse(BrowseRequest {
                path,
                share,
                show_hidden: all,
            });
            run_request(config, &identity, request).await
        }
        Commands::Du { path, identity } => {
            run_request(config, &identity, Message::GetDiskUsage(PathRequest { path })).await
        }
        Commands::Archive {
            sources,
            output,
            format,
            identity,
        } => {
            let format = match format {
                Some(f) => f.into(),
                None => ArchiveFormat::from_file_name(&output).with_context(|| {
                    format!("Cannot infer archive format from {output}; pass --format")
                })?,
            };
            let request = Message::CreateArchive(CreateArchiveRequest {
                sources,
                destination: output,
                format,
            });
            run_request(config, &identity, request).await
        }
        Commands::Extract {
            archive,
            destination,
            identity,
        } => {
            let request = Message::ExtractArchive(ExtractArchiveRequest {
                archive,
                destination,
            });
            run_request(config, &identity, request).await
        }
        Commands::PurgeUploads => {
            let temp_dir = config.upload_temp_dir();
            let uploads = UploadSessionManager::new(temp_dir.clone(), &config.upload)
                .with_context(|| format!("Failed to open {}", temp_dir.display()))?;
            let removed = uploads.purge_orphans()?;
            println!("Removed {removed} leftover upload file(s) from {}", temp_dir.display());
            Ok(())
        }
    }
}

fn run_shares(config: &Config, cmd: SharesCommands) -> anyhow::Result<()> {
    let registry = JsonShareRegistry::open(config.registry_path())?;
    match cmd {
        SharesCommands::List { json } => {
            let shares = registry.list_shares()?;
            if json {
                print_json(&shares)?;
            } else if shares.is_empty() {
                println!("No shares defined ({})", registry.path().display());
            } else {
                for share in &shares {
                    println!("{}", describe_share(share));
                }
            }
        }
        SharesCommands::Add {
            name,
            path,
            guest_ok,
            users,
            groups,
            read_only,
            disabled,
        } => {
            let share = registry.upsert(Share {
                guest_ok,
                valid_users: users,
                valid_groups: groups,
                read_only,
                enabled: !disabled,
                ..Share::new(0, name, path)
            })?;
            registry.save()?;
            println!("Saved {}", describe_share(&share));
        }
        SharesCommands::Remove { name } => match registry.remove(&name)? {
            Some(_) => {
                registry.save()?;
                println!("Removed share {name}");
            }
            None => anyhow::bail!("No share named {name}"),
        },
    }
    Ok(())
}

fn describe_share(share: &Share) -> String {
    let mut flags = Vec::new();
    if share.guest_ok {
        flags.push("guest".to_string());
    }
    if share.read_only {
        flags.push("read-only".to_string());
    }
    if !share.enabled {
        flags.push("disabled".to_string());
    }
    if !share.valid_users.is_empty() {
        flags.push(format!("users={}", share.valid_users.join(",")));
    }
    if !share.valid_groups.is_empty() {
        flags.push(format!("groups={}", share.valid_groups.join(",")));
    }
    format!(
        "{:<4} {:<20} {}  [{}]",
        share.id,
        share.name,
        share.path.display(),
        flags.join(" ")
    )
}

/// Route one request through a gateway and print the response as JSON.
async fn run_request(config: Config, identity: &Identity, request: Message) -> anyhow::Result<()> {
    let gateway = Gateway::new(config)?;
    let cancel = gateway.shutdown_token().child_token();

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let user = identity.user();
    let response = gateway.router().route(Some(&user), request, &cancel).await;
    match response {
        Message::Error(err) => {
            anyhow::bail!("{:?}: {}", err.code, err.message)
        }
        Message::BrowseResult(listing) => print_json(&listing),
        Message::DiskUsage(usage) => print_json(&usage),
        Message::ArchiveResult(summary) => print_json(&summary),
        Message::ExtractResult(summary) => print_json(&summary),
        other => print_json(&other),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_shares_add() {
        let cli = Cli::try_parse_from([
            "sharegate", "shares", "add", "eng", "/srv/eng", "--user", "alice", "--user", "bob",
            "--group", "devs", "--read-only",
        ])
        .unwrap();
        match cli.command {
            Commands::Shares(SharesCommands::Add {
                name,
                path,
                guest_ok,
                users,
                groups,
                read_only,
                disabled,
            }) => {
                assert_eq!(name, "eng");
                assert_eq!(path, PathBuf::from("/srv/eng"));
                assert!(!guest_ok);
                assert_eq!(users, vec!["alice", "bob"]);
                assert_eq!(groups, vec!["devs"]);
                assert!(read_only);
                assert!(!disabled);
            }
            _ => panic!("Expected shares add command"),
        }
    }

    #[test]
    fn test_identity_defaults_to_admin() {
        let cli = Cli::try_parse_from(["sharegate", "du", "/srv"]).unwrap();
        match cli.command {
            Commands::Du { path, identity } => {
                assert_eq!(path, "/srv");
                let user = identity.user();
                assert_eq!(user.username, "admin");
                assert!(user.is_admin());
            }
            _ => panic!("Expected du command"),
        }
    }

    #[test]
    fn test_browse_as_user() {
        let cli = Cli::try_parse_from([
            "sharegate", "browse", "docs", "--share", "public", "--as", "bob", "--role", "user",
            "--member-of", "devs", "-a",
        ])
        .unwrap();
        match cli.command {
            Commands::Browse {
                path,
                share,
                all,
                identity,
            } => {
                assert_eq!(path, "docs");
                assert_eq!(share.as_deref(), Some("public"));
                assert!(all);
                let user = identity.user();
                assert_eq!(user.role, Role::User);
                assert_eq!(user.groups, vec!["devs"]);
            }
            _ => panic!("Expected browse command"),
        }
    }

    #[test]
    fn test_archive_format() {
        let cli = Cli::try_parse_from([
            "sharegate", "archive", "/srv/a", "/srv/b", "-o", "/srv/out.bin", "--format", "tgz",
        ])
        .unwrap();
        match cli.command {
            Commands::Archive {
                sources, format, ..
            } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(format.map(ArchiveFormat::from), Some(ArchiveFormat::TarGz));
            }
            _ => panic!("Expected archive command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "sharegate", "purge-uploads", "--config", "/etc/sharegate.toml", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sharegate.toml")));
        assert!(matches!(cli.command, Commands::PurgeUploads));
    }
}
