//! Cumulus CLI - Operator Command Line Interface
//!
//! Manages volumes stored on directory-backed disks, with metadata kept in a
//! local redb file.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use cumulus_common::config::Config;
use cumulus_common::{
    BackupMode, DiskId, EncryptionMode, FileId, FileType, PartitionStrategy, ProviderType, UserId,
    VolumeId, VolumeSettings,
};
use cumulus_disk::{Credentials, DiskContext, DiskRegistry};
use cumulus_meta_store::MetaStore;
use cumulus_transport::Transport;
use cumulus_volume::BlockCipher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cumulus")]
#[command(about = "Cumulus storage virtualization CLI")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CUMULUS_CONFIG")]
    config: Option<PathBuf>,

    /// Metadata database, overrides the configuration file
    #[arg(short, long, env = "CUMULUS_METADATA")]
    metadata: Option<PathBuf>,

    /// Acting user
    #[arg(short, long, env = "CUMULUS_USER", default_value = "00000000-0000-0000-0000-000000000000")]
    user: UserId,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Volume operations
    Volume {
        #[command(subcommand)]
        action: VolumeCommands,
    },
    /// Disk operations
    Disk {
        #[command(subcommand)]
        action: DiskCommands,
    },
    /// Upload a local file
    Put {
        /// Volume ID
        volume_id: VolumeId,
        /// Local file to upload
        path: PathBuf,
        /// Name in the volume, defaults to the local file name
        #[arg(short, long)]
        name: Option<String>,
        /// Parent directory ID
        #[arg(short, long)]
        dir: Option<FileId>,
    },
    /// Download a file
    Get {
        /// Volume ID
        volume_id: VolumeId,
        /// File ID
        file_id: FileId,
        /// Local destination
        output: PathBuf,
    },
    /// List a directory
    Ls {
        /// Volume ID
        volume_id: VolumeId,
        /// Directory ID, the volume root if omitted
        #[arg(short, long)]
        dir: Option<FileId>,
    },
    /// Create a directory
    Mkdir {
        /// Volume ID
        volume_id: VolumeId,
        /// Directory name
        name: String,
        /// Parent directory ID
        #[arg(short, long)]
        dir: Option<FileId>,
    },
    /// Remove a file or an empty directory
    Rm {
        /// Volume ID
        volume_id: VolumeId,
        /// File ID
        file_id: FileId,
    },
    /// Write a new random encryption key
    Keygen {
        /// Key file to create
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum VolumeCommands {
    /// List the user's volumes
    List,
    /// Create a new volume
    Create {
        /// Volume name
        name: String,
        /// Redundancy mode
        #[arg(short, long, value_enum, default_value_t = Backup::None)]
        backup: Backup,
        /// Encrypt blocks with the configured key
        #[arg(short, long)]
        encrypt: bool,
        /// Block placement strategy
        #[arg(short, long, value_enum, default_value_t = Strategy::Balanced)]
        strategy: Strategy,
    },
    /// Delete a volume with all its disks and files
    Delete {
        /// Volume ID
        volume_id: VolumeId,
    },
}

#[derive(Subcommand, Debug)]
enum DiskCommands {
    /// List the disks of a volume
    List {
        /// Volume ID
        volume_id: VolumeId,
    },
    /// Attach a directory as a new disk
    Attach {
        /// Volume ID
        volume_id: VolumeId,
        /// Directory holding the blocks
        #[arg(short, long)]
        path: PathBuf,
        /// Quota (e.g. 10G, 1T, 500M)
        #[arg(short, long)]
        quota: String,
        /// Disk name, defaults to the directory name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Detach a disk and delete the files stored on it
    Detach {
        /// Volume ID
        volume_id: VolumeId,
        /// Disk ID
        disk_id: DiskId,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backup {
    None,
    Raid1,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    Balanced,
    Priority,
    Throughput,
}

impl From<Backup> for BackupMode {
    fn from(backup: Backup) -> Self {
        match backup {
            Backup::None => Self::NoBackup,
            Backup::Raid1 => Self::Raid1,
        }
    }
}

impl From<Strategy> for PartitionStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Balanced => Self::Balanced,
            Strategy::Priority => Self::Priority,
            Strategy::Throughput => Self::Throughput,
        }
    }
}

/// Parse a human-readable size string (e.g. "10G", "1T", "500M") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size out of range: '{s}'"))
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            Config::from_toml_str(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(metadata) = &args.metadata {
        config.storage.metadata_path.clone_from(metadata);
    }
    Ok(config)
}

fn open_transport(config: Config) -> Result<Transport> {
    let store = MetaStore::open(&config.storage.metadata_path).with_context(|| {
        format!(
            "Failed to open metadata store {}",
            config.storage.metadata_path.display()
        )
    })?;
    let repository: Arc<dyn cumulus_common::Repository> = Arc::new(store);
    let registry = DiskRegistry::with_defaults(DiskContext::new(
        Some(Arc::clone(&repository)),
        config.readiness.clone(),
    ));

    let key_path = config.crypto.key_path.clone();
    let mut transport = Transport::new(repository, registry, config);
    if let Some(key_path) = key_path {
        let cipher = BlockCipher::from_key_file(&key_path)
            .with_context(|| format!("Failed to load key {}", key_path.display()))?;
        transport = transport.with_cipher(cipher);
    }
    transport.seed_providers()?;
    Ok(transport)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Commands::Keygen { path } = &args.command {
        std::fs::write(path, BlockCipher::generate_key())
            .with_context(|| format!("Failed to write key {}", path.display()))?;
        println!("Encryption key written to {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    info!(
        "Using metadata store {}",
        config.storage.metadata_path.display()
    );
    let transport = open_transport(config)?;
    let user = args.user;

    match args.command {
        Commands::Volume { action } => match action {
            VolumeCommands::List => {
                let volumes = transport.get_volumes(user)?;
                println!("Volumes");
                println!("=======");
                if volumes.is_empty() {
                    println!("No volumes found");
                } else {
                    println!(
                        "{:<38} {:<20} {:<10} {:<12} {:<12}",
                        "VOLUME ID", "NAME", "BACKUP", "ENCRYPTION", "PLACEMENT"
                    );
                    println!("{}", "-".repeat(96));
                    for volume in volumes {
                        println!(
                            "{:<38} {:<20} {:<10} {:<12} {:<12}",
                            volume.id,
                            volume.name,
                            format!("{:?}", volume.settings.backup),
                            format!("{:?}", volume.settings.encryption),
                            format!("{:?}", volume.settings.partition)
                        );
                    }
                }
            }
            VolumeCommands::Create {
                name,
                backup,
                encrypt,
                strategy,
            } => {
                let settings = VolumeSettings {
                    backup: backup.into(),
                    encryption: if encrypt {
                        EncryptionMode::Aes256
                    } else {
                        EncryptionMode::NoEncryption
                    },
                    partition: strategy.into(),
                };
                let volume = transport.create_volume(&name, user, settings)?;
                println!("Volume created successfully!");
                println!();
                println!("Volume ID:  {}", volume.id());
                println!("Name:       {}", volume.name());
                println!("Block size: {}", format_size(volume.block_size()));
                println!();
                println!("Next, attach a disk:");
                println!("  cumulus disk attach {} --path <dir> --quota 10G", volume.id());
            }
            VolumeCommands::Delete { volume_id } => {
                transport.delete_volume(volume_id).await?;
                println!("Volume '{volume_id}' deleted successfully");
            }
        },
        Commands::Disk { action } => match action {
            DiskCommands::List { volume_id } => {
                let disks = transport.get_disks(volume_id)?;
                println!("Disks of volume {volume_id}");
                println!("=====");
                if disks.is_empty() {
                    println!("No disks found");
                } else {
                    println!(
                        "{:<38} {:<16} {:<12} {:<12} {:<38}",
                        "DISK ID", "NAME", "USED", "QUOTA", "MIRROR OF"
                    );
                    println!("{}", "-".repeat(120));
                    for disk in disks.iter().filter(|disk| !disk.is_virtual) {
                        println!(
                            "{:<38} {:<16} {:<12} {:<12} {:<38}",
                            disk.id,
                            disk.name,
                            format_size(disk.used_space),
                            format_size(disk.total_space),
                            disk.virtual_disk_id
                                .map_or_else(|| "-".to_string(), |id| id.to_string())
                        );
                    }
                }
            }
            DiskCommands::Attach {
                volume_id,
                path,
                quota,
                name,
            } => {
                let quota = parse_size(&quota)?;
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                let path = path
                    .canonicalize()
                    .with_context(|| format!("Failed to resolve {}", path.display()))?;
                let name = name.unwrap_or_else(|| {
                    path.file_name()
                        .map_or_else(|| "local".to_string(), |n| n.to_string_lossy().into_owned())
                });
                let credentials = Credentials::Local {
                    path: path.display().to_string(),
                };

                let disk_id = transport.attach_disk(
                    volume_id,
                    user,
                    ProviderType::Local,
                    &name,
                    Some(credentials),
                    quota,
                )?;
                println!("Disk '{disk_id}' attached to volume '{volume_id}'");
            }
            DiskCommands::Detach { volume_id, disk_id } => {
                transport.delete_disk(volume_id, disk_id).await?;
                println!("Disk '{disk_id}' detached from volume '{volume_id}'");
            }
        },
        Commands::Put {
            volume_id,
            path,
            name,
            dir,
        } => {
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("The file name cannot be derived from the path, use --name")?,
            };
            let size = content.len() as u64;

            let file_id = transport
                .upload_file(volume_id, user, dir, &name, Bytes::from(content))
                .await?;
            println!("Uploaded '{name}' ({}) as {file_id}", format_size(size));
        }
        Commands::Get {
            volume_id,
            file_id,
            output,
        } => {
            let content = transport.download_file(volume_id, file_id).await?;
            tokio::fs::write(&output, &content)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Downloaded {file_id} ({}) to {}",
                format_size(content.len() as u64),
                output.display()
            );
        }
        Commands::Ls { volume_id, dir } => {
            let files = transport.list_files(volume_id, dir)?;
            if files.is_empty() {
                println!("No files found");
            } else {
                println!("{:<38} {:<5} {:<12} {:<30}", "FILE ID", "TYPE", "SIZE", "NAME");
                println!("{}", "-".repeat(88));
                for file in files {
                    let (kind, size) = match file.file_type {
                        FileType::Directory => ("dir", "-".to_string()),
                        FileType::Regular => ("file", format_size(file.size)),
                    };
                    println!("{:<38} {:<5} {:<12} {:<30}", file.id, kind, size, file.name);
                }
            }
        }
        Commands::Mkdir {
            volume_id,
            name,
            dir,
        } => {
            let dir_id = transport.create_directory(volume_id, user, dir, &name)?;
            println!("Directory '{name}' created as {dir_id}");
        }
        Commands::Rm { volume_id, file_id } => {
            transport.remove_file(volume_id, file_id).await?;
            println!("'{file_id}' removed successfully");
        }
        Commands::Keygen { .. } => {}
    }

    Ok(())
}
