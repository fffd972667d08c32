// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MirrorFS FUSE host
//!
//! Mounts a passthrough mirror of a backing directory, optionally
//! participating in the cross-process version protocol so cooperating
//! daemons sharing the backing tree can detect each other's writes.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;

#[cfg(all(feature = "fuse", target_os = "linux"))]
use adapter::MirrorFsFuse;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mirrorfs_core::{CachePolicy, Config, PassthroughFs, SharedConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheArg {
    None,
    Auto,
    Always,
}

impl From<CacheArg> for CachePolicy {
    fn from(arg: CacheArg) -> Self {
        match arg {
            CacheArg::None => CachePolicy::None,
            CacheArg::Auto => CachePolicy::Auto,
            CacheArg::Always => CachePolicy::Always,
        }
    }
}

#[derive(Parser)]
struct Args {
    /// Backing directory to mirror
    source: PathBuf,

    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Attribute/entry cache policy
    #[arg(long, value_enum, default_value_t = CacheArg::Auto)]
    cache: CacheArg,

    /// Override the cache timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Enable the kernel writeback cache
    #[arg(long)]
    writeback: bool,

    /// Pass extended attribute operations through
    #[arg(long)]
    xattr: bool,

    /// Pass flock operations through
    #[arg(long)]
    flock: bool,

    /// Fail racy fallback paths instead of recovering via parent lookup
    #[arg(long)]
    norace: bool,

    /// Track shared versions through the coordinator
    #[arg(long)]
    shared: bool,

    /// Coordinator control socket
    #[arg(long, env = "MIRRORFS_COORDINATOR_SOCKET")]
    coordinator_socket: Option<PathBuf>,

    /// Shared version counter table
    #[arg(long, env = "MIRRORFS_VERSION_TABLE")]
    version_table: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,
}

fn build_config(args: &Args) -> Config {
    let mut config = Config::new(&args.source);
    config.cache = args.cache.into();
    config.timeout = args.timeout.map(Duration::from_secs_f64);
    config.writeback = args.writeback;
    config.xattr = args.xattr;
    config.flock = args.flock;
    config.norace = args.norace;
    if args.shared {
        let mut shared = SharedConfig::default();
        if let Some(socket) = &args.coordinator_socket {
            shared.socket = socket.clone();
        }
        if let Some(table) = &args.version_table {
            shared.table = table.clone();
        }
        config.shared = Some(shared);
    }
    config
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args);

    info!(
        source = %args.source.display(),
        mount_point = %args.mount_point.display(),
        cache = ?config.cache,
        shared = config.shared.is_some(),
        "starting MirrorFS host"
    );

    let filesystem =
        PassthroughFs::new(config, None).context("failed to initialize passthrough core")?;

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let mut mount_options = vec![
            fuser::MountOption::FSName("mirrorfs".to_string()),
            fuser::MountOption::Subtype("mirrorfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }
        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("mounting filesystem");
        fuser::mount2(
            MirrorFsFuse::new(filesystem),
            &args.mount_point,
            &mount_options,
        )
        .context("mount failed")?;
        info!("unmounted");
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        tracing::warn!("FUSE support not compiled in; core initialized and exiting.");
        tracing::warn!("To enable FUSE support, compile with: cargo build --features fuse");
        drop(filesystem);
    }

    Ok(())
}
