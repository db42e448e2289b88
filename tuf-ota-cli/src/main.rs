mod args;
mod config;

use crate::args::{Args, ClientCommand, Command, LogLevel, RepoCommand};
use crate::config::RepoConfig;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs::{read, read_to_string};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use tuf_ota::repository::{NewArtifact, Repository};
use tuf_ota_client::download::ProgressFn;
use tuf_ota_client::patch::{create_patch, patch_name, PatchInfo};
use tuf_ota_client::{ClientConfig, UpdateController, UpdateOutcome};

fn configure_logging(level: &LogLevel) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            Targets::new()
                .with_target(env!("CARGO_PKG_NAME").replace('-', "_"), level)
                .with_target("tuf_ota", level)
                .with_target("tuf_ota_client", level)
                .with_target("tuf_ota_common", level)
                .with_target("tuf_ota_json", level)
                .with_target("hyper", tracing_core::Level::INFO)
                .with_target("reqwest", tracing_core::Level::INFO),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Repo { config, command } => {
            configure_logging(args.log_level.as_ref().unwrap_or(&LogLevel::Info));
            let config: RepoConfig = read_to_string(&config)
                .with_context(|| format!("failed to read config file {config:?}"))
                .and_then(|s| serde_yaml::from_str(&s).context("failed to parse config file"))?;
            repo(&config, command)
        }
        Command::Client { config, command } => {
            let config = ClientConfig::load(&config)
                .with_context(|| format!("failed to load client config {config:?}"))?;
            let level = match (args.log_level, config.log_level.as_deref()) {
                (Some(level), _) => level,
                (None, Some(level)) => LogLevel::from_str(level, true)
                    .map_err(|e| anyhow!("invalid log level `{level}`: {e}"))?,
                (None, None) => LogLevel::Info,
            };
            configure_logging(&level);
            client(config, command).await
        }
    }
}

fn repo(config: &RepoConfig, command: RepoCommand) -> Result<()> {
    let expiry = config.expiry_policy()?;
    let open = || Repository::open(&config.out, expiry).context("failed to open repository");
    match command {
        RepoCommand::Init => {
            Repository::init(
                &config.out,
                &config.role_setups()?,
                expiry,
                config.consistent_snapshot,
                Utc::now(),
            )
            .context("failed to initialize repository")?;
            println!(
                "initialized repository, distribute {:?} to clients",
                config.out.join("metadata/1.root.json")
            );
        }
        RepoCommand::Publish { files, patch_from } => {
            let mut repository = open()?;
            let mut artifacts = files
                .iter()
                .map(|path| {
                    let data = read(path).with_context(|| format!("failed to read {path:?}"))?;
                    Ok(NewArtifact::new(target_name(path)?, data))
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(old) = patch_from {
                let [artifact] = artifacts.as_slice() else {
                    bail!("--patch-from requires exactly one artifact");
                };
                let patch = patch_artifact(config, &old, &artifact.name, &artifact.data)?;
                artifacts.push(patch);
            }
            let set = repository
                .publish(artifacts, Utc::now())
                .context("failed to publish artifacts")?;
            println!(
                "published targets {}, snapshot {}, timestamp {}",
                set.targets.signed.version,
                set.snapshot.signed.version,
                set.timestamp.signed.version
            );
        }
        RepoCommand::RotateKeys { role } => {
            let set = open()?
                .rotate_keys(role, &config.role_setup(role)?, Utc::now())
                .with_context(|| format!("failed to rotate {role} keys"))?;
            println!("rotated {role} keys, root version {}", set.root_version);
        }
        RepoCommand::Timestamp => {
            let timestamp = open()?
                .reissue_timestamp(Utc::now())
                .context("failed to reissue timestamp")?;
            println!(
                "timestamp {} expires {}",
                timestamp.signed.version, timestamp.signed.expires
            );
        }
    }
    Ok(())
}

fn target_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("invalid artifact file name {path:?}"))
}

/// Creates the patch from the archive at `old` to the artifact `name`.
fn patch_artifact(
    config: &RepoConfig,
    old: &Path,
    name: &str,
    data: &[u8],
) -> Result<NewArtifact> {
    let app = config
        .app_name
        .clone()
        .context("`app_name` must be configured to publish patches")?;
    let from = config.artifact_version(&target_name(old)?)?;
    let to = config.artifact_version(name)?;
    if from >= to {
        bail!("cannot patch from {from} to {to}");
    }
    let old = read(old).with_context(|| format!("failed to read {old:?}"))?;
    let patch = create_patch(&old, data).context("failed to create patch")?;
    if patch.len() >= data.len() {
        warn!("patch from {from} is not smaller than the artifact, clients will ignore it");
    }
    info!("created patch {from} -> {to} ({} bytes)", patch.len());
    let info = PatchInfo {
        app: app.clone(),
        version: to.clone(),
        patch_from: from.clone(),
    };
    Ok(NewArtifact::new(patch_name(&app, &from, &to), patch).with_custom(info.to_custom()))
}

/// Awaits `future`, asking the controller to cancel on Ctrl-C.
async fn cancellable<F, T>(controller: &UpdateController, future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(future);
    tokio::select! {
        result = &mut future => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling update session");
            controller.cancel();
            future.await
        }
    }
}

async fn client(config: ClientConfig, command: ClientCommand) -> Result<()> {
    let controller = UpdateController::new(config).context("failed to start update client")?;
    match command {
        ClientCommand::Check => match controller.check_for_update().await? {
            Some(info) => println!(
                "update available: {} -> {} ({} bytes{})",
                controller.installed_version(),
                info.version,
                info.length,
                if info.patch.is_some() { ", patch available" } else { "" }
            ),
            None => println!("{} is up to date", controller.installed_version()),
        },
        ClientCommand::Update => {
            let outcome = cancellable(&controller, controller.start_update(Some(progress())));
            print_outcome(outcome.await?);
        }
        // an interrupted installation is recovered on the next start
        ClientCommand::Run => tokio::select! {
            outcome = controller.run() => print_outcome(outcome?),
            _ = tokio::signal::ctrl_c() => info!("interrupted, stopping"),
        },
        ClientCommand::Cleanup => {
            let report = controller.cleanup()?;
            println!(
                "removed {} downloads and {} backups",
                report.removed_downloads, report.removed_backups
            );
        }
        ClientCommand::Recover => {
            let action = controller.recover()?;
            println!("{action:?}");
        }
    }
    Ok(())
}

/// Logs the download progress in steps of ten percent.
fn progress() -> ProgressFn {
    let last_step = AtomicU64::new(0);
    Arc::new(move |downloaded, total| {
        let step = (downloaded * 10).checked_div(total).unwrap_or(10);
        if last_step.fetch_max(step, Ordering::Relaxed) < step {
            info!("downloaded {downloaded}/{total} bytes");
        }
    })
}

fn print_outcome(outcome: UpdateOutcome) {
    match outcome {
        UpdateOutcome::UpToDate { version } => println!("{version} is up to date"),
        UpdateOutcome::Installed { version, patched } => println!(
            "installed {version}{}, restart the application to use it",
            if patched { " from a patch" } else { "" }
        ),
    }
}
