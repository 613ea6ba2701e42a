use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use pipeline::objects::ObjectBody;
use pipeline::transfer::object_key;
use pipeline::{App, Identity, PipelineConfig, PipelineError, ProgressStatus};
use serde::Serialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/hevcd/config.toml";
const TOKEN_ENV: &str = "HEVCD_TOKEN";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// HEVC upload transcoding pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bearer token identifying the caller (falls back to $HEVCD_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a local file into object storage under the caller's prefix
    Upload {
        path: PathBuf,
        /// Remote file name (defaults to the local basename)
        #[arg(long)]
        name: Option<String>,
    },
    /// Submit an uploaded file for transcoding and follow it to completion
    Submit { file_name: String },
    /// Show the progress of one submission
    Progress { tracking_id: String },
    /// List the caller's files with their progress
    Files,
    /// Show the caller's activity trail
    History,
    /// Issue a presigned URL for one of the caller's files
    Url {
        file_name: String,
        /// Issue an upload (PUT) URL instead of a download URL
        #[arg(long)]
        upload: bool,
    },
    /// Administrative operations
    #[command(subcommand)]
    Admin(AdminCommand),
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// List every file of every user
    Files,
    /// Delete a user's file and its metadata
    Delete {
        #[arg(long)]
        user: String,
        file_name: String,
    },
    /// Mark jobs left unfinished by an earlier process as failed
    Recover,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // RUST_LOG wins; --verbose only changes the default
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    if let Err(e) = run(args).await {
        match e.downcast_ref::<PipelineError>() {
            Some(pe) => error!("{} error: {:#}", pe.kind(), e),
            None => error!("{:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let default_config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = PipelineConfig::load_config(config_path).context("Failed to load configuration")?;
    let app = App::build(cfg).context("Failed to initialise pipeline")?;

    let token = args
        .token
        .clone()
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .ok_or_else(|| anyhow!("No token given: pass --token or set {}", TOKEN_ENV))?;
    let identity = app.identify(&token).await.context("Authentication failed")?;
    info!("Authenticated as {} ({:?})", identity.username, identity.role);

    match args.command {
        Command::Upload { path, name } => upload(&app, &identity, &path, name).await,
        Command::Submit { file_name } => submit(&app, &identity, &file_name).await,
        Command::Progress { tracking_id } => {
            let view = app.service().query_progress(&identity, &tracking_id).await?;
            print_json(&view)
        }
        Command::Files => print_json(&app.service().list_user_files(&identity).await?),
        Command::History => print_json(&app.service().user_activity(&identity).await?),
        Command::Url { file_name, upload } => {
            let url = if upload {
                app.service().upload_url(&identity, &file_name)?
            } else {
                app.service().download_url(&identity, &file_name)?
            };
            print_json(&url)
        }
        Command::Admin(cmd) => admin(&app, &identity, cmd).await,
    }
}

async fn upload(app: &App, identity: &Identity, path: &Path, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("Path has no file name: {}", path.display()))?,
    };
    let key = object_key(&identity.username, &name)?;

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();

    let written = app
        .storage()
        .put(&key, ObjectBody::new(Some(len), Box::new(file)))
        .await
        .with_context(|| format!("Failed to store {}", key))?;
    info!("📤 Stored {} as {} ({} bytes)", path.display(), key, written);

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Uploaded<'a> {
        file_name: &'a str,
        key: &'a str,
        bytes: u64,
    }
    print_json(&Uploaded {
        file_name: &name,
        key: &key,
        bytes: written,
    })
}

/// Submit, then poll progress until the job reaches a terminal status
async fn submit(app: &App, identity: &Identity, file_name: &str) -> Result<()> {
    let service = app.service();
    let receipt = service.submit_upload(identity, file_name).await?;
    print_json(&receipt)?;

    let mut last = None;
    let final_view = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling {}", receipt.tracking_id);
                app.shutdown().await;
                break service.query_progress(identity, &receipt.tracking_id).await?;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let view = service.query_progress(identity, &receipt.tracking_id).await?;
                if last != Some(view) {
                    info!("{}: {}% ({})", receipt.tracking_id, view.percent, view.status);
                    last = Some(view);
                }
                if view.status.is_terminal() {
                    break view;
                }
            }
        }
    };

    service.pool().wait_idle().await;
    print_json(&final_view)?;
    if final_view.status == ProgressStatus::Error {
        bail!("Transcoding failed for {}", file_name);
    }
    Ok(())
}

async fn admin(app: &App, identity: &Identity, cmd: AdminCommand) -> Result<()> {
    let service = app.service();
    match cmd {
        AdminCommand::Files => print_json(&service.list_all_files(identity).await?),
        AdminCommand::Delete { user, file_name } => {
            service.delete_file(identity, &user, &file_name).await?;
            info!("Deleted {}/{}", user, file_name);
            Ok(())
        }
        AdminCommand::Recover => {
            let recovered = service.recover_interrupted(identity).await?;
            if !recovered.is_empty() {
                info!("✅ Recovered {} interrupted job(s)", recovered.len());
            }
            print_json(&recovered)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    println!("{}", json);
    Ok(())
}
