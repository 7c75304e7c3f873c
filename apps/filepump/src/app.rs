//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use filepump_service::{FileClient, FileServer, NoteLog, generate_token};
use filepump_transfer::{
    Direction, FileSource, ProgressEvents, TransferContext, TransferSession,
    calculate_file_checksum,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::Command;
use crate::config::AppConfig;

pub async fn run(command: Command, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Serve { .. } => serve(config).await,
        Command::List => list(config).await,
        Command::Download { name, out } => {
            let out = out.unwrap_or_else(|| PathBuf::from(&name));
            download(config, &name, &out).await
        }
        Command::Upload { path, name } => upload(config, &path, name.as_deref()).await,
        Command::UploadProgress { path, name } => {
            upload_progress(config, &path, name.as_deref()).await
        }
        Command::Token => {
            println!("{}", generate_token());
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    if config.token.is_none() {
        warn!("no token configured, accepting unauthenticated calls");
    }
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("failed to create {}", config.storage_dir.display()))?;

    let server = FileServer::new(config.server())?;
    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

async fn list(config: AppConfig) -> anyhow::Result<()> {
    let client = FileClient::new(config.client())?;
    let ctx = interruptible();
    for name in client.list_files(&ctx).await? {
        println!("{name}");
    }
    Ok(())
}

async fn download(config: AppConfig, name: &str, out: &Path) -> anyhow::Result<()> {
    let client = FileClient::new(config.client())?;
    let ctx = interruptible();
    let (session, progress) = observed(&config, TransferSession::new(Direction::Download))?;

    let received = client
        .download_to_file(&ctx, name, out, &session)
        .await
        .with_context(|| format!("download of {name} failed"))?;
    let _ = progress.await;
    info!(file = name, out = %out.display(), bytes = received, "saved");
    Ok(())
}

async fn upload(config: AppConfig, path: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let client = FileClient::new(config.client())?;
    let ctx = interruptible();
    let (session, progress) = observed(&config, TransferSession::new(Direction::Upload))?;

    let response = client
        .upload_file(&ctx, path, name, &session)
        .await
        .with_context(|| format!("upload of {} failed", path.display()))?;
    let _ = progress.await;
    verify_upload(path, &response.checksum).await?;
    println!("{} bytes, sha256 {}", response.size, response.checksum);
    Ok(())
}

/// Fails if the checksum the server reports differs from the local file's.
async fn verify_upload(path: &Path, reported: &str) -> anyhow::Result<()> {
    let local = calculate_file_checksum(path)
        .await
        .with_context(|| format!("failed to checksum {}", path.display()))?;
    if !local.eq_ignore_ascii_case(reported) {
        anyhow::bail!(
            "checksum mismatch for {}: local {local}, server {reported}",
            path.display()
        );
    }
    Ok(())
}

async fn upload_progress(
    config: AppConfig,
    path: &Path,
    name: Option<&str>,
) -> anyhow::Result<()> {
    let client = FileClient::new(config.client())?;
    let ctx = interruptible();
    let (session, progress) = observed(&config, TransferSession::duplex(Direction::Upload))?;
    let source = FileSource::open(path, config.chunk_size).await?;

    let mut notes = NoteLog::new();
    let report = client
        .upload_and_notify_progress(&ctx, source, name, &mut notes, &session)
        .await
        .with_context(|| format!("upload of {} failed", path.display()))?;
    let _ = progress.await;
    for note in notes.notes() {
        println!("{note}");
    }
    info!(bytes = report.sent, notes = report.received, "upload with progress done");
    Ok(())
}

/// A context cancelled by Ctrl-C.
fn interruptible() -> TransferContext {
    let ctx = TransferContext::new();
    let on_interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    ctx
}

/// Attaches a progress feed to `session` and logs it from a task.
fn observed(
    config: &AppConfig,
    mut session: TransferSession,
) -> anyhow::Result<(Mutex<TransferSession>, JoinHandle<()>)> {
    let events = config.transfer().reporter()?.observe(&mut session)?;
    Ok((Mutex::new(session), tokio::spawn(log_progress(events))))
}

async fn log_progress(mut events: ProgressEvents) {
    while let Some(event) = events.recv().await {
        if event.is_terminal() {
            info!(session = %event.session_id, state = %event.state, "{}", event.message);
        } else {
            tracing::debug!(
                session = %event.session_id,
                bytes = event.bytes_transferred,
                "{}",
                event.message
            );
        }
    }
}
