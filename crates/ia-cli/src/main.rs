//! Image attachments command line
//!
//! `ia identify <file>` describes one file; `ia ingest <file>...` attaches
//! files to a new document in local storage and prints what was stored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use ia_attachments::ImageAttachments;
use ia_core::{Id, ImageEngine, ImagesConfig};
use ia_storage::{Document, LocalStorage};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ia", version, about = "Image attachment storage and derivatives")]
struct Cli {
    /// Image engine, overriding IA_IMAGE_ENGINE
    #[arg(long, global = true)]
    engine: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print image metadata as JSON
    Identify { file: PathBuf },
    /// Attach files to a new document and print a summary
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Storage root, overriding IA_STORAGE_PATH
        #[arg(long)]
        storage: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct IngestSummary {
    document: Id,
    attachments: Vec<AttachmentSummary>,
}

#[derive(Serialize)]
struct AttachmentSummary {
    filename: String,
    filesize: u64,
    content_type: String,
    digest: String,
    image: Option<ImageSummary>,
}

#[derive(Serialize)]
struct ImageSummary {
    format: String,
    width: u32,
    height: u32,
    /// Derivative key -> stored size in bytes
    derivatives: BTreeMap<String, usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = ImagesConfig::from_env().context("invalid configuration")?;
    if let Some(engine) = &cli.engine {
        config.engine = engine.parse::<ImageEngine>()?;
    }

    match cli.command {
        Command::Identify { file } => identify(&config, &file).await,
        Command::Ingest { files, storage } => {
            if let Some(storage) = storage {
                config.storage_path = storage;
            }
            ingest(config, &files).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ia_attachments=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

async fn identify(config: &ImagesConfig, file: &Path) -> anyhow::Result<()> {
    let images = ia_images::engine(config.engine);
    if !images.health_check().await {
        warn!(engine = images.name(), "Image engine reports unhealthy");
    }

    match images.identify(file).await {
        Ok(metadata) => {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
        Err(e) if e.is_unrecognized() => {
            println!("not an image");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to identify {}", file.display())),
    }
}

async fn ingest(config: ImagesConfig, files: &[PathBuf]) -> anyhow::Result<()> {
    info!(
        storage = %config.storage_path.display(),
        engine = ?config.engine,
        "Ingesting {} file(s)",
        files.len()
    );

    let storage = Arc::new(LocalStorage::new(&config.storage_path));
    let attachments = ImageAttachments::from_storage(storage, config)?;

    let mut doc = Document::new();
    for file in files {
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("not a file: {}", file.display()))?;
        let buffer = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;

        let derivation = attachments
            .add_image(&mut doc, &filename, Bytes::from(buffer))
            .await
            .with_context(|| format!("failed to attach {}", filename))?;
        info!(%filename, ?derivation, "Attached");
    }
    attachments.save(&doc).await?;

    // Read back what a listing would see
    attachments.partial_load(&mut doc).await?;

    let summary = IngestSummary {
        document: doc.id,
        attachments: doc
            .attachments
            .iter()
            .map(|a| AttachmentSummary {
                filename: a.filename.clone(),
                filesize: a.filesize,
                content_type: a.content_type.clone(),
                digest: a.digest.clone(),
                image: a.metadata.as_ref().map(|m| ImageSummary {
                    format: m.format.clone(),
                    width: m.width,
                    height: m.height,
                    derivatives: a
                        .derivatives
                        .iter()
                        .map(|(key, data)| (key.clone(), data.len()))
                        .collect(),
                }),
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
