use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storysync::{
    ClientMessage, Connectivity, ConnectivityProbe, GeoPoint, HttpDelivery, LocationFilter,
    NewSubmission, OutboxQueue, Photo, SavedQuery, SavedSort, SavedStories, SavedStory,
    SharedCredentials, StorySync, SubmissionGate, SubmitResult, SyncConfig, SyncCoordinator,
    TracingNotifier, storage::StoreHandle,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "storysync")]
#[command(about = "Offline-first story submission and outbox sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a story, queuing it when delivery is not possible
    Submit {
        #[arg(long)]
        description: String,
        #[arg(long)]
        photo: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        lat: Option<f64>,
        #[arg(long, allow_negative_numbers = true)]
        lon: Option<f64>,
        #[arg(long)]
        token: Option<String>,
        /// Skip the delivery attempt and queue directly
        #[arg(long)]
        offline: bool,
    },
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
    /// Drain the outbox once and print the report
    Drain,
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
    /// Run the background worker until interrupted, reading JSON messages from stdin
    Run {
        #[arg(long, default_value_t = 30)]
        probe_interval_secs: u64,
    },
}

#[derive(Subcommand)]
enum OutboxAction {
    List,
    Clear,
}

#[derive(Subcommand)]
enum SavedAction {
    List {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value = "all")]
        filter: String,
        #[arg(long, default_value = "newest")]
        sort: String,
    },
    Add {
        /// Story JSON as returned by the API
        #[arg(long)]
        json: String,
    },
    Remove {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Submit {
            description,
            photo,
            lat,
            lon,
            token,
            offline,
        } => submit(&config, description, &photo, lat, lon, token, offline).await,
        Command::Outbox { action } => {
            let outbox = OutboxQueue::new(StoreHandle::new(config.store_options()));
            match action {
                OutboxAction::List => {
                    for record in outbox.list_all().await? {
                        println!(
                            "{}\t{}\t{}\t{} bytes",
                            record.id.unwrap_or_default(),
                            record.enqueued_at.to_rfc3339(),
                            record.description,
                            record.photo.len()
                        );
                    }
                }
                OutboxAction::Clear => {
                    outbox.clear().await?;
                    info!("outbox cleared");
                }
            }
            Ok(())
        }
        Command::Drain => {
            let coordinator = SyncCoordinator::new(
                OutboxQueue::new(StoreHandle::new(config.store_options())),
                Arc::new(HttpDelivery::new(&config.api_base_url, config.request_timeout)?),
                Arc::new(TracingNotifier),
            )
            .with_policy(config.drain_policy);
            let report = coordinator.drain().await;
            println!("{:#?}", report);
            Ok(())
        }
        Command::Saved { action } => {
            let saved = SavedStories::new(StoreHandle::new(config.store_options()));
            match action {
                SavedAction::List {
                    query,
                    filter,
                    sort,
                } => {
                    let query = SavedQuery {
                        text: query.unwrap_or_default(),
                        filter: filter.parse::<LocationFilter>().map_err(anyhow::Error::msg)?,
                        sort: sort.parse::<SavedSort>().map_err(anyhow::Error::msg)?,
                    };
                    for story in saved.list(&query).await? {
                        println!("{}", serde_json::to_string(&story)?);
                    }
                }
                SavedAction::Add { json } => {
                    let story: SavedStory =
                        serde_json::from_str(&json).context("story JSON is malformed")?;
                    saved.save(story).await?;
                }
                SavedAction::Remove { id } => saved.remove(&id).await?,
            }
            Ok(())
        }
        Command::Run {
            probe_interval_secs,
        } => run(config, Duration::from_secs(probe_interval_secs.max(1))).await,
    }
}

async fn submit(
    config: &SyncConfig,
    description: String,
    photo_path: &Path,
    lat: Option<f64>,
    lon: Option<f64>,
    token: Option<String>,
    offline: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(photo_path)
        .await
        .with_context(|| format!("failed to read {}", photo_path.display()))?;
    let mut photo = Photo::new(bytes, mime_for(photo_path));
    if let Some(name) = photo_path.file_name().and_then(|n| n.to_str()) {
        photo = photo.with_file_name(name);
    }

    let mut submission = NewSubmission::new(description, photo);
    if let Some(location) = GeoPoint::from_parts(lat, lon)? {
        submission = submission.with_location(location);
    }

    let gate = SubmissionGate::new(
        OutboxQueue::new(StoreHandle::new(config.store_options())),
        Arc::new(HttpDelivery::new(&config.api_base_url, config.request_timeout)?),
        Connectivity::new(!offline),
        Arc::new(SharedCredentials::new(token)),
    )
    .with_max_photo_bytes(config.max_photo_bytes);

    match gate.submit(submission).await? {
        SubmitResult::Delivered(response) => println!("published: {}", response.message),
        SubmitResult::Queued { id, reason } => match reason {
            Some(reason) => println!("queued as #{} ({})", id, reason),
            None => println!("queued as #{}", id),
        },
    }
    Ok(())
}

async fn run(config: SyncConfig, probe_interval: Duration) -> Result<()> {
    let connectivity = Connectivity::new(false);
    let probe = ConnectivityProbe::spawn(
        connectivity.clone(),
        reqwest::Client::new(),
        config.api_base_url.clone(),
        probe_interval,
    );
    let app = StorySync::builder(config)
        .connectivity(connectivity)
        .start()
        .context("failed to start background worker")?;

    let mut foreground = app.bus().subscribe_foreground();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match ClientMessage::from_json(&line) {
                    Ok(message) => {
                        app.bus().post_to_background(message);
                    }
                    Err(err) => warn!(error = %err, "ignoring input line"),
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    error!(error = %err, "stdin closed");
                    stdin_open = false;
                }
            },
            message = foreground.recv() => match message {
                Ok(message) => println!("{}", message.to_json()?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "foreground messages dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    probe.stop().await;
    app.shutdown().await?;
    info!("background worker stopped");
    Ok(())
}

fn mime_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storysync=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

