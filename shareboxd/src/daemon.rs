use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sharebox_api::ShareboxClient;

use crate::sync::backoff::Backoff;
use crate::sync::conflict::AcceptRemote;
use crate::sync::events::SyncEvent;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::store::SyncStore;

const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_DATA_DIR_NAME: &str = "shareboxd";
const RETRY_BASE_MS: u64 = 500;
const RETRY_MAX_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_url: String,
    pub token: String,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub poll_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server_url =
            std::env::var("SHAREBOX_SERVER_URL").context("SHAREBOX_SERVER_URL is not set")?;
        let token = std::env::var("SHAREBOX_TOKEN").context("SHAREBOX_TOKEN is not set")?;
        let data_dir = std::env::var("SHAREBOX_DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::data_dir().map(|base| base.join(DEFAULT_DATA_DIR_NAME)))
            .context("no data directory available")?;
        let staging_dir = std::env::var("SHAREBOX_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("staging"));
        let poll_interval =
            Duration::from_secs(read_u64_env("SHAREBOX_POLL_SECS", DEFAULT_POLL_SECS));
        Ok(Self {
            server_url,
            token,
            data_dir,
            staging_dir,
            poll_interval,
        })
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    orchestrator: Arc<SyncOrchestrator>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;

        let client = ShareboxClient::new(&config.server_url, config.token.clone())?;
        let db_path = config.data_dir.join("engine.db");
        let store = SyncStore::new(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .await
            .context("failed to open the sync store")?;
        let (orchestrator, mut events) = SyncOrchestrator::bootstrap(
            client,
            store,
            config.staging_dir.clone(),
            Arc::new(AcceptRemote),
        )
        .await?;

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });

        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// Polls the server on an interval, retrying failed passes with
    /// exponential backoff, until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            server_url = %self.config.server_url,
            poll_secs = self.config.poll_interval.as_secs(),
            "daemon started"
        );
        let backoff = Backoff::new(
            Duration::from_millis(RETRY_BASE_MS),
            Duration::from_millis(RETRY_MAX_MS),
            true,
        );
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.orchestrator.sync_and_wait().await {
                        Ok(()) => failures = 0,
                        Err(error) => {
                            failures += 1;
                            let delay = backoff.delay(failures.saturating_sub(1));
                            tracing::warn!(%error, failures, ?delay, "sync pass failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    tracing::info!("shutting down");
                    self.orchestrator.stop_sync();
                    return Ok(());
                }
            }
        }
    }

    /// Runs exactly one sync pass and returns.
    pub async fn run_once(self) -> anyhow::Result<()> {
        self.orchestrator.sync_and_wait().await?;
        Ok(())
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncStarted => tracing::info!("sync started"),
        SyncEvent::SyncDelayed => tracing::debug!("sync delayed behind a running pass"),
        SyncEvent::SyncDone => tracing::info!("sync done"),
        SyncEvent::SyncStopping => tracing::info!("sync stopping"),
        SyncEvent::SharingGroupsDownloaded {
            created,
            updated,
            removed,
        } => tracing::debug!(created, updated, removed, "sharing groups refreshed"),
        SyncEvent::WillStartDownloads {
            content_count,
            deletion_count,
        } => tracing::info!(content_count, deletion_count, "starting downloads"),
        SyncEvent::WillStartUploads {
            content_count,
            deletion_count,
        } => tracing::info!(content_count, deletion_count, "starting uploads"),
        SyncEvent::SingleFileUploadComplete { attr } => {
            tracing::debug!(file_uuid = %attr.file_uuid, "file uploaded")
        }
        SyncEvent::SingleFileUploadGone { attr, reason } => {
            tracing::warn!(file_uuid = %attr.file_uuid, reason = reason.as_str(), "file gone during upload")
        }
        SyncEvent::ContentUploadsCompleted { count } => {
            tracing::info!(count, "content uploads committed")
        }
        SyncEvent::UploadDeletionsCompleted { count } => {
            tracing::info!(count, "upload deletions committed")
        }
        SyncEvent::SharingGroupUploadComplete { sharing_group_uuid } => {
            tracing::info!(%sharing_group_uuid, "sharing group update committed")
        }
        SyncEvent::FileGroupDownloadComplete { group } => {
            tracing::info!(files = group.files.len(), "file group downloaded")
        }
        SyncEvent::FileGroupDownloadGone { group } => {
            tracing::warn!(files = group.files.len(), "file group finished with gone files")
        }
        SyncEvent::DownloadDeletions { files } => {
            tracing::info!(count = files.len(), "server deletions applied")
        }
    }
}
