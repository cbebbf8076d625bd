use super::feed::{GenericFeed, GitHubReleaseFeed, ReleaseManifest, UpdateFeed};
use super::{UpdateError, Version};
use crate::config::UpdateConfig;
use crate::context::SupervisorContext;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use hostgate_types::{
    DownloadEvent, DownloadProgress, DownloadedUpdate, SupervisorEvent, UpdateCheckFailure,
    UpdateCheckInfo, UpdateFeedKind,
};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DISABLED_MESSAGE: &str = "The update feature is only available after the package.";
pub const ALL_FEEDS_FAILED_MESSAGE: &str = "All update servers failed";
pub const NETWORK_ERROR_MESSAGE: &str = "Network error";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Checks for, downloads and hands off application updates
pub struct UpdateCoordinator {
    config: UpdateConfig,
    context: Arc<SupervisorContext>,
    client: reqwest::Client,
    primary: Arc<dyn UpdateFeed>,
    fallback: Arc<dyn UpdateFeed>,
    /// Manifest of the newer release found by the last check
    pending: Mutex<Option<ReleaseManifest>>,
    downloaded: Mutex<Option<DownloadedUpdate>>,
}

impl UpdateCoordinator {
    /// Coordinator using the configured primary feed and GitHub fallback
    pub fn new(
        config: UpdateConfig,
        context: Arc<SupervisorContext>,
        client_id: &str,
    ) -> Result<Self, UpdateError> {
        let user_agent = format!("{}/{}", config.app_name, config.current_version);
        let primary = GenericFeed::new(config.primary_feed_url(), &user_agent, client_id);
        let fallback =
            GitHubReleaseFeed::new(&config.fallback_owner, &config.fallback_repo, &user_agent);
        Self::with_feeds(config, context, Arc::new(primary), Arc::new(fallback))
    }

    pub fn with_feeds(
        config: UpdateConfig,
        context: Arc<SupervisorContext>,
        primary: Arc<dyn UpdateFeed>,
        fallback: Arc<dyn UpdateFeed>,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", config.app_name, config.current_version))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            config,
            context,
            client,
            primary,
            fallback,
            pending: Mutex::new(None),
            downloaded: Mutex::new(None),
        })
    }

    pub fn active_feed(&self) -> UpdateFeedKind {
        self.context.feed_state().active
    }

    /// Look for a newer release.
    ///
    /// The first failure on the primary feed switches to the fallback for
    /// the rest of the run and retries there right away.
    pub async fn check_for_updates(&self) -> Result<UpdateCheckInfo, UpdateCheckFailure> {
        if !self.config.enabled {
            return Err(UpdateCheckFailure::new(DISABLED_MESSAGE, "updates are disabled"));
        }

        let active = self.active_feed();
        match self.check_feed(active).await {
            Ok(info) => Ok(info),
            Err(e) if active == UpdateFeedKind::Primary => {
                warn!(feed = %self.primary.describe(), error = %e, "Primary update feed failed, switching to fallback");
                self.context.switch_to_fallback();

                self.check_feed(UpdateFeedKind::Fallback)
                    .await
                    .map_err(|e| {
                        error!(feed = %self.fallback.describe(), error = %e, "Fallback update feed failed");
                        UpdateCheckFailure::new(ALL_FEEDS_FAILED_MESSAGE, e)
                    })
            }
            Err(e) => {
                error!(feed = %self.fallback.describe(), error = %e, "Update check failed");
                Err(UpdateCheckFailure::new(NETWORK_ERROR_MESSAGE, e))
            }
        }
    }

    async fn check_feed(&self, kind: UpdateFeedKind) -> Result<UpdateCheckInfo, UpdateError> {
        let feed = match kind {
            UpdateFeedKind::Primary => &self.primary,
            UpdateFeedKind::Fallback => &self.fallback,
        };
        debug!(feed = %feed.describe(), "Checking for updates");

        let manifest = feed.latest(&self.client).await?;
        let current: Version = self.config.current_version.parse()?;
        let latest: Version = manifest.version.parse()?;
        let update_available = latest > current;

        let info = UpdateCheckInfo {
            update_available,
            current_version: current.to_string(),
            new_version: latest.to_string(),
            feed: kind,
        };

        if update_available {
            info!(current = %current, new = %latest, feed = %kind, "Update available");
            *lock(&self.pending) = Some(manifest);
            self.context.emit(SupervisorEvent::UpdateAvailable {
                current_version: info.current_version.clone(),
                new_version: info.new_version.clone(),
            });
        } else {
            debug!(current = %current, latest = %latest, "No update available");
            *lock(&self.pending) = None;
            self.context.emit(SupervisorEvent::UpdateNotAvailable {
                current_version: info.current_version.clone(),
                new_version: info.new_version.clone(),
            });
        }

        Ok(info)
    }

    /// Check after the initial delay, then on every interval. Returns `None`
    /// when updates are disabled.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Update checks disabled");
            return None;
        }

        let coordinator = Arc::clone(self);
        let initial_delay = self.config.initial_delay;
        let interval = self.config.check_interval;
        Some(tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match coordinator.check_for_updates().await {
                    Ok(info) => debug!(available = info.update_available, feed = %info.feed, "Scheduled update check done"),
                    Err(failure) => warn!(%failure, "Scheduled update check failed"),
                }
            }
        }))
    }

    /// Download the release found by the last check.
    ///
    /// Failures are reported through `on_progress` as
    /// [`DownloadEvent::Error`]; `on_complete` runs only for a verified
    /// download.
    pub async fn start_download<P, C>(&self, mut on_progress: P, on_complete: C)
    where
        P: FnMut(DownloadEvent) + Send,
        C: FnOnce(DownloadedUpdate) + Send,
    {
        let manifest = lock(&self.pending).clone();
        let result = match manifest {
            Some(manifest) => self.download(&manifest, &mut on_progress).await,
            None => Err(UpdateError::NoPendingUpdate),
        };

        match result {
            Ok(update) => {
                info!(version = %update.version, path = %update.path.display(), "Update downloaded");
                *lock(&self.downloaded) = Some(update.clone());
                on_complete(update);
            }
            Err(e) => {
                error!(error = %e, "Update download failed");
                on_progress(DownloadEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn download<P>(
        &self,
        manifest: &ReleaseManifest,
        on_progress: &mut P,
    ) -> Result<DownloadedUpdate, UpdateError>
    where
        P: FnMut(DownloadEvent) + Send,
    {
        let file = manifest.primary_file().ok_or(UpdateError::NoFiles)?;
        let url = manifest.resolve_url(&file.url)?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| UpdateError::InvalidUrl(url.to_string()))?
            .to_string();

        let dir = &self.config.download_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|source| UpdateError::Io {
            path: dir.clone(),
            source,
        })?;
        let destination = dir.join(&name);
        let partial = dir.join(format!("{name}.part"));

        info!(%url, path = %destination.display(), "Downloading update");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = file.size.or(response.content_length());
        let mut out = tokio::fs::File::create(&partial)
            .await
            .map_err(io_error(&partial))?;
        let mut hasher = Sha512::new();
        let mut transferred: u64 = 0;
        let started = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e.into());
                }
            };
            out.write_all(&chunk).await.map_err(io_error(&partial))?;
            hasher.update(&chunk);
            transferred += chunk.len() as u64;
            on_progress(DownloadEvent::Progress(progress(transferred, total, started)));
        }
        out.flush().await.map_err(io_error(&partial))?;
        drop(out);

        if let Some(expected) = &file.sha512 {
            let actual = STANDARD.encode(hasher.finalize());
            if &actual != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(UpdateError::ChecksumMismatch(destination));
            }
        }

        tokio::fs::rename(&partial, &destination)
            .await
            .map_err(io_error(&destination))?;

        Ok(DownloadedUpdate {
            version: manifest.version.clone(),
            path: destination,
        })
    }

    /// The verified download, if any
    pub fn downloaded(&self) -> Option<DownloadedUpdate> {
        lock(&self.downloaded).clone()
    }

    /// Tell the host to exit and run the downloaded installer. Returns
    /// `false` when nothing has been downloaded.
    pub fn quit_and_install(&self) -> bool {
        match self.downloaded() {
            Some(update) => {
                info!(version = %update.version, "Quitting to install update");
                self.context.emit(SupervisorEvent::QuitAndInstall {
                    installer: update.path,
                });
                true
            }
            None => {
                warn!("Install requested but no update has been downloaded");
                false
            }
        }
    }

    pub fn download_dir(&self) -> &PathBuf {
        &self.config.download_dir
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> UpdateError {
    let path = path.to_path_buf();
    move |source| UpdateError::Io { path, source }
}

fn progress(transferred: u64, total: Option<u64>, started: Instant) -> DownloadProgress {
    let elapsed = started.elapsed().as_secs_f64();
    let bytes_per_second = if elapsed > 0.0 {
        (transferred as f64 / elapsed) as u64
    } else {
        transferred
    };
    let percent = match total {
        Some(total) if total > 0 => (transferred as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    };

    DownloadProgress {
        transferred,
        total,
        percent,
        bytes_per_second,
    }
}
