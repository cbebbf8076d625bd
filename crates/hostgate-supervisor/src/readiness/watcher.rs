use super::ReadinessError;
use hostgate_types::ReadinessMessage;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How changes to the channel file are noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Events,
    Polling,
}

/// An active watch on the readiness file; dropping it stops watching
pub struct BusWatch {
    mode: WatchMode,
    _watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl BusWatch {
    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    pub fn stop(self) {}
}

impl Drop for BusWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for BusWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusWatch").field("mode", &self.mode).finish()
    }
}

/// Read the leading `window` bytes of the channel file and parse them.
///
/// NUL padding and whitespace around the document are ignored. A missing or
/// empty file is `Ok(None)`.
pub async fn read_message(
    path: &Path,
    window: usize,
) -> Result<Option<ReadinessMessage>, ReadinessError> {
    let raw = match read_window(path, window).await? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    parse_window(&raw)
}

async fn read_window(path: &Path, window: usize) -> Result<Option<Vec<u8>>, ReadinessError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReadinessError::io(path, e)),
    };

    let mut raw = Vec::with_capacity(window.min(4096));
    file.take(window as u64)
        .read_to_end(&mut raw)
        .await
        .map_err(|e| ReadinessError::io(path, e))?;
    Ok(Some(raw))
}

fn parse_window(raw: &[u8]) -> Result<Option<ReadinessMessage>, ReadinessError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Other
    );
    kind_matches
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Watch `path` and hand every valid message to `on_message`.
///
/// The parent directory is watched (so a truncate-and-rewrite is seen even
/// if the file is replaced) and events are filtered by file name. The file
/// is read once right after the watch is armed, which covers a write that
/// landed before watching started. If no native watcher can be created the
/// file is polled every `poll_interval` instead.
pub fn watch_file<F>(
    path: PathBuf,
    window: usize,
    poll_interval: Duration,
    on_message: F,
) -> Result<BusWatch, ReadinessError>
where
    F: Fn(ReadinessMessage) + Send + Sync + 'static,
{
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| ReadinessError::NoParent(path.clone()))?;
    let file_name = path
        .file_name()
        .map(OsString::from)
        .ok_or_else(|| ReadinessError::NoParent(path.clone()))?;

    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let watcher = match create_watcher(&parent, file_name, tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(path = %parent.display(), error = %e, "File watching unavailable, polling readiness channel");
            None
        }
    };

    let mode = if watcher.is_some() {
        WatchMode::Events
    } else {
        WatchMode::Polling
    };
    info!(path = %path.display(), ?mode, "Watching readiness channel");

    let task = match mode {
        WatchMode::Events => tokio::spawn(event_loop(path, window, rx, on_message)),
        WatchMode::Polling => tokio::spawn(poll_loop(path, window, poll_interval, on_message)),
    };

    Ok(BusWatch {
        mode,
        _watcher: watcher,
        task,
    })
}

fn create_watcher(
    parent: &Path,
    file_name: OsString,
    tx: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if is_relevant(&event, &file_name) {
                    let _ = tx.send(());
                }
            }
            Err(e) => debug!(error = %e, "Readiness watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn dispatch<F>(path: &Path, raw: &[u8], on_message: &F)
where
    F: Fn(ReadinessMessage),
{
    match parse_window(raw) {
        Ok(Some(message)) => on_message(message),
        Ok(None) => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Ignoring unparsable readiness content"),
    }
}

async fn event_loop<F>(
    path: PathBuf,
    window: usize,
    mut changes: mpsc::UnboundedReceiver<()>,
    on_message: F,
) where
    F: Fn(ReadinessMessage) + Send + Sync + 'static,
{
    loop {
        match read_window(&path, window).await {
            Ok(Some(raw)) => dispatch(&path, &raw, &on_message),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Failed to read readiness channel"),
        }

        if changes.recv().await.is_none() {
            break;
        }
        // Coalesce bursts of events for a single write
        while changes.try_recv().is_ok() {}
    }
}

async fn poll_loop<F>(path: PathBuf, window: usize, interval: Duration, on_message: F)
where
    F: Fn(ReadinessMessage) + Send + Sync + 'static,
{
    let mut last_seen: Option<Vec<u8>> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match read_window(&path, window).await {
            Ok(Some(raw)) => {
                if last_seen.as_deref() != Some(raw.as_slice()) {
                    dispatch(&path, &raw, &on_message);
                    last_seen = Some(raw);
                }
            }
            Ok(None) => last_seen = None,
            Err(e) => debug!(error = %e, "Failed to poll readiness channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_strips_padding() {
        let mut raw = b"\0\0  {\"server\":{\"listen\":{\"ip\":\"127.0.0.1\",\"port\":4321}}}\n".to_vec();
        raw.extend_from_slice(&[0u8; 64]);

        let message = parse_window(&raw).unwrap().unwrap();
        assert_eq!(message.listen_port(), 4321);
        assert_eq!(message.listen_ip(), "127.0.0.1");
    }

    #[test]
    fn test_parse_window_empty_and_invalid() {
        assert!(parse_window(b"").unwrap().is_none());
        assert!(parse_window(&[0u8; 16]).unwrap().is_none());
        assert!(parse_window(b"  \n\t").unwrap().is_none());
        assert!(parse_window(b"{\"server\":").is_err());
    }

    #[tokio::test]
    async fn test_read_message_respects_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bus");
        let body = r#"{"server":{"listen":{"ip":"","port":7000}}}"#;
        tokio::fs::write(&path, format!("{body}{}", " ".repeat(1024)))
            .await
            .unwrap();

        let message = read_message(&path, body.len()).await.unwrap().unwrap();
        assert_eq!(message.listen_port(), 7000);

        // Truncated document does not parse
        assert!(read_message(&path, body.len() - 1).await.is_err());
    }

    #[tokio::test]
    async fn test_read_message_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(
            read_message(&dir.path().join("absent"), 1024)
                .await
                .unwrap()
                .is_none()
        );
    }
}
