//! Bounded pool of network transfers against interchangeable backends.
//!
//! Every attempt picks a backend instance at random. Failed attempts are
//! retried against a fresh pick until the retry budget is spent. Bytes are
//! either streamed to the caller as events or written to a cache file that
//! only appears under its final name once the transfer succeeded.

pub mod catalog;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::error_recovery::{RecoveryAction, RecoveryPolicy};

pub use catalog::{Catalog, CatalogListing, HttpCatalog};
pub use transport::{resolve_url, HttpTransport, TransferBody, Transport};

/// Where fetched bytes go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Delivered incrementally as `FetchEvent::Data`
    Pipe,
    /// Written to this file
    CacheFile(PathBuf),
}

/// Progress of a transfer, tagged with the caller's identifier
#[derive(Debug)]
pub enum FetchEvent {
    Started { tag: u64, instance: String, attempt: u32 },
    Data { tag: u64, bytes: Vec<u8> },
    Progress { tag: u64, received: u64, expected: Option<u64> },
    Completed { tag: u64, total: u64 },
    Failed { tag: u64, error: FetchError },
}

impl FetchEvent {
    pub fn tag(&self) -> u64 {
        match self {
            FetchEvent::Started { tag, .. }
            | FetchEvent::Data { tag, .. }
            | FetchEvent::Progress { tag, .. }
            | FetchEvent::Completed { tag, .. }
            | FetchEvent::Failed { tag, .. } => *tag,
        }
    }
}

/// One in-flight transfer
#[derive(Debug)]
pub struct Connection {
    pub instance: String,
    pub expecting: Option<u64>,
    pub progress: u64,
    pub destination: Destination,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl Connection {
    fn new(destination: Destination) -> Self {
        Self {
            instance: String::new(),
            expecting: None,
            progress: 0,
            destination,
            attempt: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub instances: Vec<String>,
    pub max_connections: usize,
    pub retry_budget: u32,
    pub read_timeout: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            instances: config.backend_instances.clone(),
            max_connections: config.max_connections,
            retry_budget: config.retry_budget,
            read_timeout: config.read_timeout(),
        }
    }
}

/// Removes a partially written cache file unless the transfer completed
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed partial file {}", self.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot remove partial file {}: {}", self.path.display(), e),
            }
        }
    }
}

enum Output {
    Pipe {
        tag: u64,
        events: mpsc::UnboundedSender<FetchEvent>,
        delivered: u64,
    },
    File {
        target: PathBuf,
        partial: PartialFile,
        file: Option<tokio::fs::File>,
    },
    Memory(Vec<u8>),
}

impl Output {
    fn for_file(target: &Path) -> Self {
        let mut part = target.as_os_str().to_owned();
        part.push(".part");
        Output::File {
            target: target.to_path_buf(),
            partial: PartialFile {
                path: PathBuf::from(part),
                committed: false,
            },
            file: None,
        }
    }

    async fn begin_attempt(&mut self) -> Result<(), FetchError> {
        match self {
            Output::Pipe { .. } => Ok(()),
            Output::File { partial, file, .. } => {
                if let Some(parent) = partial.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                *file = Some(tokio::fs::File::create(&partial.path).await?);
                Ok(())
            }
            Output::Memory(buf) => {
                buf.clear();
                Ok(())
            }
        }
    }

    /// Write a chunk that starts at byte `offset` of the response
    async fn write(&mut self, offset: u64, chunk: &[u8]) -> Result<(), FetchError> {
        match self {
            Output::Pipe { tag, events, delivered } => {
                let end = offset + chunk.len() as u64;
                if end <= *delivered {
                    return Ok(());
                }
                // A retried response repeats what the decoder already has
                let skip = delivered.saturating_sub(offset) as usize;
                *delivered = end;
                events
                    .send(FetchEvent::Data { tag: *tag, bytes: chunk[skip..].to_vec() })
                    .map_err(|_| FetchError::Cancelled)
            }
            Output::File { file: Some(file), .. } => Ok(file.write_all(chunk).await?),
            Output::File { file: None, .. } => Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cache file not open",
            ))),
            Output::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    async fn commit(&mut self) -> Result<(), FetchError> {
        if let Output::File { target, partial, file } = self {
            if let Some(mut file) = file.take() {
                file.flush().await?;
                file.sync_all().await?;
            }
            tokio::fs::rename(&partial.path, &*target).await?;
            partial.committed = true;
        }
        Ok(())
    }

    fn progress_sink(&self) -> Option<(u64, &mpsc::UnboundedSender<FetchEvent>)> {
        match self {
            Output::Pipe { tag, events, .. } => Some((*tag, events)),
            _ => None,
        }
    }
}

/// Handle to a spawned transfer; dropping it cancels the transfer
#[derive(Debug)]
pub struct FetchHandle {
    tag: u64,
    task: JoinHandle<()>,
}

impl FetchHandle {
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn cancel(self) {
        debug!("Cancelling transfer {}", self.tag);
        // Dropping aborts
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    settings: FetchSettings,
    slots: Arc<Semaphore>,
    policy: RecoveryPolicy,
}

#[derive(Clone)]
pub struct FetchManager {
    inner: Arc<Inner>,
}

impl FetchManager {
    pub fn new(transport: Arc<dyn Transport>, settings: FetchSettings) -> Self {
        let max_connections = settings.max_connections.max(1);
        Self {
            inner: Arc::new(Inner {
                transport,
                policy: RecoveryPolicy::new(settings.retry_budget),
                slots: Arc::new(Semaphore::new(max_connections)),
                settings: FetchSettings { max_connections, ..settings },
            }),
        }
    }

    /// Connection slots not held by a transfer
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Start a transfer; events for it carry `tag`.
    ///
    /// Exactly one terminal event (`Completed` or `Failed`) is sent unless
    /// the handle is dropped first.
    pub fn fetch(
        &self,
        tag: u64,
        locator: &str,
        destination: Destination,
        events: mpsc::UnboundedSender<FetchEvent>,
    ) -> FetchHandle {
        let inner = Arc::clone(&self.inner);
        let locator = locator.to_string();

        let task = tokio::spawn(async move {
            let mut output = match &destination {
                Destination::Pipe => Output::Pipe {
                    tag,
                    events: events.clone(),
                    delivered: 0,
                },
                Destination::CacheFile(path) => Output::for_file(path),
            };

            let event = match inner.run(&locator, destination, &mut output).await {
                Ok(total) => FetchEvent::Completed { tag, total },
                Err(error) => FetchEvent::Failed { tag, error },
            };
            // The receiver is gone when the engine shut down
            let _ = events.send(event);
        });

        FetchHandle { tag, task }
    }

    /// Fetch into `path`, reusing an existing file without network access
    pub async fn fetch_file(&self, locator: &str, path: &Path) -> Result<u64, FetchError> {
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            if metadata.is_file() {
                debug!("Cache hit for {} at {}", locator, path.display());
                return Ok(metadata.len());
            }
        }

        let mut output = Output::for_file(path);
        self.inner
            .run(locator, Destination::CacheFile(path.to_path_buf()), &mut output)
            .await
    }

    /// Fetch a whole response into memory
    pub async fn fetch_bytes(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let mut output = Output::Memory(Vec::new());
        self.inner.run(locator, Destination::Pipe, &mut output).await?;
        match output {
            Output::Memory(bytes) => Ok(bytes),
            _ => Ok(Vec::new()),
        }
    }
}

fn pick_instance(instances: &[String]) -> Option<String> {
    instances.choose(&mut rand::thread_rng()).cloned()
}

impl Inner {
    async fn run(&self, locator: &str, destination: Destination, output: &mut Output) -> Result<u64, FetchError> {
        if self.settings.instances.is_empty() {
            return Err(FetchError::NoBackends);
        }

        // Held until the transfer ends, however it ends
        let _permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        let mut connection = Connection::new(destination);

        loop {
            connection.attempt += 1;
            connection.instance = pick_instance(&self.settings.instances).ok_or(FetchError::NoBackends)?;
            connection.expecting = None;
            connection.progress = 0;

            if let Some((tag, events)) = output.progress_sink() {
                let _ = events.send(FetchEvent::Started {
                    tag,
                    instance: connection.instance.clone(),
                    attempt: connection.attempt,
                });
            }

            let error = match self.attempt(locator, &mut connection, output).await {
                Ok(()) => {
                    output.commit().await?;
                    debug!(
                        "Fetched {} ({} bytes) from {} on attempt {}",
                        locator, connection.progress, connection.instance, connection.attempt
                    );
                    return Ok(connection.progress);
                }
                Err(error) => error,
            };

            match self.policy.on_fetch_error(&error, connection.attempt) {
                RecoveryAction::Retry => {
                    debug!("Attempt {} for {} via {} failed: {}", connection.attempt, locator, connection.instance, error);
                    connection.last_error = Some(error.to_string());
                }
                _ if error.is_transient() => {
                    return Err(FetchError::RetriesExhausted {
                        attempts: connection.attempt,
                        last: error.to_string(),
                    });
                }
                _ => return Err(error),
            }
        }
    }

    async fn attempt(&self, locator: &str, connection: &mut Connection, output: &mut Output) -> Result<(), FetchError> {
        let url = resolve_url(&connection.instance, locator);
        let timeout = self.settings.read_timeout;

        let mut body = tokio::time::timeout(timeout, self.transport.open(&url))
            .await
            .map_err(|_| FetchError::TransientNetwork(format!("timed out connecting to {}", connection.instance)))??;

        connection.expecting = body.content_length();
        output.begin_attempt().await?;

        loop {
            let chunk = tokio::time::timeout(timeout, body.next_chunk())
                .await
                .map_err(|_| FetchError::TransientNetwork(format!("no data from {} for {:?}", connection.instance, timeout)))??;

            let Some(chunk) = chunk else { break };
            if chunk.is_empty() {
                continue;
            }

            let offset = connection.progress;
            connection.progress += chunk.len() as u64;
            output.write(offset, &chunk).await?;

            if let Some((tag, events)) = output.progress_sink() {
                let _ = events.send(FetchEvent::Progress {
                    tag,
                    received: connection.progress,
                    expected: connection.expecting,
                });
            }
        }

        match connection.expecting {
            Some(expected) if expected != connection.progress => Err(FetchError::MalformedResponse(format!(
                "expected {} bytes, received {}",
                expected, connection.progress
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, ScriptedTransport};
    use tempfile::TempDir;

    fn manager(transport: &Arc<ScriptedTransport>, max_connections: usize) -> FetchManager {
        FetchManager::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            FetchSettings {
                instances: vec!["http://one.test".to_string(), "http://two.test/".to_string()],
                max_connections,
                retry_budget: 3,
                read_timeout: Duration::from_millis(200),
            },
        )
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<FetchEvent>) -> (Vec<u8>, Vec<u32>, FetchEvent) {
        let mut data = Vec::new();
        let mut attempts = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Data { bytes, .. } => data.extend(bytes),
                FetchEvent::Started { attempt, .. } => attempts.push(attempt),
                FetchEvent::Progress { .. } => {}
                terminal => return (data, attempts, terminal),
            }
        }
        panic!("channel closed without a terminal event");
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("song", Script::fail("connection reset"));
        transport.script("song", Script::status(502));
        transport.script("song", Script::body(&[b"Ogg", b"S"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = manager(&transport, 2).fetch(7, "song", Destination::Pipe, tx);

        let (data, attempts, terminal) = collect(&mut rx).await;
        assert_eq!(data, b"OggS");
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(matches!(terminal, FetchEvent::Completed { tag: 7, total: 4 }));
    }

    #[tokio::test]
    async fn test_three_failures_exhaust_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.script("song", Script::fail("timeout"));
        }
        transport.script("song", Script::body(&[b"never"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = manager(&transport, 2);
        let _handle = fetcher.fetch(1, "song", Destination::Pipe, tx);

        let (data, _, terminal) = collect(&mut rx).await;
        assert!(data.is_empty());
        match terminal {
            FetchEvent::Failed { error: FetchError::RetriesExhausted { attempts, .. }, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(fetcher.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_partial_delivery_skips_prefix() {
        let transport = Arc::new(ScriptedTransport::new());
        // Announces 6 bytes but only delivers 3
        transport.script("song", Script::body(&[b"abc"]).with_length(6));
        transport.script("song", Script::body(&[b"ab", b"cdef"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = manager(&transport, 1).fetch(1, "song", Destination::Pipe, tx);

        let (data, attempts, terminal) = collect(&mut rx).await;
        assert_eq!(data, b"abcdef");
        assert_eq!(attempts, vec![1, 2]);
        assert!(matches!(terminal, FetchEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_read_timeout_is_transient() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("song", Script::hang());
        transport.script("song", Script::body(&[b"ok"]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = manager(&transport, 1).fetch(1, "song", Destination::Pipe, tx);

        let (data, _, terminal) = collect(&mut rx).await;
        assert_eq!(data, b"ok");
        assert!(matches!(terminal, FetchEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_cache_file_written_on_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("albums").join("a1.json");
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("albums/a1", Script::body(&[b"{\"id\":", b"\"a1\"}"]));

        let fetcher = manager(&transport, 1);
        let size = fetcher.fetch_file("albums/a1", &path).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"id\":\"a1\"}");
        assert!(!dir.path().join("albums").join("a1.json.part").exists());

        // Served from disk the second time
        assert_eq!(fetcher.fetch_file("albums/a1", &path).await.unwrap(), 11);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_cache_fetch_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.json");
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.script("playlists/p", Script::body(&[b"{\"par"]).with_length(100));
        }

        let result = manager(&transport, 1).fetch_file("playlists/p", &path).await;
        assert!(matches!(result, Err(FetchError::RetriesExhausted { .. })));
        assert!(!path.exists());
        assert!(!dir.path().join("p.json.part").exists());
    }

    #[tokio::test]
    async fn test_cancel_releases_slot_and_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let part = dir.path().join("big.bin.part");
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("big", Script::body(&[b"partial"]).then_hang());

        let fetcher = FetchManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            FetchSettings {
                instances: vec!["http://one.test".to_string()],
                max_connections: 1,
                retry_budget: 3,
                read_timeout: Duration::from_secs(30),
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = fetcher.fetch(1, "big", Destination::CacheFile(path.clone()), tx);

        for _ in 0..100 {
            if part.exists() && fetcher.available_slots() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fetcher.available_slots(), 0);
        assert!(part.exists());

        handle.cancel();
        for _ in 0..100 {
            if fetcher.available_slots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fetcher.available_slots(), 1);
        assert!(!part.exists());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(20)));
        for _ in 0..6 {
            transport.script("song", Script::body(&[b"x", b"y"]));
        }

        let fetcher = manager(&transport, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handles: Vec<_> = (0..6).map(|i| fetcher.fetch(i, "song", Destination::Pipe, tx.clone())).collect();
        drop(tx);

        let mut completed = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, FetchEvent::Completed { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 6);
        assert!(transport.peak_concurrency() <= 2);
        assert_eq!(fetcher.available_slots(), 2);
        drop(handles);
    }

    #[tokio::test]
    async fn test_no_backends() {
        let transport = Arc::new(ScriptedTransport::new());
        let fetcher = FetchManager::new(
            transport as Arc<dyn Transport>,
            FetchSettings {
                instances: Vec::new(),
                max_connections: 1,
                retry_budget: 3,
                read_timeout: Duration::from_secs(1),
            },
        );
        assert!(matches!(fetcher.fetch_bytes("x").await, Err(FetchError::NoBackends)));
    }

    #[tokio::test]
    async fn test_fetch_bytes_resets_between_attempts() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script("rec", Script::body(&[b"[1,"]).with_length(5));
        transport.script("rec", Script::body(&[b"[1,2]"]));

        let bytes = manager(&transport, 1).fetch_bytes("rec").await.unwrap();
        assert_eq!(bytes, b"[1,2]");
    }
}
