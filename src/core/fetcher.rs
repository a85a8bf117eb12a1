//! Single-resource transfer: stream to staging, verify, rename into the cache
//!
//! - 流式写入临时文件，限频上报进度
//! - 校验大小与摘要
//! - 原子重命名到缓存路径，取消或失败时清理临时文件

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::core::error_handling::{classify_status, errors, FetchError};
use crate::core::integrity_checker::{Expectation, IntegrityChecker, StreamingDigest};
use crate::core::models::{ItemId, LocalArtifact, RemoteItem};
use crate::core::observer::StatusReporter;
use crate::core::progress::{ProgressThrottle, DEFAULT_PROGRESS_BYTE_DELTA, DEFAULT_PROGRESS_INTERVAL};
use crate::utils::{get_file_extension, remove_file_if_exists, sanitize_filename};

/// An opened response body
pub struct TransferBody {
    /// Length the server declared, if any
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, FetchError>>,
}

/// Opens byte streams for remote URLs
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransferBody, FetchError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &str) -> Result<TransferBody, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(FetchError::from).boxed();

        Ok(TransferBody {
            content_length,
            stream,
        })
    }
}

/// Longest readable prefix kept in a cache key
const MAX_READABLE_KEY: usize = 48;

/// Filesystem-safe name for an item ID or version token.
///
/// The readable part is lossy (`promo/1` and `promo_1` sanitize alike), so a
/// digest of the raw string is appended to keep distinct inputs apart.
pub fn cache_key(raw: &str) -> String {
    let mut readable = sanitize_filename(raw);
    if readable.len() > MAX_READABLE_KEY {
        let cut = (0..=MAX_READABLE_KEY)
            .rev()
            .find(|&i| readable.is_char_boundary(i))
            .unwrap_or(0);
        readable.truncate(cut);
    }
    let digest = Sha256::digest(raw.as_bytes());
    format!("{}-{}", readable, hex::encode(&digest[..8]))
}

/// Directory layout under the cache root.
///
/// ```text
/// <root>/items/<key(item id)>/<key(version)>[.ext]   committed artifacts
/// <root>/.staging/<key(item id)>-<uuid>.part         transfers in progress
/// ```
///
/// Keying artifacts by version lets the displayed version and the one being
/// fetched sit side by side.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    pub fn item_dir(&self, item_id: &str) -> PathBuf {
        self.items_dir().join(cache_key(item_id))
    }

    /// Canonical path of `item` at its announced version
    pub fn artifact_path(&self, item: &RemoteItem) -> PathBuf {
        let mut name = cache_key(&item.remote_version);
        if let Some(ext) = url_extension(&item.url) {
            name.push('.');
            name.push_str(&ext);
        }
        self.item_dir(&item.id).join(name)
    }

    /// Fresh staging file name; never reused between attempts
    pub fn staging_path(&self, item_id: &str) -> PathBuf {
        self.staging_dir()
            .join(format!("{}-{}.part", cache_key(item_id), Uuid::new_v4()))
    }

    /// Cache key of the item a staging file belongs to, if `name` has the
    /// `<key>-<uuid>.part` shape
    fn staging_owner(name: &str) -> Option<&str> {
        let stem = name.strip_suffix(".part")?;
        let at = stem.len().checked_sub(36)?;
        let uuid = stem.get(at..)?;
        Uuid::parse_str(uuid).ok()?;
        stem.get(..at)?.strip_suffix('-')
    }

    /// Delete every cached file not in `keep` and every staging file, except
    /// those belonging to `busy` items. Returns files removed and bytes freed.
    pub fn prune(
        &self,
        keep: &HashSet<PathBuf>,
        busy: &HashSet<ItemId>,
    ) -> std::io::Result<(usize, u64)> {
        let busy_keys: HashSet<String> = busy.iter().map(|id| cache_key(id)).collect();
        let mut files = 0usize;
        let mut bytes = 0u64;

        let items_dir = self.items_dir();
        if items_dir.exists() {
            let walker = WalkDir::new(&items_dir)
                .min_depth(1)
                .into_iter()
                .filter_entry(|entry| {
                    entry.depth() != 1
                        || !busy_keys.contains(entry.file_name().to_string_lossy().as_ref())
                });

            for entry in walker {
                let entry = entry?;
                if !entry.file_type().is_file() || keep.contains(entry.path()) {
                    continue;
                }
                let size = entry.metadata()?.len();
                std::fs::remove_file(entry.path())?;
                debug!("Pruned {}", entry.path().display());
                files += 1;
                bytes += size;
            }

            for entry in WalkDir::new(&items_dir).min_depth(1).max_depth(1) {
                let entry = entry?;
                if entry.file_type().is_dir() {
                    // only succeeds when the directory is now empty
                    let _ = std::fs::remove_dir(entry.path());
                }
            }
        }

        let staging_dir = self.staging_dir();
        if staging_dir.exists() {
            for entry in WalkDir::new(&staging_dir).min_depth(1).max_depth(1) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if Self::staging_owner(&name).map_or(false, |key| busy_keys.contains(key)) {
                    continue;
                }
                let size = entry.metadata()?.len();
                std::fs::remove_file(entry.path())?;
                files += 1;
                bytes += size;
            }
        }

        Ok((files, bytes))
    }
}

/// Extension of the last URL path segment, if it looks like one
fn url_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    let ext = get_file_extension(&segment)?;

    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Upper bound for one whole transfer attempt
    pub fetch_timeout: Duration,
    pub progress_interval: Duration,
    pub progress_byte_delta: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(300),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress_byte_delta: DEFAULT_PROGRESS_BYTE_DELTA,
        }
    }
}

/// Performs one transfer attempt for one item
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    layout: CacheLayout,
    checker: IntegrityChecker,
    config: FetcherConfig,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, layout: CacheLayout, config: FetcherConfig) -> Self {
        Self {
            transport,
            layout,
            checker: IntegrityChecker::new(),
            config,
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Fetch `item` at its announced version.
    ///
    /// Drives `reporter` to `in_progress` and, on error, to `failed` or
    /// `cancelled`. On success the status is left `in_progress`: the item is
    /// not done until the caller has committed the artifact.
    pub async fn fetch(
        &self,
        item: &RemoteItem,
        reporter: &mut StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifact, FetchError> {
        if cancel.is_cancelled() {
            reporter.cancel();
            return Err(FetchError::Cancelled);
        }

        reporter.begin();
        let staging = self.layout.staging_path(&item.id);

        let limit = self.config.fetch_timeout;
        let result = match tokio::time::timeout(limit, self.transfer(item, &staging, reporter, cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(errors::timed_out(limit)),
        };

        if let Err(e) = &result {
            // 清理临时文件
            if let Err(io_err) = remove_file_if_exists(&staging).await {
                warn!(
                    "Failed to remove staging file {}: {}",
                    staging.display(),
                    io_err
                );
            }
            debug!("Fetch of {} ended: {}", item.id, e);
            reporter.finish_with_error(e);
        }

        result
    }

    async fn transfer(
        &self,
        item: &RemoteItem,
        staging: &Path,
        reporter: &mut StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifact, FetchError> {
        let expectation = Expectation::for_item(item)?;
        let final_path = self.layout.artifact_path(item);

        if let Some(artifact) = self
            .adopt_existing(item, &final_path, &expectation, reporter)
            .await
        {
            return Ok(artifact);
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            opened = self.transport.open(&item.url) => opened?,
        };
        let TransferBody {
            content_length,
            mut stream,
        } = body;
        let total = expectation.size.or(content_length);

        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(staging).await?;
        let mut digest = expectation
            .digest
            .as_ref()
            .map(|expected| StreamingDigest::new(expected.algorithm));
        let mut throttle =
            ProgressThrottle::new(self.config.progress_interval, self.config.progress_byte_delta);
        let mut written = 0u64;

        // 开始流式下载
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                next = stream.next() => next,
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            file.write_all(&chunk).await?;
            if let Some(digest) = digest.as_mut() {
                digest.update(&chunk);
            }
            written += chunk.len() as u64;

            if let Some(expected) = expectation.size {
                if written > expected {
                    return Err(errors::checksum_mismatch(
                        format!("{} bytes", expected),
                        format!("more than {} bytes", expected),
                    ));
                }
            }

            // 更新进度（限制更新频率）
            if throttle.should_emit(written) {
                reporter.progress(written, total);
            }
        }

        // 确保文件数据写入磁盘
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if throttle.last_reported() != written {
            reporter.progress(written, total);
        }

        if let Some(declared) = content_length {
            if written < declared {
                return Err(errors::transient(format!(
                    "transfer truncated after {} of {} bytes",
                    written, declared
                )));
            }
        }

        if let Some(expected) = expectation.size {
            if written != expected {
                return Err(errors::checksum_mismatch(
                    format!("{} bytes", expected),
                    format!("{} bytes", written),
                ));
            }
        }

        let checksum = match (&expectation.digest, digest) {
            (Some(expected), Some(computed)) => {
                let actual = computed.finalize();
                if !expected.matches(&actual.hex) {
                    return Err(errors::checksum_mismatch(
                        expected.to_string(),
                        actual.to_string(),
                    ));
                }
                Some(actual.to_string())
            }
            _ => None,
        };

        // last chance before the file becomes visible at its canonical path
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(staging, &final_path).await?;

        info!(
            "⬇️  Fetched {} {} ({} bytes) -> {}",
            item.id,
            item.remote_version,
            written,
            final_path.display()
        );

        Ok(LocalArtifact {
            item_id: item.id.clone(),
            version: item.remote_version.clone(),
            path: final_path,
            size: written,
            checksum,
            reused: false,
        })
    }

    /// A file at the canonical path got there by rename after verification,
    /// typically by an earlier pass whose commit failed. Re-check and reuse it.
    async fn adopt_existing(
        &self,
        item: &RemoteItem,
        path: &Path,
        expectation: &Expectation,
        reporter: &mut StatusReporter,
    ) -> Option<LocalArtifact> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return None;
        }

        match self.checker.verify_file(path, expectation).await {
            Ok(size) => {
                info!(
                    "♻️  Reusing verified artifact for {} {} at {}",
                    item.id,
                    item.remote_version,
                    path.display()
                );
                reporter.progress(size, Some(size));
                Some(LocalArtifact {
                    item_id: item.id.clone(),
                    version: item.remote_version.clone(),
                    path: path.to_path_buf(),
                    size,
                    checksum: expectation.digest.as_ref().map(|d| d.to_string()),
                    reused: true,
                })
            }
            Err(e) => {
                warn!(
                    "Discarding unusable artifact {} for {}: {}",
                    path.display(),
                    item.id,
                    e
                );
                if let Err(io_err) = remove_file_if_exists(path).await {
                    warn!("Failed to remove {}: {}", path.display(), io_err);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::FetchErrorKind;
    use crate::core::models::{ItemKind, TransferState};
    use crate::core::observer::{NullObserver, StatusRegistry};
    use crate::core::test_support::{Reply, ScriptedTransport};
    use dashmap::DashMap;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn reporter(id: &str) -> (StatusReporter, StatusRegistry) {
        let registry: StatusRegistry = Arc::new(DashMap::new());
        (
            StatusReporter::schedule(id, registry.clone(), Arc::new(NullObserver)),
            registry,
        )
    }

    fn fetcher(transport: Arc<ScriptedTransport>, root: &Path) -> Fetcher {
        Fetcher::new(transport, CacheLayout::new(root), FetcherConfig::default())
    }

    fn staging_is_empty(layout: &CacheLayout) -> bool {
        std::fs::read_dir(layout.staging_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn test_artifact_paths_are_keyed_by_version() {
        let layout = CacheLayout::new("/cache");
        let v1 = RemoteItem::new("logo", "https://cdn/img/Logo.PNG?x=1", ItemKind::Media, "v1");
        let mut v2 = v1.clone();
        v2.remote_version = "sha256:ab".into();

        let path = layout.artifact_path(&v1);
        assert_eq!(path.parent().unwrap(), layout.item_dir("logo"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("v1-") && name.ends_with(".png"), "{}", name);
        assert_ne!(layout.artifact_path(&v2), path);

        let odd = RemoteItem::new("../etc", "https://cdn/page", ItemKind::Media, "..");
        let path = layout.artifact_path(&odd);
        assert!(path.starts_with("/cache/items"));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("__-"));
    }

    #[test]
    fn test_cache_keys_keep_lookalike_names_apart() {
        assert_ne!(cache_key("promo/1"), cache_key("promo_1"));
        assert_ne!(cache_key("sha256:ab"), cache_key("sha256_ab"));
        assert_eq!(cache_key("promo/1"), cache_key("promo/1"));
        assert!(cache_key("promo/1").starts_with("promo_1-"));

        let long = "x".repeat(300);
        assert_ne!(cache_key(&long), cache_key(&"x".repeat(301)));
        assert!(cache_key(&long).len() < 80);

        let layout = CacheLayout::new("/cache");
        let a = RemoteItem::new("promo/1", "https://cdn/a.png", ItemKind::Media, "v:1");
        let b = RemoteItem::new("promo_1", "https://cdn/a.png", ItemKind::Media, "v_1");
        assert_ne!(layout.item_dir(&a.id), layout.item_dir(&b.id));
        assert_ne!(layout.artifact_path(&a), layout.artifact_path(&b));
    }

    #[test]
    fn test_staging_owner_requires_full_name_shape() {
        let layout = CacheLayout::new("/cache");
        let path = layout.staging_path("a");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(CacheLayout::staging_owner(&name), Some(cache_key("a").as_str()));

        let other = layout.staging_path("a-b");
        let other_name = other.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(
            CacheLayout::staging_owner(&other_name),
            Some(cache_key("a-b").as_str())
        );

        assert_eq!(CacheLayout::staging_owner("a-junk.part"), None);
        assert_eq!(CacheLayout::staging_owner(&name.replace(".part", ".tmp")), None);
    }

    #[tokio::test]
    async fn test_fetch_streams_to_canonical_path() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let body = vec![7u8; 4096];
        transport.serve("https://cdn/clip.mp4", body.clone());

        let mut item = RemoteItem::new("clip", "https://cdn/clip.mp4", ItemKind::Media, "v1");
        item.expected_size = Some(4096);
        item.checksum = Some(format!("sha256:{}", hex::encode(Sha256::digest(&body))));

        let fetcher = fetcher(transport, dir.path());
        let (mut reporter, registry) = reporter("clip");
        let artifact = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.size, 4096);
        assert!(!artifact.reused);
        assert!(artifact.checksum.unwrap().starts_with("sha256:"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), body);
        assert!(staging_is_empty(fetcher.layout()));

        // completion is the committer's call
        let status = registry.get("clip").map(|s| s.clone()).unwrap();
        assert_eq!(status.state(), TransferState::InProgress);
        assert_eq!(status.bytes_transferred(), 4096);
        assert_eq!(status.total_bytes(), Some(4096));
    }

    #[tokio::test]
    async fn test_digest_mismatch_removes_staging() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.serve("https://cdn/a.png", b"corrupt".to_vec());

        let mut item = RemoteItem::new("a", "https://cdn/a.png", ItemKind::Media, "v1");
        item.checksum = Some(format!("md5:{}", "0".repeat(32)));

        let fetcher = fetcher(transport, dir.path());
        let (mut reporter, _) = reporter("a");
        let err = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::ChecksumMismatch);
        assert_eq!(reporter.state(), TransferState::Failed);
        assert!(staging_is_empty(fetcher.layout()));
        assert!(!fetcher.layout().artifact_path(&item).exists());
    }

    #[tokio::test]
    async fn test_unusable_checksum_fails_before_download() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.serve("https://cdn/a.png", b"abc".to_vec());

        let mut item = RemoteItem::new("a", "https://cdn/a.png", ItemKind::Media, "v1");
        item.checksum = Some(format!("sha1:{}", "0".repeat(40)));

        let fetcher = fetcher(transport.clone(), dir.path());
        let (mut reporter, _) = reporter("a");
        let err = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FetchErrorKind::ChecksumMismatch);
        assert!(!err.is_retryable());
        assert_eq!(transport.calls("https://cdn/a.png"), 0);
        assert!(!fetcher.layout().artifact_path(&item).exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_is_checksum_error() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.serve("https://cdn/a.png", vec![1u8; 10]);

        let mut item = RemoteItem::new("a", "https://cdn/a.png", ItemKind::Media, "v1");
        item.expected_size = Some(11);

        let fetcher = fetcher(transport, dir.path());
        let (mut reporter, _) = reporter("a");
        let err = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn test_truncated_body_is_transient() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "https://cdn/a.png",
            Reply::body(vec![1u8; 10]).with_content_length(20),
        );

        let item = RemoteItem::new("a", "https://cdn/a.png", ItemKind::Media, "v1");
        let fetcher = fetcher(transport, dir.path());
        let (mut reporter, _) = reporter("a");
        let err = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(staging_is_empty(fetcher.layout()));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("https://cdn/big.mp4", Reply::stall_after(vec![0u8; 64]));

        let item = RemoteItem::new("big", "https://cdn/big.mp4", ItemKind::Media, "v1");
        let fetcher = Arc::new(fetcher(transport.clone(), dir.path()));
        let token = CancellationToken::new();

        let task = {
            let fetcher = fetcher.clone();
            let token = token.clone();
            let item = item.clone();
            tokio::spawn(async move {
                let (mut reporter, _) = reporter("big");
                let result = fetcher.fetch(&item, &mut reporter, &token).await;
                (result, reporter.state())
            })
        };

        transport.wait_for_calls("https://cdn/big.mp4", 1).await;
        token.cancel();

        let (result, state) = task.await.unwrap();
        assert_eq!(result.unwrap_err(), FetchError::Cancelled);
        assert_eq!(state, TransferState::Cancelled);
        assert!(!fetcher.layout().artifact_path(&item).exists());
        assert!(staging_is_empty(fetcher.layout()));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push("https://cdn/slow", Reply::stall_after(Vec::new()));

        let item = RemoteItem::new("slow", "https://cdn/slow", ItemKind::Media, "v1");
        let fetcher = Fetcher::new(
            transport,
            CacheLayout::new(dir.path()),
            FetcherConfig {
                fetch_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let (mut reporter, _) = reporter("slow");
        let err = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::TransientNetwork);
        assert_eq!(reporter.state(), TransferState::Failed);
    }

    #[tokio::test]
    async fn test_existing_verified_artifact_is_adopted() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let fetcher = fetcher(transport.clone(), dir.path());

        let mut item = RemoteItem::new("a", "https://cdn/a.png", ItemKind::Media, "v3");
        item.expected_size = Some(3);
        let path = fetcher.layout().artifact_path(&item);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"abc").unwrap();

        let (mut reporter, _) = reporter("a");
        let artifact = fetcher
            .fetch(&item, &mut reporter, &CancellationToken::new())
            .await
            .unwrap();
        assert!(artifact.reused);
        assert_eq!(transport.calls("https://cdn/a.png"), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_live_and_busy_files() {
        let dir = tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());

        let live = layout.item_dir("a").join("v2");
        let stale = layout.item_dir("a").join("v1");
        let orphan = layout.item_dir("gone").join("v1");
        let busy_file = layout.item_dir("busy").join("v0");
        for path in [&live, &stale, &orphan, &busy_file] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"1234").unwrap();
        }
        std::fs::create_dir_all(layout.staging_dir()).unwrap();
        let abandoned = layout.staging_path("a");
        let active = layout.staging_path("busy");
        std::fs::write(&abandoned, b"12").unwrap();
        std::fs::write(&active, b"12").unwrap();

        let keep: HashSet<PathBuf> = [live.clone()].into_iter().collect();
        let busy: HashSet<ItemId> = ["busy".to_string()].into_iter().collect();
        let (files, bytes) = layout.prune(&keep, &busy).unwrap();

        assert_eq!(files, 3);
        assert_eq!(bytes, 10);
        assert!(live.exists());
        assert!(busy_file.exists());
        assert!(active.exists());
        assert!(!stale.exists());
        assert!(!layout.item_dir("gone").exists());
    }

    #[tokio::test]
    async fn test_busy_item_does_not_shield_lookalike_staging_files() {
        let dir = tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        std::fs::create_dir_all(layout.staging_dir()).unwrap();

        let active = layout.staging_path("a");
        let neighbour = layout.staging_path("a-b");
        let stray = layout.staging_dir().join(format!("{}-leftover.part", cache_key("a")));
        for path in [&active, &neighbour, &stray] {
            std::fs::write(path, b"123").unwrap();
        }

        let busy: HashSet<ItemId> = ["a".to_string()].into_iter().collect();
        let (files, bytes) = layout.prune(&HashSet::new(), &busy).unwrap();

        assert_eq!((files, bytes), (2, 6));
        assert!(active.exists());
        assert!(!neighbour.exists());
        assert!(!stray.exists());
    }
}
