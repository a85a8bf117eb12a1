//! Test doubles shared by the engine test suites

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error_handling::{classify_status, FetchError};
use crate::core::fetcher::{TransferBody, Transport};
use crate::core::graph::{ConfigurationGraph, GraphWrite};
use crate::core::store::{MemoryStore, StoreError, StoreGateway, StoreTransaction};

/// One scripted response
#[derive(Debug, Clone)]
pub enum Reply {
    Body {
        chunks: Vec<Vec<u8>>,
        content_length: Option<u64>,
        chunk_delay: Duration,
    },
    /// Send `prefix`, then never finish
    Stall { prefix: Vec<u8> },
    Error(FetchError),
}

impl Reply {
    pub fn body(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Reply::Body {
            content_length: Some(bytes.len() as u64),
            chunks: vec![bytes],
            chunk_delay: Duration::ZERO,
        }
    }

    /// Body split into `chunk_size` pieces with a pause before each
    pub fn slow(bytes: impl Into<Vec<u8>>, chunk_size: usize, chunk_delay: Duration) -> Self {
        let bytes = bytes.into();
        Reply::Body {
            content_length: Some(bytes.len() as u64),
            chunks: bytes.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect(),
            chunk_delay,
        }
    }

    pub fn stall_after(prefix: impl Into<Vec<u8>>) -> Self {
        Reply::Stall {
            prefix: prefix.into(),
        }
    }

    pub fn status(code: u16) -> Self {
        let status = reqwest::StatusCode::from_u16(code).unwrap_or(reqwest::StatusCode::IM_A_TEAPOT);
        Reply::Error(classify_status(status, "scripted"))
    }

    pub fn with_content_length(mut self, declared: u64) -> Self {
        if let Reply::Body { content_length, .. } = &mut self {
            *content_length = Some(declared);
        }
        self
    }
}

/// Decrements the active-transfer gauge when the body stream is dropped
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport answering per URL: queued one-shot replies first,
/// then the URL's default reply, then 404.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, bytes: impl Into<Vec<u8>>) {
        self.defaults
            .lock()
            .insert(url.to_string(), Reply::body(bytes));
    }

    pub fn serve_reply(&self, url: &str, reply: Reply) {
        self.defaults.lock().insert(url.to_string(), reply);
    }

    pub fn push(&self, url: &str, reply: Reply) {
        self.queued
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Highest number of bodies open at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, url: &str, count: usize) {
        let wait = async {
            while self.calls(url) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("{} was not requested {} times", url, count));
    }

    pub async fn wait_for_total_calls(&self, count: usize) {
        let wait = async {
            while self.total_calls() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("transport was not called {} times", count));
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
        {
            return Some(reply);
        }
        self.defaults.lock().get(url).cloned()
    }

    fn open_guard(&self) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self.active.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<TransferBody, FetchError> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;

        let reply = match self.next_reply(url) {
            Some(reply) => reply,
            None => return Err(classify_status(reqwest::StatusCode::NOT_FOUND, url)),
        };

        match reply {
            Reply::Error(e) => Err(e),
            Reply::Body {
                chunks,
                content_length,
                chunk_delay,
            } => {
                let guard = self.open_guard();
                let body = stream::iter(chunks)
                    .then(move |chunk| async move {
                        if !chunk_delay.is_zero() {
                            tokio::time::sleep(chunk_delay).await;
                        }
                        Ok::<Bytes, FetchError>(Bytes::from(chunk))
                    })
                    .map(move |chunk| {
                        let _held = &guard;
                        chunk
                    })
                    .boxed();
                Ok(TransferBody {
                    content_length,
                    stream: body,
                })
            }
            Reply::Stall { prefix } => {
                let guard = self.open_guard();
                let head: Vec<Vec<u8>> = if prefix.is_empty() {
                    Vec::new()
                } else {
                    vec![prefix]
                };
                let body = stream::iter(head)
                    .map(|chunk| Ok::<Bytes, FetchError>(Bytes::from(chunk)))
                    .chain(stream::pending())
                    .map(move |chunk| {
                        let _held = &guard;
                        chunk
                    })
                    .boxed();
                Ok(TransferBody {
                    content_length: None,
                    stream: body,
                })
            }
        }
    }
}

/// Memory store whose commits can be made to fail on demand
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    artifact_failures_left: AtomicUsize,
    always_fail: AtomicBool,
    commits: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commits that record a cached artifact
    pub fn fail_artifact_commits(&self, count: usize) {
        self.artifact_failures_left.store(count, Ordering::SeqCst);
    }

    /// Fail every commit, intake included
    pub fn fail_always(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn successful_commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreGateway for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn read_graph(&self) -> Result<ConfigurationGraph, StoreError> {
        self.inner.read_graph().await
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<u64, StoreError> {
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }

        let records_artifact = tx
            .writes()
            .iter()
            .any(|write| matches!(write, GraphWrite::RemoteItem(item) if item.is_cached()));
        if records_artifact
            && self
                .artifact_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }

        let revision = self.inner.commit(tx).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }
}
