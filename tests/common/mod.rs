// tests/common/mod.rs
//
// In-memory collaborators shared by the integration tests: a scripted link
// extractor, a configurable platform session + factory, and a counting
// reply generator.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use group_reply_relay::error::ClientError;
use group_reply_relay::platform::{DynPlatformClient, LinkExtractor, PlatformClient, SessionFactory};
use group_reply_relay::reply::{GeneratedReply, ReplyContext, ReplyGenerator};
use group_reply_relay::types::{ExtractedLink, ItemDetails, ItemEntities, PostedReply};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn links(ids: &[&str]) -> Vec<ExtractedLink> {
    ids.iter()
        .map(|id| ExtractedLink {
            id: id.to_string(),
            locator: format!("https://x.com/poster/status/{id}"),
            origin_handle: "poster".to_string(),
        })
        .collect()
}

// ---------------- extractor ----------------

type ExtractResult = Result<Vec<ExtractedLink>, ClientError>;

/// Per-locator queue of responses; an empty queue answers with the
/// locator's fallback (default: no items).
#[derive(Default)]
pub struct MockExtractor {
    scripts: Mutex<HashMap<String, VecDeque<ExtractResult>>>,
    fallback: Mutex<HashMap<String, ExtractResult>>,
    calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl MockExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, locator: &str, result: ExtractResult) {
        self.scripts
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn script_ids(&self, locator: &str, ids: &[&str]) {
        self.script(locator, Ok(links(ids)));
    }

    pub fn fallback(&self, locator: &str, result: ExtractResult) {
        self.fallback
            .lock()
            .unwrap()
            .insert(locator.to_string(), result);
    }

    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkExtractor for MockExtractor {
    async fn extract(&self, target_locator: &str) -> ExtractResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(target_locator)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(r) => r,
            None => self
                .fallback
                .lock()
                .unwrap()
                .get(target_locator)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new())),
        }
    }
}

// ---------------- platform ----------------

pub struct MockPlatform {
    pub user: String,
    pub connect_ok: AtomicBool,
    pub reconnect_ok: AtomicBool,
    pub post_fails: AtomicBool,
    pub post_auth_fails: AtomicBool,
    pub details_age_secs: AtomicI64,
    pub author_id: Mutex<String>,
    pub connected: AtomicBool,
    pub reconnects: AtomicUsize,
    pub post_attempts: AtomicUsize,
    pub posts: Mutex<Vec<(String, String)>>,
}

impl MockPlatform {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            connect_ok: AtomicBool::new(true),
            reconnect_ok: AtomicBool::new(true),
            post_fails: AtomicBool::new(false),
            post_auth_fails: AtomicBool::new(false),
            details_age_secs: AtomicI64::new(3_600),
            author_id: Mutex::new("author-1".to_string()),
            connected: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            post_attempts: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn posted_targets(&self) -> Vec<String> {
        self.posts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn connect(&self) -> Result<(), ClientError> {
        if self.connect_ok.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ClientError::Auth(format!("{} cannot log in", self.user)))
        }
    }

    async fn reconnect(&self) -> bool {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let ok = self.reconnect_ok.load(Ordering::SeqCst);
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_authenticated(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn user_id(&self) -> Option<String> {
        Some(self.user.clone())
    }

    async fn get_item_details(&self, id: &str) -> Result<ItemDetails, ClientError> {
        let age = self.details_age_secs.load(Ordering::SeqCst);
        Ok(ItemDetails {
            text: format!("post {id} #rust"),
            author_id: self.author_id.lock().unwrap().clone(),
            author_handle: Some("poster".to_string()),
            created_at: Utc::now() - chrono::Duration::seconds(age),
            entities: ItemEntities::default(),
        })
    }

    async fn post_reply(&self, text: &str, target_id: &str) -> Result<PostedReply, ClientError> {
        let n = self.post_attempts.fetch_add(1, Ordering::SeqCst);
        if self.post_auth_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Auth("token revoked".into()));
        }
        if self.post_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Transient("post rejected".into()));
        }
        self.posts
            .lock()
            .unwrap()
            .push((text.to_string(), target_id.to_string()));
        Ok(PostedReply {
            id: format!("{}-reply-{n}", self.user),
        })
    }
}

/// Hands out one shared [`MockPlatform`] per credentials reference,
/// created on first use so tests can configure it before the relay opens it.
#[derive(Default)]
pub struct MockFactory {
    platforms: Mutex<HashMap<String, Arc<MockPlatform>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn platform(&self, credentials_ref: &str) -> Arc<MockPlatform> {
        self.platforms
            .lock()
            .unwrap()
            .entry(credentials_ref.to_string())
            .or_insert_with(|| Arc::new(MockPlatform::new(&format!("self-{credentials_ref}"))))
            .clone()
    }
}

impl SessionFactory for MockFactory {
    fn open(&self, credentials_ref: &str) -> DynPlatformClient {
        self.platform(credentials_ref)
    }
}

// ---------------- generator ----------------

#[derive(Default)]
pub struct CountingGenerator {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReplyGenerator for CountingGenerator {
    fn generate<'a>(
        &'a self,
        _text: &'a str,
        context: &'a ReplyContext,
    ) -> Pin<Box<dyn Future<Output = GeneratedReply> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let out = if self.fail.load(Ordering::SeqCst) {
            GeneratedReply::failed("model unavailable")
        } else {
            GeneratedReply::ok(format!("nice one @{}", context.author))
        };
        Box::pin(async move { out })
    }

    fn provider_name(&self) -> &'static str {
        "counting"
    }
}

// ---------------- event helpers ----------------

/// Next event matching `pred`, skipping the rest; panics after [`WAIT`].
pub async fn wait_for<T, F>(rx: &mut mpsc::Receiver<T>, mut pred: F) -> T
where
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Broadcast flavour of [`wait_for`].
pub async fn wait_for_broadcast<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything already buffered on the channel.
pub fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
