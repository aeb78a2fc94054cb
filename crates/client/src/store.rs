//! Relay message store client
//!
//! `MsgStore` keeps the header cache for one relay: time-bounded freshness,
//! expiry eviction against the relay's reported clock, dedup on insert, and
//! descending `(time, I)` ordering. All HTTP goes through one shared
//! `CtClient` pool. The cache mutex guards only in-memory mutation and is
//! never held across an await.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use ciphrtxt_core::{decompress_point_hex, CryptoContext};
use ciphrtxt_keys::PublicKey;
use ciphrtxt_message::{Message, MessageEncoder, MessageError, MessageHeader};

use crate::config::ClientConfig;
use crate::nak::{Nak, NakError};
use crate::onion::{OnionError, OnionHost, OnionRequestBuilder};

const STATUS_PATH: &str = "api/status/";
const SERVER_TIME_PATH: &str = "api/time/";
const HEADERS_SINCE_PATH: &str = "api/header/list/since/";
const DOWNLOAD_MESSAGE_PATH: &str = "api/message/download/";
const UPLOAD_MESSAGE_PATH: &str = "api/message/upload/";
const PEER_LIST_PATH: &str = "api/peer/list/";

#[derive(Error, Debug)]
pub enum StoreError {
    /// Network failure or deadline expiry; retriable by the caller.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay answered with a non-200 status; retriable by the caller.
    #[error("Relay returned status {0}")]
    Status(u16),

    #[error("Malformed relay response")]
    Malformed,

    #[error("Header not present in cache")]
    NotFound,

    #[error("Onion error: {0}")]
    Onion(#[from] OnionError),

    #[error("NAK error: {0}")]
    Nak(#[from] NakError),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

impl From<MessageError> for StoreError {
    fn from(_: MessageError) -> Self {
        StoreError::Malformed
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Deserialize)]
struct StatusResponse {
    pubkey: String,
}

#[derive(Deserialize)]
struct TimeResponse {
    time: u32,
}

#[derive(Deserialize)]
struct HeaderListResponse {
    header_list: Vec<String>,
}

/// Relay peer advertisement from `/api/peer/list/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
}

impl From<&PeerInfo> for OnionHost {
    fn from(peer: &PeerInfo) -> Self {
        OnionHost::new(peer.host.clone(), peer.port)
    }
}

/// Session-scoped HTTP handle: one shared connection pool, released when
/// the last clone drops.
#[derive(Clone)]
pub struct CtClient {
    http: reqwest::Client,
}

impl CtClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let raw = self.get_bytes(url).await?;
        serde_json::from_slice(&raw).map_err(|_| StoreError::Malformed)
    }

    /// Fill in a node's onion point from its status endpoint. Used to
    /// prepare hop hosts discovered through a peer listing.
    pub async fn refresh_host(&self, host: &mut OnionHost) -> Result<()> {
        let status: StatusResponse = self
            .get_json(&format!("{}{}", host.base_url(), STATUS_PATH))
            .await?;
        let point = decompress_point_hex(&status.pubkey).map_err(|_| StoreError::Malformed)?;
        host.pubkey = Some(point);
        Ok(())
    }

    /// POST a built onion request and decrypt the reply.
    pub async fn send_onion(&self, request: &crate::onion::OnionRequest) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(&request.url)
            .body(request.body.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        let reply = response.text().await?;
        Ok(request.decrypt_reply(&reply)?)
    }
}

/// In-memory header cache for one relay: descending `(time, I)` order,
/// insert-if-absent, expiry eviction.
pub struct HeaderCache {
    headers: Vec<MessageHeader>,
    dirty: bool,
    last_sync: Option<Instant>,
    servertime: u32,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self {
            headers: Vec::new(),
            dirty: true,
            last_sync: None,
            servertime: 0,
        }
    }

    pub fn headers(&self) -> &[MessageHeader] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn contains(&self, header: &MessageHeader) -> bool {
        self.headers.iter().any(|h| h == header)
    }

    /// Drop headers the relay considers expired. Returns the eviction count.
    pub fn evict_expired(&mut self, servertime: u32) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| h.expire >= servertime);
        before - self.headers.len()
    }

    /// Insert at the head unless already present.
    pub fn insert(&mut self, header: MessageHeader) -> bool {
        if self.contains(&header) {
            return false;
        }
        self.headers.insert(0, header);
        true
    }

    /// Restore descending `(time, compressed I)` order.
    pub fn sort_descending(&mut self) {
        self.headers.sort_by(|a, b| b.cmp_order(a));
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn is_fresh(&self, window: Duration) -> bool {
        !self.dirty
            && self
                .last_sync
                .map(|last| last.elapsed() < window)
                .unwrap_or(false)
    }
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional onion routing for a single store operation.
#[derive(Clone, Copy)]
pub struct OnionRoute<'a> {
    pub nak: &'a Nak,
    pub hops: &'a [OnionHost],
}

/// Client-side view of one relay message store.
pub struct MsgStore {
    host: String,
    port: u16,
    pubkey: Mutex<Option<ciphrtxt_core::ProjectivePoint>>,
    client: CtClient,
    config: ClientConfig,
    cache: Mutex<HeaderCache>,
}

impl MsgStore {
    pub fn new(host: impl Into<String>, port: u16, client: CtClient) -> Self {
        Self::with_config(host, port, client, ClientConfig::default())
    }

    pub fn with_config(
        host: impl Into<String>,
        port: u16,
        client: CtClient,
        config: ClientConfig,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            pubkey: Mutex::new(None),
            client,
            config,
            cache: Mutex::new(HeaderCache::new()),
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    /// Encoder carrying this store's configured TTL and proof-of-work
    /// difficulty. Callers adjust version or sender as needed and encode.
    pub fn encoder<'a>(
        &self,
        ctx: &'a CryptoContext,
        recipient: &'a PublicKey,
    ) -> MessageEncoder<'a> {
        MessageEncoder::new(ctx, recipient)
            .ttl(self.config.default_ttl_secs)
            .pow_bits(self.config.pow_bits)
    }

    /// Current onion-host view of this relay.
    pub fn node(&self) -> OnionHost {
        OnionHost {
            host: self.host.clone(),
            port: self.port,
            pubkey: *self.pubkey.lock(),
        }
    }

    /// Fetch the relay's onion point from its status endpoint.
    pub async fn refresh(&self) -> Result<()> {
        let status: StatusResponse = self
            .client
            .get_json(&format!("{}{}", self.base_url(), STATUS_PATH))
            .await?;
        let point = decompress_point_hex(&status.pubkey).map_err(|_| StoreError::Malformed)?;
        *self.pubkey.lock() = Some(point);
        info!(host = %self.host, "refreshed relay status key");
        Ok(())
    }

    async fn fetch(&self, path: &str, route: Option<OnionRoute<'_>>) -> Result<Vec<u8>> {
        match route {
            None => self.client.get_bytes(&format!("{}{}", self.base_url(), path)).await,
            Some(route) => {
                let node = self.ensure_node().await?;
                let request = OnionRequestBuilder::new(&node)
                    .hops(route.hops.iter())
                    .get(path, route.nak)?;
                self.client.send_onion(&request).await
            }
        }
    }

    async fn ensure_node(&self) -> Result<OnionHost> {
        if self.pubkey.lock().is_none() {
            self.refresh().await?;
        }
        Ok(self.node())
    }

    /// Refresh the header cache if stale, then return a snapshot in
    /// descending order.
    pub async fn get_headers(&self) -> Result<Vec<MessageHeader>> {
        self.sync_headers().await?;
        Ok(self.cache.lock().headers().to_vec())
    }

    async fn sync_headers(&self) -> Result<()> {
        let window = Duration::from_secs(self.config.cache_expire_secs);
        if self.cache.lock().is_fresh(window) {
            return Ok(());
        }

        let time: TimeResponse = self
            .client
            .get_json(&format!("{}{}", self.base_url(), SERVER_TIME_PATH))
            .await?;

        // Evict against the relay clock and remember where the last sweep
        // left off; new headers are fetched from that point.
        let since = {
            let mut cache = self.cache.lock();
            let evicted = cache.evict_expired(time.time);
            if evicted > 0 {
                debug!(evicted, host = %self.host, "evicted expired headers");
            }
            cache.last_sync = Some(Instant::now());
            cache.servertime
        };

        let listing: HeaderListResponse = self
            .client
            .get_json(&format!(
                "{}{}{}",
                self.base_url(),
                HEADERS_SINCE_PATH,
                since
            ))
            .await?;

        let parsed: Vec<MessageHeader> = listing
            .header_list
            .iter()
            .filter_map(|text| MessageHeader::deserialize(text).ok())
            .collect();

        let mut cache = self.cache.lock();
        cache.servertime = time.time;
        cache.dirty = false;
        let mut added = 0usize;
        for header in parsed {
            if cache.insert(header) {
                added += 1;
            }
        }
        cache.sort_descending();
        debug!(added, total = cache.len(), host = %self.host, "synced headers");
        Ok(())
    }

    /// Download and parse the message behind a cached header.
    pub async fn get_message(
        &self,
        header: &MessageHeader,
        route: Option<OnionRoute<'_>>,
    ) -> Result<Message> {
        self.sync_headers().await?;
        if !self.cache.lock().contains(header) {
            return Err(StoreError::NotFound);
        }
        self.get_message_by_id(&header.i.to_hex(), route).await
    }

    /// Download a message by the hex of its compressed `I` point.
    pub async fn get_message_by_id(
        &self,
        msgid: &str,
        route: Option<OnionRoute<'_>>,
    ) -> Result<Message> {
        let raw = self
            .fetch(&format!("{}{}", DOWNLOAD_MESSAGE_PATH, msgid), route)
            .await?;
        let text = String::from_utf8(raw).map_err(|_| StoreError::Malformed)?;
        Ok(Message::deserialize(&text)?)
    }

    /// Upload a message. Returns `None` when the header is already cached
    /// (nothing was posted). On success the header enters the cache and the
    /// next read refreshes.
    pub async fn post_message(
        &self,
        message: &Message,
        route: Option<OnionRoute<'_>>,
    ) -> Result<Option<Vec<u8>>> {
        let header = message.header.clone();
        if self.cache.lock().contains(&header) {
            return Ok(None);
        }
        let raw = message.serialize();

        let reply = match route {
            None => {
                let form = reqwest::multipart::Form::new().part(
                    "message",
                    reqwest::multipart::Part::text(raw).file_name("message"),
                );
                let response = self
                    .client
                    .http
                    .post(format!("{}{}", self.base_url(), UPLOAD_MESSAGE_PATH))
                    .multipart(form)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(StoreError::Status(response.status().as_u16()));
                }
                response.bytes().await?.to_vec()
            }
            Some(route) => {
                let node = self.ensure_node().await?;
                let (content_type, body) = multipart_form_body(&raw);
                let request = OnionRequestBuilder::new(&node)
                    .hops(route.hops.iter())
                    .header("Content-Type", &content_type)
                    .post(UPLOAD_MESSAGE_PATH, &body, route.nak)?;
                self.client.send_onion(&request).await?
            }
        };

        let mut cache = self.cache.lock();
        cache.insert(header);
        cache.mark_dirty();
        debug!(host = %self.host, "posted message");
        Ok(Some(reply))
    }

    /// List the relay's known peers.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>> {
        self.client
            .get_json(&format!("{}{}", self.base_url(), PEER_LIST_PATH))
            .await
    }
}

/// Multipart form with a single `message` file field, used on the onion
/// path where the body must be built by hand.
fn multipart_form_body(message: &str) -> (String, String) {
    let boundary = "----------ThIs_Is_tHe_bouNdaRY_$";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"message\"; filename=\"message\"\r\n\
         Content-Type: application/octet-stream\r\n\
         \r\n\
         {message}\r\n\
         --{boundary}--\r\n"
    );
    (
        format!("multipart/form-data; boundary={boundary}"),
        body,
    )
}
