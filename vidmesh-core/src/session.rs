//! The media session coordinator: publish and subscribe session state
//! machines, the idle reaper, and the fan-out wiring between the segmenter,
//! the overlay, the playback buffers and the on-chain job driver.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vidmesh_media::pubsub::pump_subscription;
use vidmesh_media::segmenter::run_segmenter_bridge;
use vidmesh_media::{
    MediaPlaylist, RtmpStream, SegmenterOptions, Stream, StreamId, SubscriberId,
};

use crate::chain::{create_broadcast_job, wait_until_next_round, ChainTimeouts};
use crate::config;
use crate::error::{Error, Result};
use crate::node::Node;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Draining,
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Idle time after which a subscriber is reaped.
    pub idle_limit: Duration,
    /// Reaper sweep frequency.
    pub unsub_freq: Duration,
    /// How long a playlist request waits for a usable playlist.
    pub hls_wait: Duration,
    /// How long a segment fetch may block.
    pub segment_fetch_timeout: Duration,
    /// Segment length handed to the segmenter.
    pub seg_length: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_limit: Duration::from_secs(10),
            unsub_freq: Duration::from_secs(5),
            hls_wait: Duration::from_secs(10),
            segment_fetch_timeout: Duration::from_secs(10),
            seg_length: Duration::from_secs(8),
        }
    }
}

impl SessionConfig {
    pub fn from_config(cfg: &config::MediaConfig) -> Self {
        Self {
            idle_limit: Duration::from_secs(cfg.idle_limit_secs),
            unsub_freq: Duration::from_secs(cfg.unsub_freq_secs),
            hls_wait: Duration::from_secs(cfg.hls_wait_secs),
            seg_length: Duration::from_secs(cfg.seg_length_secs),
            ..Self::default()
        }
    }
}

struct PublishSession {
    hls_id: StreamId,
    nonce: u64,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

struct SubscribeSession {
    subscriber_id: SubscriberId,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl SubscribeSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

pub struct SessionCoordinator {
    node: Arc<Node>,
    cfg: SessionConfig,
    timeouts: ChainTimeouts,
    publishes: DashMap<StreamId, PublishSession>,
    subscribes: DashMap<StreamId, SubscribeSession>,
}

impl SessionCoordinator {
    pub fn new(node: Arc<Node>, cfg: SessionConfig, timeouts: ChainTimeouts) -> Arc<Self> {
        Arc::new(Self {
            node,
            cfg,
            timeouts,
            publishes: DashMap::new(),
            subscribes: DashMap::new(),
        })
    }

    /// Mint the canonical stream id for an incoming publish.
    pub fn create_stream_id(&self) -> StreamId {
        StreamId::random(&self.node.identity, None)
    }

    /// Bring a publish session up: balance gate, registration, the paired
    /// HLS stream, segmenter bridge, overlay publisher, and the on-chain
    /// job. Job creation is retried once after the next round starts; a
    /// second failure leaves the session draining but keeps the already
    /// flowing segments reaching active listeners until end-of-publish.
    pub async fn start_publish(&self, rtmp: Arc<RtmpStream>) -> Result<()> {
        let rtmp_id = rtmp.id().clone();
        let nonce: u64 = rand::random();

        if let Some(chain) = &self.node.chain {
            let balance = chain.token_balance().await.map_err(|e| {
                error!("error getting token balance: {}", e);
                Error::Broadcast
            })?;
            let price = config::broadcast_settings().price;
            info!("current token balance: {}", balance);
            if balance < price {
                self.node
                    .census
                    .stream_create_failed(nonce, "insufficient balance");
                warn!(
                    "low balance ({} < {}), cannot start broadcast session",
                    balance, price
                );
                return Err(Error::InsufficientBalance);
            }
        }

        if self.node.registry.get_stream(&rtmp_id).is_some() {
            return Err(Error::AlreadyExists);
        }
        self.node
            .registry
            .add_stream(rtmp_id.clone(), Stream::Rtmp(Arc::clone(&rtmp)))
            .map_err(|e| match e {
                vidmesh_media::MediaError::AlreadyExists => Error::AlreadyExists,
                other => {
                    error!("error adding stream to registry: {}", other);
                    Error::RtmpPublish
                }
            })?;

        let hls = self.node.create_hls_stream()?;
        let hls_id = hls.id().clone();
        self.node.census.stream_created(hls_id.as_str(), nonce);

        info!("segmenting rtmp stream {} to hls stream {}", rtmp_id, hls_id);
        let cancel = CancellationToken::new();
        tokio::spawn(run_segmenter_bridge(
            Arc::clone(&self.node.segmenter),
            Arc::clone(&rtmp),
            Arc::clone(&hls),
            SegmenterOptions {
                seg_length: self.cfg.seg_length,
            },
            cancel.child_token(),
        ));
        let _ = self
            .node
            .broadcast_to_network(Arc::clone(&hls), nonce, cancel.child_token());

        let session = PublishSession {
            hls_id: hls_id.clone(),
            nonce,
            state: Mutex::new(SessionState::Active),
            cancel,
        };
        self.publishes.insert(rtmp_id.clone(), session);
        self.node.census.stream_started(nonce);
        self.node
            .census
            .current_sessions(self.publishes.len() as i64);

        if let Some(chain) = &self.node.chain {
            let settings = config::broadcast_settings();
            let first = create_broadcast_job(
                chain.as_ref(),
                &self.timeouts,
                hls_id.as_str(),
                &settings.profile.name,
                settings.price,
            )
            .await;

            match first {
                Ok(tx) => {
                    info!(
                        "created broadcast job, price {}, profile {}, tx {}",
                        settings.price, settings.profile.name, tx
                    );
                }
                Err(_) => {
                    info!("error creating job, waiting for round start and trying again");
                    let wait_cancel = CancellationToken::new();
                    if let Err(e) =
                        wait_until_next_round(chain.as_ref(), &self.timeouts, &wait_cancel).await
                    {
                        error!("error waiting for round start: {}", e);
                        self.mark_draining(&rtmp_id);
                        return Err(Error::Broadcast);
                    }
                    match create_broadcast_job(
                        chain.as_ref(),
                        &self.timeouts,
                        hls_id.as_str(),
                        &settings.profile.name,
                        settings.price,
                    )
                    .await
                    {
                        Ok(tx) => {
                            info!("created broadcast job on retry, tx {}", tx);
                        }
                        Err(e) => {
                            error!("error broadcasting: {}", e);
                            self.mark_draining(&rtmp_id);
                            return Err(Error::Broadcast);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn mark_draining(&self, rtmp_id: &StreamId) {
        if let Some(session) = self.publishes.get(rtmp_id) {
            *session.state.lock() = SessionState::Draining;
        }
    }

    /// Tear a publish session down: cancel the segmenter and publisher
    /// (which drains and writes EOF), close the input, then delete both
    /// streams from the registry. Idempotent.
    pub async fn end_publish(&self, rtmp_id: &StreamId) {
        let Some((_, session)) = self.publishes.remove(rtmp_id) else {
            return;
        };
        *session.state.lock() = SessionState::Draining;

        if let Some(stream) = self.node.registry.get_stream(rtmp_id) {
            if let Some(rtmp) = stream.as_rtmp() {
                rtmp.close();
            }
        }
        session.cancel.cancel();

        self.node.registry.delete_stream(rtmp_id);
        self.node.registry.delete_stream(&session.hls_id);
        self.node.census.stream_ended(session.nonce);
        self.node
            .census
            .current_sessions(self.publishes.len() as i64);
        *session.state.lock() = SessionState::Closed;
        info!("publish session {} closed", rtmp_id);
    }

    /// Serve a media playlist, creating the subscribe session on first
    /// request. Activity is refreshed on every call so the idle reaper
    /// leaves the session alone while viewers keep polling.
    pub async fn media_playlist(&self, stream_id: &StreamId) -> Result<MediaPlaylist> {
        let buffer = match self.node.registry.get_hls_buffer(stream_id) {
            Some(buffer) => {
                if let Some(session) = self.subscribes.get(stream_id) {
                    session.touch();
                }
                buffer
            }
            None => self.subscribe_to_stream(stream_id).await?,
        };

        let playlist = buffer.playlist_within(self.cfg.hls_wait).await?;
        if let Some(session) = self.subscribes.get(stream_id) {
            session.touch();
        }
        Ok(playlist)
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<vidmesh_media::HlsBuffer>> {
        if self.subscribes.contains_key(stream_id) {
            return Ok(self.node.registry.add_new_hls_buffer(stream_id.clone()));
        }
        let sub = self.node.overlay.subscribe(stream_id.as_str()).await?;
        let subscriber_id = sub.id;
        let buffer = self.node.registry.add_new_hls_buffer(stream_id.clone());
        let cancel = CancellationToken::new();

        tokio::spawn(pump_subscription(
            Arc::clone(&self.node.overlay),
            sub,
            Arc::clone(&buffer),
            cancel.child_token(),
        ));

        self.subscribes.insert(
            stream_id.clone(),
            SubscribeSession {
                subscriber_id,
                state: Mutex::new(SessionState::Active),
                cancel,
                last_activity: Mutex::new(Instant::now()),
            },
        );
        info!("subscribed to {}", stream_id);
        Ok(buffer)
    }

    /// Serve segment bytes by segment name. The stream id is the name's
    /// prefix; missing buffers and post-EOF fetches are NotFound.
    pub async fn hls_segment(&self, segment_name: &str) -> Result<bytes::Bytes> {
        let stream_id = parse_segment_stream_id(segment_name).ok_or(Error::NotFound)?;
        let buffer = self
            .node
            .registry
            .get_hls_buffer(&stream_id)
            .ok_or(Error::NotFound)?;
        if let Some(session) = self.subscribes.get(&stream_id) {
            session.touch();
        }
        match buffer
            .wait_and_pop_segment(segment_name, self.cfg.segment_fetch_timeout)
            .await
        {
            Ok(data) => Ok(data),
            Err(vidmesh_media::MediaError::Eof | vidmesh_media::MediaError::Timeout) => {
                Err(Error::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// RTMP-play fallback: hand back the live input stream.
    pub fn rtmp_stream(&self, stream_id: &StreamId) -> Result<Arc<RtmpStream>> {
        self.node
            .registry
            .get_stream(stream_id)
            .and_then(|s| s.as_rtmp())
            .ok_or(Error::NotFound)
    }

    pub fn local_stream_ids(&self) -> Vec<StreamId> {
        self.node.registry.stream_ids()
    }

    pub fn publish_state(&self, rtmp_id: &StreamId) -> Option<SessionState> {
        self.publishes.get(rtmp_id).map(|s| *s.state.lock())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribes.len()
    }

    /// Periodic reaper: collect subscribe sessions idle past the limit,
    /// then unsubscribe them. No session lock is held across the
    /// unsubscribe call.
    pub fn start_idle_reaper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(coordinator.cfg.unsub_freq) => {}
                }
                coordinator.reap_idle_subscribers().await;
            }
        })
    }

    async fn reap_idle_subscribers(&self) {
        let now = Instant::now();
        let expired: Vec<StreamId> = self
            .subscribes
            .iter()
            .filter(|entry| now.duration_since(*entry.last_activity.lock()) > self.cfg.idle_limit)
            .map(|entry| entry.key().clone())
            .collect();

        for stream_id in expired {
            let Some((_, session)) = self.subscribes.remove(&stream_id) else {
                continue;
            };
            info!("hls stream {} inactive, unsubscribing", stream_id);
            *session.state.lock() = SessionState::Draining;
            session.cancel.cancel();
            if let Err(e) = self
                .node
                .overlay
                .unsubscribe(stream_id.as_str(), session.subscriber_id)
                .await
            {
                error!("unsubscribe {} failed: {}", stream_id, e);
            }
            self.node.registry.delete_hls_buffer(&stream_id);
            *session.state.lock() = SessionState::Closed;
        }
    }
}

/// Segment names carry their stream id as a `_`-separated prefix.
fn parse_segment_stream_id(segment_name: &str) -> Option<StreamId> {
    let name = segment_name.strip_suffix(".ts").unwrap_or(segment_name);
    let idx = name.rfind('_')?;
    if idx == 0 {
        return None;
    }
    Some(StreamId::new(&name[..idx]))
}
