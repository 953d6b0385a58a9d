//! The node handle: identity plus the shared services every session uses.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vidmesh_media::pubsub::{decode_segment, encode_segment};
use vidmesh_media::{
    HlsStream, OverlayNetwork, Segmenter, Stream, StreamId, StreamKind, StreamRegistry,
};

use crate::census::Census;
use crate::chain::ChainClient;
use crate::drivers::OsDriver;
use crate::error::{Error, Result};

pub struct Node {
    pub identity: String,
    pub registry: Arc<StreamRegistry>,
    pub overlay: Arc<dyn OverlayNetwork>,
    pub segmenter: Arc<dyn Segmenter>,
    pub census: Arc<Census>,
    pub chain: Option<Arc<dyn ChainClient>>,
    pub storage: Option<Arc<dyn OsDriver>>,
}

impl Node {
    pub fn new(
        identity: String,
        registry: Arc<StreamRegistry>,
        overlay: Arc<dyn OverlayNetwork>,
        segmenter: Arc<dyn Segmenter>,
        census: Arc<Census>,
        chain: Option<Arc<dyn ChainClient>>,
        storage: Option<Arc<dyn OsDriver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            registry,
            overlay,
            segmenter,
            census,
            chain,
            storage,
        })
    }

    /// Advertise an HLS stream on the overlay: every segment the segmenter
    /// emits is encoded and published, in order, on the stream-id topic.
    /// Segment emergence is accounted against `nonce`; an optional storage
    /// session mirrors segment data off-node.
    pub fn broadcast_to_network(
        self: &Arc<Self>,
        hls: Arc<HlsStream>,
        nonce: u64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let topic = hls.id().to_string();
            let storage_session = node
                .storage
                .as_ref()
                .map(|driver| driver.new_session(&format!("streams/{}", hls.id().video_id())));
            let mut segments = match hls.subscribe() {
                Ok(rx) => rx,
                Err(e) => {
                    error!("publisher could not attach to {}: {}", topic, e);
                    return;
                }
            };

            info!("broadcasting {} to the network", topic);
            loop {
                let segment = tokio::select! {
                    () = cancel.cancelled() => {
                        // Tell listeners the stream is over before leaving.
                        let _ = node.overlay.publish(&topic, encode_segment(&vidmesh_media::HlsSegment::eof())).await;
                        return;
                    }
                    recv = segments.recv() => match recv {
                        Ok(seg) => seg,
                        Err(RecvError::Lagged(n)) => {
                            warn!("publisher for {} lagged by {} segments", topic, n);
                            continue;
                        }
                        Err(RecvError::Closed) => {
                            let _ = node.overlay.publish(&topic, encode_segment(&vidmesh_media::HlsSegment::eof())).await;
                            return;
                        }
                    },
                };

                if !segment.eof {
                    node.census.segment_emerged(nonce, segment.seq_no, segment.duration);
                }
                if let Err(e) = node.overlay.publish(&topic, encode_segment(&segment)).await {
                    error!("publish {} seq {} failed: {}", topic, segment.seq_no, e);
                }
                if let Some(session) = &storage_session {
                    if !segment.eof {
                        let started = std::time::Instant::now();
                        match session.save_data(&segment.name, segment.data.clone()).await {
                            Ok(url) => {
                                node.census
                                    .segment_uploaded(nonce, segment.seq_no, started.elapsed());
                                tracing::debug!("segment {} mirrored to {}", segment.name, url);
                            }
                            Err(e) => node.census.segment_upload_failed(
                                nonce,
                                segment.seq_no,
                                crate::census::SegmentUploadError::ObjectStorage,
                                &e.to_string(),
                                false,
                            ),
                        }
                    }
                }
                if segment.eof {
                    info!("stream {} ended, publisher exiting", topic);
                    return;
                }
            }
        })
    }

    /// Kick a transcode job for an advertised stream: subscribe to its
    /// topic and re-publish the segment sequence under one derived rendition
    /// id per profile. The encoding itself happens elsewhere; this node
    /// wraps and re-advertises.
    pub async fn transcode(
        self: &Arc<Self>,
        stream_id: &StreamId,
        profiles: &[crate::profiles::VideoProfile],
    ) -> Result<Vec<StreamId>> {
        if profiles.is_empty() {
            return Err(Error::NotFound);
        }
        let mut sub = self.overlay.subscribe(stream_id.as_str()).await?;
        let derived: Vec<StreamId> = profiles
            .iter()
            .map(|p| stream_id.with_profile(&p.name))
            .collect();

        let node = Arc::clone(self);
        let topics: Vec<String> = derived.iter().map(ToString::to_string).collect();
        let source_topic = stream_id.to_string();
        let sub_id = sub.id;
        tokio::spawn(async move {
            while let Some(envelope) = sub.envelopes.recv().await {
                let eof = decode_segment(&envelope).map(|s| s.eof).unwrap_or(false);
                for topic in &topics {
                    if let Err(e) = node.overlay.publish(topic, Bytes::clone(&envelope)).await {
                        error!("rendition publish on {} failed: {}", topic, e);
                    }
                }
                if eof {
                    break;
                }
            }
            if let Err(e) = node.overlay.unsubscribe(&source_topic, sub_id).await {
                error!("transcode unsubscribe failed: {}", e);
            }
        });

        info!("transcoding {} into {} renditions", stream_id, derived.len());
        Ok(derived)
    }

    /// Create the paired HLS stream for a publish session.
    pub fn create_hls_stream(&self) -> Result<Arc<HlsStream>> {
        let id = StreamId::random(&self.identity, None);
        let stream = self.registry.add_new_stream(id, StreamKind::Hls)?;
        stream.as_hls().ok_or(Error::RtmpPublish)
    }

    pub fn get_stream(&self, id: &StreamId) -> Option<Stream> {
        self.registry.get_stream(id)
    }
}
