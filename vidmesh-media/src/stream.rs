//! Stream identifiers and the in-process stream handles.
//!
//! A stream id has the form `<node-identity>|<random-id>` with an optional
//! third `|<profile-tag>` component for derived renditions. The id is the
//! canonical handle for a stream everywhere: the registry, the overlay topic
//! and the playback URLs.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::MediaError;

/// Capacity of the per-stream frame channel. When full, the oldest frames
/// are dropped for lagging receivers (broadcast semantics).
pub const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the per-stream segment channel. Segments are large, so the
/// window is kept small.
pub const SEGMENT_CHANNEL_CAPACITY: usize = 64;

const MASTER_PLAYLIST_TAG: &str = "master";

/// Opaque textual stream identifier, unique within a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh id bound to the node identity plus a random video id.
    pub fn random(identity: &str, profile_tag: Option<&str>) -> Self {
        let video_id = nanoid::nanoid!(16);
        match profile_tag {
            Some(tag) if !tag.is_empty() => Self(format!("{identity}|{video_id}|{tag}")),
            _ => Self(format!("{identity}|{video_id}")),
        }
    }

    /// Derive a rendition id from this id by attaching a profile tag.
    #[must_use]
    pub fn with_profile(&self, profile_tag: &str) -> Self {
        let mut parts: Vec<&str> = self.0.split('|').collect();
        parts.truncate(2);
        Self(format!("{}|{profile_tag}", parts.join("|")))
    }

    pub fn node_id(&self) -> &str {
        self.0.split('|').next().unwrap_or("")
    }

    pub fn video_id(&self) -> &str {
        self.0.split('|').nth(1).unwrap_or("")
    }

    pub fn profile_tag(&self) -> Option<&str> {
        self.0.split('|').nth(2).filter(|t| !t.is_empty())
    }

    /// A master playlist id is tagged `master` in place of a profile.
    pub fn is_master_playlist(&self) -> bool {
        self.profile_tag() == Some(MASTER_PLAYLIST_TAG)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Demuxed media frame carried between the ingest edge and the segmenter.
/// `Bytes` payloads make fan-out clones reference-count bumps, not copies.
#[derive(Clone, Debug)]
pub enum MediaFrame {
    Video { timestamp: u32, data: Bytes },
    Audio { timestamp: u32, data: Bytes },
    Metadata { timestamp: u32, data: Bytes },
}

impl MediaFrame {
    pub fn timestamp(&self) -> u32 {
        match self {
            Self::Video { timestamp, .. }
            | Self::Audio { timestamp, .. }
            | Self::Metadata { timestamp, .. } => *timestamp,
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Self::Video { data, .. } | Self::Audio { data, .. } | Self::Metadata { data, .. } => {
                data
            }
        }
    }
}

/// One HLS-sized chunk of video. Immutable once published; ordered by
/// `seq_no`. An `eof` segment terminates the sequence and carries no data.
#[derive(Clone, Debug, PartialEq)]
pub struct HlsSegment {
    pub seq_no: u64,
    pub name: String,
    pub duration: f64,
    pub data: Bytes,
    pub eof: bool,
}

impl HlsSegment {
    pub fn eof() -> Self {
        Self {
            seq_no: 0,
            name: String::new(),
            duration: 0.0,
            data: Bytes::new(),
            eof: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Rtmp,
    Hls,
}

/// Byte-accurate live input stream. Single writer (the ingest session);
/// readers subscribe for a broadcast receiver of demuxed frames.
pub struct RtmpStream {
    id: StreamId,
    created_at: DateTime<Utc>,
    sender: parking_lot::Mutex<Option<broadcast::Sender<MediaFrame>>>,
}

impl RtmpStream {
    pub fn new(id: StreamId) -> Self {
        let (sender, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            id,
            created_at: Utc::now(),
            sender: parking_lot::Mutex::new(Some(sender)),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn write_frame(&self, frame: MediaFrame) -> Result<(), MediaError> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            // A send error only means there is no receiver right now; frames
            // published before the segmenter attaches are allowed to drop.
            Some(sender) => {
                let _ = sender.send(frame);
                Ok(())
            }
            None => Err(MediaError::SessionEnded),
        }
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<MediaFrame>, MediaError> {
        let guard = self.sender.lock();
        guard
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(MediaError::SessionEnded)
    }

    /// Close the writer side. Receivers drain buffered frames and then
    /// observe a closed channel.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Ordered sequence of HLS segments produced by the segmenter. Single
/// writer, broadcast readers (publisher, local observers).
pub struct HlsStream {
    id: StreamId,
    created_at: DateTime<Utc>,
    sender: parking_lot::Mutex<Option<broadcast::Sender<HlsSegment>>>,
}

impl HlsStream {
    pub fn new(id: StreamId) -> Self {
        let (sender, _) = broadcast::channel(SEGMENT_CHANNEL_CAPACITY);
        Self {
            id,
            created_at: Utc::now(),
            sender: parking_lot::Mutex::new(Some(sender)),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn write_segment(&self, segment: HlsSegment) -> Result<(), MediaError> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                let _ = sender.send(segment);
                Ok(())
            }
            None => Err(MediaError::SessionEnded),
        }
    }

    /// Terminal write: emits an `eof` segment and closes the channel.
    /// Safe to call more than once.
    pub fn write_eof(&self) {
        let mut guard = self.sender.lock();
        if let Some(sender) = guard.take() {
            let _ = sender.send(HlsSegment::eof());
        }
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<HlsSegment>, MediaError> {
        let guard = self.sender.lock();
        guard
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(MediaError::SessionEnded)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// A registered stream: byte-accurate RTMP input or a segmented HLS output.
#[derive(Clone)]
pub enum Stream {
    Rtmp(Arc<RtmpStream>),
    Hls(Arc<HlsStream>),
}

impl Stream {
    pub fn id(&self) -> &StreamId {
        match self {
            Self::Rtmp(s) => s.id(),
            Self::Hls(s) => s.id(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Rtmp(_) => StreamKind::Rtmp,
            Self::Hls(_) => StreamKind::Hls,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Rtmp(s) => s.created_at(),
            Self::Hls(s) => s.created_at(),
        }
    }

    pub fn as_rtmp(&self) -> Option<Arc<RtmpStream>> {
        match self {
            Self::Rtmp(s) => Some(Arc::clone(s)),
            Self::Hls(_) => None,
        }
    }

    pub fn as_hls(&self) -> Option<Arc<HlsStream>> {
        match self {
            Self::Hls(s) => Some(Arc::clone(s)),
            Self::Rtmp(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_components() {
        let id = StreamId::new("node1|abcdef|240p");
        assert_eq!(id.node_id(), "node1");
        assert_eq!(id.video_id(), "abcdef");
        assert_eq!(id.profile_tag(), Some("240p"));
        assert!(!id.is_master_playlist());

        let bare = StreamId::new("node1|abcdef");
        assert_eq!(bare.profile_tag(), None);
    }

    #[test]
    fn test_stream_id_master_predicate() {
        let media = StreamId::new("node1|abcdef");
        let master = media.with_profile("master");
        assert!(master.is_master_playlist());
        assert!(!media.is_master_playlist());
    }

    #[test]
    fn test_random_ids_are_unique() {
        let a = StreamId::random("node1", None);
        let b = StreamId::random("node1", None);
        assert_ne!(a, b);
        assert_eq!(a.node_id(), "node1");
        assert!(!a.video_id().is_empty());
    }

    #[tokio::test]
    async fn test_rtmp_stream_write_and_close() {
        let stream = RtmpStream::new(StreamId::new("node1|vid"));
        let mut rx = stream.subscribe().unwrap();

        stream
            .write_frame(MediaFrame::Video {
                timestamp: 0,
                data: Bytes::from_static(b"\xaa"),
            })
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.timestamp(), 0);

        stream.close();
        assert!(stream.is_closed());
        assert!(matches!(
            stream.write_frame(MediaFrame::Audio {
                timestamp: 1,
                data: Bytes::new()
            }),
            Err(MediaError::SessionEnded)
        ));
        // Drained channel then closed.
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_hls_stream_eof_terminates() {
        let stream = HlsStream::new(StreamId::new("node1|vid"));
        let mut rx = stream.subscribe().unwrap();

        stream
            .write_segment(HlsSegment {
                seq_no: 0,
                name: "s0.ts".into(),
                duration: 2.0,
                data: Bytes::from_static(b"\xaa"),
                eof: false,
            })
            .unwrap();
        stream.write_eof();
        stream.write_eof(); // idempotent

        assert!(!rx.recv().await.unwrap().eof);
        assert!(rx.recv().await.unwrap().eof);
        assert!(rx.recv().await.is_err());
    }
}
