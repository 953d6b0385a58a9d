//! Media plumbing for a live-video transcoding node: stream handles, the
//! stream registry, the HLS segment buffer, the segmenter bridge and the
//! overlay pub/sub adapter.

pub mod buffer;
pub mod error;
pub mod pubsub;
pub mod registry;
pub mod segmenter;
pub mod stream;

pub use buffer::{HlsBuffer, MediaPlaylist, PlaylistState};
pub use error::MediaError;
pub use pubsub::{InMemoryOverlay, OverlayNetwork, SubscriberId, Subscription};
pub use registry::StreamRegistry;
pub use segmenter::{FrameSegmenter, Segmenter, SegmenterOptions};
pub use stream::{HlsSegment, HlsStream, MediaFrame, RtmpStream, Stream, StreamId, StreamKind};
