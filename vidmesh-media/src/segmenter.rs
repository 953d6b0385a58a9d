//! Segmenter bridge: drives a segmenter over a live RTMP stream and feeds
//! the resulting segments into an HLS stream.
//!
//! The segmentation codec itself sits behind the `Segmenter` trait. Whatever
//! the segmenter does, the bridge guarantees a final `eof` segment is written
//! to the HLS stream on every exit path; the owning session decides whether a
//! failed segmenter warrants a new publish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::MediaError;
use crate::stream::{HlsSegment, HlsStream, MediaFrame, RtmpStream};

/// Default wall-clock length of one segment.
pub const DEFAULT_SEG_LENGTH: Duration = Duration::from_secs(8);

#[derive(Clone, Copy, Debug)]
pub struct SegmenterOptions {
    pub seg_length: Duration,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        Self {
            seg_length: DEFAULT_SEG_LENGTH,
        }
    }
}

/// The codec seam: turns a live RTMP stream into a finite-or-unbounded
/// sequence of segments written to `sink`. Returns when the source ends,
/// the token fires, or the segmenter fails.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        source: Arc<RtmpStream>,
        sink: Arc<HlsStream>,
        opts: SegmenterOptions,
        cancel: CancellationToken,
    ) -> Result<(), MediaError>;
}

/// Run the segmenter and write the terminal `eof` segment afterwards.
/// Failures are surfaced as a single log event; the bridge never retries.
pub async fn run_segmenter_bridge(
    segmenter: Arc<dyn Segmenter>,
    source: Arc<RtmpStream>,
    sink: Arc<HlsStream>,
    opts: SegmenterOptions,
    cancel: CancellationToken,
) {
    let id = sink.id().clone();
    match segmenter
        .segment(source, Arc::clone(&sink), opts, cancel)
        .await
    {
        Ok(()) => {}
        Err(MediaError::Canceled) => tracing::debug!("segmenter for {} canceled", id),
        Err(e) => tracing::warn!("segmenter for {} exited with error: {}", id, e),
    }
    sink.write_eof();
}

/// Groups already-demuxed frames into wall-clock-sized segments. This is the
/// wrapping layer only: no keyframe alignment, no re-encoding. Segment
/// boundaries follow frame timestamps; names are `<stream-id>_<seq>.ts`.
pub struct FrameSegmenter;

impl FrameSegmenter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FrameSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingSegment {
    start_ts: u32,
    last_ts: u32,
    data: BytesMut,
}

#[async_trait]
impl Segmenter for FrameSegmenter {
    async fn segment(
        &self,
        source: Arc<RtmpStream>,
        sink: Arc<HlsStream>,
        opts: SegmenterOptions,
        cancel: CancellationToken,
    ) -> Result<(), MediaError> {
        let mut frames = source.subscribe()?;
        let seg_length_ms = opts.seg_length.as_millis() as u32;
        let mut seq_no: u64 = 0;
        let mut pending: Option<PendingSegment> = None;

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => {
                    flush(&sink, &mut pending, &mut seq_no)?;
                    return Err(MediaError::Canceled);
                }
                recv = frames.recv() => match recv {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("segmenter for {} lagged by {} frames", sink.id(), n);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        flush(&sink, &mut pending, &mut seq_no)?;
                        return Ok(());
                    }
                },
            };

            let ts = frame.timestamp();
            let seg = pending.get_or_insert_with(|| PendingSegment {
                start_ts: ts,
                last_ts: ts,
                data: BytesMut::new(),
            });
            seg.data.extend_from_slice(frame.data());
            seg.last_ts = seg.last_ts.max(ts);

            if ts.saturating_sub(seg.start_ts) >= seg_length_ms {
                flush(&sink, &mut pending, &mut seq_no)?;
            }
        }
    }
}

fn flush(
    sink: &HlsStream,
    pending: &mut Option<PendingSegment>,
    seq_no: &mut u64,
) -> Result<(), MediaError> {
    let Some(seg) = pending.take() else {
        return Ok(());
    };
    if seg.data.is_empty() {
        return Ok(());
    }
    let duration = f64::from(seg.last_ts.saturating_sub(seg.start_ts)) / 1000.0;
    let segment = HlsSegment {
        seq_no: *seq_no,
        name: format!("{}_{}.ts", sink.id(), seq_no),
        duration,
        data: seg.data.freeze(),
        eof: false,
    };
    tracing::debug!(
        "segment {} ready ({:.3}s, {} bytes)",
        segment.name,
        segment.duration,
        segment.data.len()
    );
    sink.write_segment(segment)?;
    *seq_no += 1;
    Ok(())
}
