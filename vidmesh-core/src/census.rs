//! Per-broadcast telemetry: segment accounting, success rates, latency
//! moving averages and the timeout watcher.
//!
//! State is namespaced by the broadcast nonce. One coarse mutex guards the
//! whole census; every update touches at most one averager window (30
//! entries), so contention stays low. Aggregates are exported through a
//! prometheus registry and scraped at `/metrics`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::normalize_discovery_code;

/// How long a segment may stay unaccounted before it is written off.
pub const TIME_TO_WAIT_FOR_ERROR: Duration = Duration::from_millis(8500);

/// Pause between timeout-watcher sweeps.
pub const TIMEOUT_WATCHER_PAUSE: Duration = Duration::from_secs(15);

/// Success rate is computed over this many most recent segments.
const SEGMENTS_TO_CALC_AVERAGE: usize = 30;

/// Window of the latency/transcode-time moving averages.
const MOVING_AVERAGE_WINDOW: Duration = Duration::from_secs(60);

/// Initial ring capacity behind a moving average.
const MOVING_AVERAGE_INITIAL_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentUploadError {
    Unknown,
    GenCreds,
    ObjectStorage,
    SessionEnded,
    InsufficientBalance,
    Timeout,
}

impl SegmentUploadError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::GenCreds => "GenCreds",
            Self::ObjectStorage => "ObjectStorage",
            Self::SessionEnded => "SessionEnded",
            Self::InsufficientBalance => "InsufficientBalance",
            Self::Timeout => "Timeout",
        }
    }

    /// Refine an unknown code from the failure message.
    fn refine(self, reason: &str) -> Self {
        if self != Self::Unknown {
            return self;
        }
        if reason.contains("timeout") || reason.contains("Timeout") {
            Self::Timeout
        } else if reason == "Session ended" {
            Self::SessionEnded
        } else {
            self
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentTranscodeError {
    Unknown,
    UnknownResponse,
    Transcode,
    OrchestratorBusy,
    OrchestratorCapped,
    ParseResponse,
    ReadBody,
    NoOrchestrators,
    Download,
    SaveData,
    SessionEnded,
    Playlist,
    LostSegment,
}

impl SegmentTranscodeError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::UnknownResponse => "UnknownResponse",
            Self::Transcode => "Transcode",
            Self::OrchestratorBusy => "OrchestratorBusy",
            Self::OrchestratorCapped => "OrchestratorCapped",
            Self::ParseResponse => "ParseResponse",
            Self::ReadBody => "ReadBody",
            Self::NoOrchestrators => "NoOrchestrators",
            Self::Download => "Download",
            Self::SaveData => "SaveData",
            Self::SessionEnded => "SessionEnded",
            Self::Playlist => "Playlist",
            Self::LostSegment => "LostSegment",
        }
    }
}

#[derive(Clone, Copy)]
struct TimeValue {
    time: Instant,
    value: f64,
}

/// Fixed-capacity ring that doubles when full, preserving order across the
/// wrap boundary.
struct RingArray {
    data: Vec<Option<TimeValue>>,
    tail: usize,
    len: usize,
}

impl RingArray {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![None; capacity.max(1)],
            tail: 0,
            len: 0,
        }
    }

    fn push(&mut self, tv: TimeValue) {
        if self.len == self.data.len() {
            self.grow();
        }
        let idx = (self.tail + self.len) % self.data.len();
        self.data[idx] = Some(tv);
        self.len += 1;
    }

    fn grow(&mut self) {
        let cap = self.data.len();
        let mut new_data = vec![None; cap * 2];
        for (i, slot) in new_data.iter_mut().take(self.len).enumerate() {
            *slot = self.data[(self.tail + i) % cap].take();
        }
        self.data = new_data;
        self.tail = 0;
    }

    fn pop(&mut self) -> Option<TimeValue> {
        if self.len == 0 {
            return None;
        }
        let tv = self.data[self.tail].take();
        self.tail = (self.tail + 1) % self.data.len();
        self.len -= 1;
        tv
    }

    fn front(&self) -> Option<TimeValue> {
        if self.len == 0 {
            None
        } else {
            self.data[self.tail]
        }
    }

    fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let cap = self.data.len();
        let sum: f64 = (0..self.len)
            .filter_map(|i| self.data[(self.tail + i) % cap])
            .map(|tv| tv.value)
            .sum();
        sum / self.len as f64
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Arithmetic mean over samples within the trailing window. Stale samples
/// are dropped from the tail on every insert, so each sample is pushed and
/// popped at most once.
struct MovingAverage {
    window: Duration,
    ring: RingArray,
}

impl MovingAverage {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            ring: RingArray::with_capacity(capacity),
        }
    }

    fn add_sample(&mut self, now: Instant, value: f64) -> f64 {
        while let Some(front) = self.ring.front() {
            if now.duration_since(front.time) > self.window {
                self.ring.pop();
            } else {
                break;
            }
        }
        self.ring.push(TimeValue { time: now, value });
        self.ring.average()
    }
}

#[derive(Clone, Copy, Default)]
struct SegmentSlot {
    seq_no: u64,
    emerged: u32,
    transcoded: u32,
    failed: bool,
    emerged_time: Option<Instant>,
}

struct TryData {
    first: Instant,
    tries: u32,
}

/// Ring of the most recent segments for one broadcast, used to compute the
/// success rate. A segment counts once it is transcoded, failed, or old
/// enough that an error can no longer arrive for it.
struct SegmentsAverager {
    segments: Vec<SegmentSlot>,
    start: usize,
    end: Option<usize>,
    removed: bool,
    removed_at: Option<Instant>,
    tries: HashMap<u64, TryData>,
}

impl SegmentsAverager {
    fn new() -> Self {
        Self {
            segments: vec![SegmentSlot::default(); SEGMENTS_TO_CALC_AVERAGE],
            start: 0,
            end: None,
            removed: false,
            removed_at: None,
            tries: HashMap::new(),
        }
    }

    fn advance(&self, i: usize) -> usize {
        (i + 1) % self.segments.len()
    }

    /// Find the slot for `seq_no` or claim the next one, evicting the
    /// oldest when the window is full.
    fn get_add_slot(&mut self, seq_no: u64) -> (usize, bool) {
        match self.end {
            None => {
                self.end = Some(0);
                (0, false)
            }
            Some(end) => {
                let mut i = self.start;
                loop {
                    if self.segments[i].seq_no == seq_no && self.segments[i].emerged_time.is_some() {
                        return (i, true);
                    }
                    if i == end {
                        break;
                    }
                    i = self.advance(i);
                }
                let new_end = self.advance(end);
                self.end = Some(new_end);
                if new_end == self.start {
                    self.start = self.advance(self.start);
                }
                (new_end, false)
            }
        }
    }

    fn add_emerged(&mut self, seq_no: u64, now: Instant) {
        let (idx, _) = self.get_add_slot(seq_no);
        let slot = &mut self.segments[idx];
        slot.seq_no = seq_no;
        slot.emerged = 1;
        slot.transcoded = 0;
        slot.failed = false;
        slot.emerged_time = Some(now);
    }

    fn add_transcoded(&mut self, seq_no: u64, failed: bool, now: Instant) {
        let (idx, found) = self.get_add_slot(seq_no);
        let slot = &mut self.segments[idx];
        if !found {
            slot.emerged = 0;
            slot.emerged_time = Some(now);
        }
        slot.seq_no = seq_no;
        slot.failed = failed;
        if !failed {
            slot.transcoded = 1;
        }
    }

    /// Rate over qualifying entries; `None` when nothing qualifies yet.
    fn success_rate(&self, now: Instant) -> Option<f64> {
        let end = self.end?;
        let mut emerged = 0u32;
        let mut transcoded = 0u32;
        let mut i = self.start;
        loop {
            let slot = &self.segments[i];
            let old_enough = slot
                .emerged_time
                .is_some_and(|t| now.duration_since(t) > TIME_TO_WAIT_FOR_ERROR);
            if slot.transcoded > 0 || slot.failed || old_enough {
                emerged += slot.emerged;
                transcoded += slot.transcoded;
            }
            if i == end {
                break;
            }
            i = self.advance(i);
        }
        if emerged > 0 {
            Some(f64::from(transcoded) / f64::from(emerged))
        } else {
            None
        }
    }

    /// True once every entry is settled: no segment is still inside its
    /// error window.
    fn can_be_removed(&self, now: Instant) -> bool {
        let Some(end) = self.end else {
            return true;
        };
        let mut i = self.start;
        loop {
            let slot = &self.segments[i];
            let in_window = slot
                .emerged_time
                .is_some_and(|t| now.duration_since(t) <= TIME_TO_WAIT_FOR_ERROR);
            if slot.transcoded == 0 && !slot.failed && in_window {
                return false;
            }
            if i == end {
                break;
            }
            i = self.advance(i);
        }
        true
    }
}

struct CensusInner {
    /// nonce -> seq_no -> emergence time.
    emerge_times: HashMap<u64, HashMap<u64, Instant>>,
    success: HashMap<u64, SegmentsAverager>,
    overall_latency_avg: MovingAverage,
    overall_latency_ratio_avg: MovingAverage,
    transcode_time_avg: MovingAverage,
    transcode_time_ratio_avg: MovingAverage,
}

struct CensusMetrics {
    segment_emerged: IntCounter,
    segment_emerged_unprocessed: IntCounter,
    segment_source_appeared: IntCounterVec,
    segment_uploaded: IntCounter,
    segment_upload_failed: IntCounterVec,
    segment_transcoded: IntCounterVec,
    segment_transcoded_unprocessed: IntCounter,
    segment_transcode_failed: IntCounterVec,
    segment_transcoded_appeared: IntCounterVec,
    segment_transcoded_all_appeared: IntCounter,
    stream_created: IntCounter,
    stream_create_failed: IntCounter,
    stream_started: IntCounter,
    stream_ended: IntCounter,
    max_sessions: IntGauge,
    current_sessions: IntGauge,
    discovery_errors: IntCounterVec,
    transcode_retried: IntCounterVec,
    success_rate: Gauge,
    transcode_time: Histogram,
    transcode_time_avg: Gauge,
    transcode_time_ratio_avg: Gauge,
    transcode_latency: HistogramVec,
    transcode_overall_latency: Histogram,
    transcode_overall_latency_avg: Gauge,
    transcode_overall_latency_ratio_avg: Gauge,
    upload_time: Histogram,
    source_segment_duration: Histogram,
    ticket_value_sent: IntCounterVec,
    tickets_sent: IntCounterVec,
    payment_create_errors: IntCounterVec,
    payment_recv_errors: IntCounterVec,
}

fn opts(name: &str, help: &str, node_type: &str, node_id: &str) -> Opts {
    Opts::new(name, help)
        .namespace("vidmesh")
        .const_label("node_type", node_type)
        .const_label("node_id", node_id)
}

fn histogram_opts(
    name: &str,
    help: &str,
    node_type: &str,
    node_id: &str,
    buckets: Vec<f64>,
) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace("vidmesh")
        .const_label("node_type", node_type)
        .const_label("node_id", node_id)
        .buckets(buckets)
}

impl CensusMetrics {
    #[allow(clippy::too_many_lines)]
    fn register(registry: &Registry, node_type: &str, node_id: &str) -> Self {
        let latency_buckets = vec![
            0.0, 0.5, 0.75, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 10.0, 20.0, 30.0,
        ];
        let time_buckets = vec![
            0.0, 0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 10.0, 20.0,
            30.0,
        ];

        let metrics = Self {
            segment_emerged: IntCounter::with_opts(opts(
                "segment_source_emerged_total",
                "Source segments settled (transcoded, failed or written off)",
                node_type,
                node_id,
            ))
            .unwrap(),
            segment_emerged_unprocessed: IntCounter::with_opts(opts(
                "segment_source_emerged_unprocessed_total",
                "Raw number of segments emerged from the segmenter",
                node_type,
                node_id,
            ))
            .unwrap(),
            segment_source_appeared: IntCounterVec::new(
                opts(
                    "segment_source_appeared_total",
                    "Source segments that appeared in a manifest",
                    node_type,
                    node_id,
                ),
                &["profile"],
            )
            .unwrap(),
            segment_uploaded: IntCounter::with_opts(opts(
                "segment_source_uploaded_total",
                "Source segments uploaded",
                node_type,
                node_id,
            ))
            .unwrap(),
            segment_upload_failed: IntCounterVec::new(
                opts(
                    "segment_source_upload_failed_total",
                    "Source segment upload failures",
                    node_type,
                    node_id,
                ),
                &["error_code"],
            )
            .unwrap(),
            segment_transcoded: IntCounterVec::new(
                opts(
                    "segment_transcoded_total",
                    "Segments transcoded",
                    node_type,
                    node_id,
                ),
                &["profiles"],
            )
            .unwrap(),
            segment_transcoded_unprocessed: IntCounter::with_opts(opts(
                "segment_transcoded_unprocessed_total",
                "Raw number of segments successfully transcoded",
                node_type,
                node_id,
            ))
            .unwrap(),
            segment_transcode_failed: IntCounterVec::new(
                opts(
                    "segment_transcode_failed_total",
                    "Segment transcode failures",
                    node_type,
                    node_id,
                ),
                &["error_code"],
            )
            .unwrap(),
            segment_transcoded_appeared: IntCounterVec::new(
                opts(
                    "segment_transcoded_appeared_total",
                    "Transcoded segments that appeared in a manifest",
                    node_type,
                    node_id,
                ),
                &["profile"],
            )
            .unwrap(),
            segment_transcoded_all_appeared: IntCounter::with_opts(opts(
                "segment_transcoded_all_appeared_total",
                "Segments with every rendition present in the manifest",
                node_type,
                node_id,
            ))
            .unwrap(),
            stream_created: IntCounter::with_opts(opts(
                "stream_created_total",
                "Streams created",
                node_type,
                node_id,
            ))
            .unwrap(),
            stream_create_failed: IntCounter::with_opts(opts(
                "stream_create_failed_total",
                "Stream creation failures",
                node_type,
                node_id,
            ))
            .unwrap(),
            stream_started: IntCounter::with_opts(opts(
                "stream_started_total",
                "Streams started",
                node_type,
                node_id,
            ))
            .unwrap(),
            stream_ended: IntCounter::with_opts(opts(
                "stream_ended_total",
                "Streams ended",
                node_type,
                node_id,
            ))
            .unwrap(),
            max_sessions: IntGauge::with_opts(opts(
                "max_sessions_total",
                "Maximum concurrent sessions",
                node_type,
                node_id,
            ))
            .unwrap(),
            current_sessions: IntGauge::with_opts(opts(
                "current_sessions_total",
                "Streams currently transcoding",
                node_type,
                node_id,
            ))
            .unwrap(),
            discovery_errors: IntCounterVec::new(
                opts(
                    "discovery_errors_total",
                    "Discovery errors",
                    node_type,
                    node_id,
                ),
                &["error_code"],
            )
            .unwrap(),
            transcode_retried: IntCounterVec::new(
                opts(
                    "transcode_retried",
                    "Segment transcode retries",
                    node_type,
                    node_id,
                ),
                &["try"],
            )
            .unwrap(),
            success_rate: Gauge::with_opts(opts(
                "success_rate",
                "Transcoded segments divided by source segments",
                node_type,
                node_id,
            ))
            .unwrap(),
            transcode_time: Histogram::with_opts(histogram_opts(
                "transcode_time_seconds",
                "Transcoding time",
                node_type,
                node_id,
                time_buckets.clone(),
            ))
            .unwrap(),
            transcode_time_avg: Gauge::with_opts(opts(
                "transcode_time_avg_seconds",
                "Transcoding time, one-minute average",
                node_type,
                node_id,
            ))
            .unwrap(),
            transcode_time_ratio_avg: Gauge::with_opts(opts(
                "transcode_time_realtime_ratio_avg",
                "Transcoding time over segment duration, one-minute average",
                node_type,
                node_id,
            ))
            .unwrap(),
            transcode_latency: HistogramVec::new(
                histogram_opts(
                    "transcode_latency_seconds",
                    "Per-rendition latency from segment emergence to manifest",
                    node_type,
                    node_id,
                    latency_buckets.clone(),
                ),
                &["profile"],
            )
            .unwrap(),
            transcode_overall_latency: Histogram::with_opts(histogram_opts(
                "transcode_overall_latency_seconds",
                "Latency from segment emergence to all renditions present",
                node_type,
                node_id,
                latency_buckets,
            ))
            .unwrap(),
            transcode_overall_latency_avg: Gauge::with_opts(opts(
                "transcode_overall_latency_avg_seconds",
                "Overall transcode latency, one-minute average",
                node_type,
                node_id,
            ))
            .unwrap(),
            transcode_overall_latency_ratio_avg: Gauge::with_opts(opts(
                "transcode_overall_latency_realtime_ratio_avg",
                "Overall latency over segment duration, one-minute average",
                node_type,
                node_id,
            ))
            .unwrap(),
            upload_time: Histogram::with_opts(histogram_opts(
                "upload_time_seconds",
                "Segment upload time",
                node_type,
                node_id,
                vec![0.0, 0.1, 0.2, 0.5, 1.0, 1.5, 2.0, 5.0, 10.0],
            ))
            .unwrap(),
            source_segment_duration: Histogram::with_opts(histogram_opts(
                "source_segment_duration_seconds",
                "Source segment duration",
                node_type,
                node_id,
                vec![0.0, 1.0, 2.0, 4.0, 8.0, 12.0, 16.0, 24.0, 30.0],
            ))
            .unwrap(),
            ticket_value_sent: IntCounterVec::new(
                opts("ticket_value_sent", "Ticket value sent", node_type, node_id),
                &["recipient", "manifest_id"],
            )
            .unwrap(),
            tickets_sent: IntCounterVec::new(
                opts("tickets_sent", "Tickets sent", node_type, node_id),
                &["recipient", "manifest_id"],
            )
            .unwrap(),
            payment_create_errors: IntCounterVec::new(
                opts(
                    "payment_create_errors",
                    "Payment creation errors",
                    node_type,
                    node_id,
                ),
                &["recipient", "manifest_id"],
            )
            .unwrap(),
            payment_recv_errors: IntCounterVec::new(
                opts(
                    "payment_recv_errors",
                    "Payment receive errors",
                    node_type,
                    node_id,
                ),
                &["sender", "manifest_id", "error_code"],
            )
            .unwrap(),
        };

        registry.register(Box::new(metrics.segment_emerged.clone())).unwrap();
        registry.register(Box::new(metrics.segment_emerged_unprocessed.clone())).unwrap();
        registry.register(Box::new(metrics.segment_source_appeared.clone())).unwrap();
        registry.register(Box::new(metrics.segment_uploaded.clone())).unwrap();
        registry.register(Box::new(metrics.segment_upload_failed.clone())).unwrap();
        registry.register(Box::new(metrics.segment_transcoded.clone())).unwrap();
        registry.register(Box::new(metrics.segment_transcoded_unprocessed.clone())).unwrap();
        registry.register(Box::new(metrics.segment_transcode_failed.clone())).unwrap();
        registry.register(Box::new(metrics.segment_transcoded_appeared.clone())).unwrap();
        registry.register(Box::new(metrics.segment_transcoded_all_appeared.clone())).unwrap();
        registry.register(Box::new(metrics.stream_created.clone())).unwrap();
        registry.register(Box::new(metrics.stream_create_failed.clone())).unwrap();
        registry.register(Box::new(metrics.stream_started.clone())).unwrap();
        registry.register(Box::new(metrics.stream_ended.clone())).unwrap();
        registry.register(Box::new(metrics.max_sessions.clone())).unwrap();
        registry.register(Box::new(metrics.current_sessions.clone())).unwrap();
        registry.register(Box::new(metrics.discovery_errors.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_retried.clone())).unwrap();
        registry.register(Box::new(metrics.success_rate.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_time.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_time_avg.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_time_ratio_avg.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_latency.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_overall_latency.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_overall_latency_avg.clone())).unwrap();
        registry.register(Box::new(metrics.transcode_overall_latency_ratio_avg.clone())).unwrap();
        registry.register(Box::new(metrics.upload_time.clone())).unwrap();
        registry.register(Box::new(metrics.source_segment_duration.clone())).unwrap();
        registry.register(Box::new(metrics.ticket_value_sent.clone())).unwrap();
        registry.register(Box::new(metrics.tickets_sent.clone())).unwrap();
        registry.register(Box::new(metrics.payment_create_errors.clone())).unwrap();
        registry.register(Box::new(metrics.payment_recv_errors.clone())).unwrap();

        metrics
    }
}

pub struct Census {
    inner: Mutex<CensusInner>,
    metrics: CensusMetrics,
    registry: Registry,
}

impl Census {
    pub fn new(node_type: &str, node_id: &str) -> Arc<Self> {
        let registry = Registry::new();
        let metrics = CensusMetrics::register(&registry, node_type, node_id);
        Arc::new(Self {
            inner: Mutex::new(CensusInner {
                emerge_times: HashMap::new(),
                success: HashMap::new(),
                overall_latency_avg: MovingAverage::new(
                    MOVING_AVERAGE_WINDOW,
                    MOVING_AVERAGE_INITIAL_CAPACITY,
                ),
                overall_latency_ratio_avg: MovingAverage::new(
                    MOVING_AVERAGE_WINDOW,
                    MOVING_AVERAGE_INITIAL_CAPACITY,
                ),
                transcode_time_avg: MovingAverage::new(
                    MOVING_AVERAGE_WINDOW,
                    MOVING_AVERAGE_INITIAL_CAPACITY,
                ),
                transcode_time_ratio_avg: MovingAverage::new(
                    MOVING_AVERAGE_WINDOW,
                    MOVING_AVERAGE_INITIAL_CAPACITY,
                ),
            }),
            metrics,
            registry,
        })
    }

    /// Encode the registry for a metrics scrape.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut out = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut out) {
            error!("metrics encoding failed: {}", e);
        }
        String::from_utf8(out).unwrap_or_default()
    }

    /// Run the timeout watcher until cancellation.
    pub fn spawn_timeout_watcher(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let census = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(TIMEOUT_WATCHER_PAUSE) => {}
                }
                census.sweep(Instant::now());
            }
        })
    }

    /// One watcher sweep: write off segments past the error window and drop
    /// broadcast state that has been retired long enough to have been
    /// scraped.
    fn sweep(&self, now: Instant) {
        let mut inner = self.inner.lock();
        for (nonce, emerged) in &mut inner.emerge_times {
            let lost: Vec<u64> = emerged
                .iter()
                .filter(|(_, t)| now.duration_since(**t) > TIME_TO_WAIT_FOR_ERROR)
                .map(|(seq, _)| *seq)
                .collect();
            for seq_no in lost {
                let ago = now.duration_since(emerged[&seq_no]);
                emerged.remove(&seq_no);
                self.metrics.segment_emerged.inc();
                self.metrics
                    .segment_transcode_failed
                    .with_label_values(&[SegmentTranscodeError::LostSegment.as_str()])
                    .inc();
                error!(
                    "lost segment nonce={} seq_no={} emerged {:?} ago",
                    nonce, seq_no, ago
                );
            }
        }
        self.send_success_locked(&inner, now);
        inner.success.retain(|_, avg| {
            // Retired broadcasts survive two error windows for scrape
            // visibility, then go away.
            !(avg.removed
                && avg
                    .removed_at
                    .is_some_and(|t| now.duration_since(t) > 2 * TIME_TO_WAIT_FOR_ERROR))
        });
        for avg in inner.success.values_mut() {
            avg.tries
                .retain(|_, t| now.duration_since(t.first) <= 2 * TIME_TO_WAIT_FOR_ERROR);
        }
    }

    fn send_success_locked(&self, inner: &CensusInner, now: Instant) {
        self.metrics.success_rate.set(Self::success_rate_at(inner, now));
    }

    fn success_rate_at(inner: &CensusInner, now: Instant) -> f64 {
        if inner.success.is_empty() {
            return 1.0;
        }
        let mut count = 0u32;
        let mut sum = 0.0;
        for avg in inner.success.values() {
            if let Some(rate) = avg.success_rate(now) {
                count += 1;
                sum += rate;
            }
        }
        if count > 0 {
            sum / f64::from(count)
        } else {
            1.0
        }
    }

    /// Current aggregate success rate; 1.0 when no entry qualifies.
    pub fn success_rate(&self) -> f64 {
        Self::success_rate_at(&self.inner.lock(), Instant::now())
    }

    pub fn stream_created(&self, hls_stream_id: &str, nonce: u64) {
        debug!("stream created nonce={} id={}", nonce, hls_stream_id);
        let mut inner = self.inner.lock();
        self.metrics.stream_created.inc();
        inner.success.insert(nonce, SegmentsAverager::new());
    }

    pub fn stream_create_failed(&self, nonce: u64, reason: &str) {
        error!("stream create failed nonce={} reason='{}'", nonce, reason);
        self.metrics.stream_create_failed.inc();
    }

    pub fn stream_started(&self, nonce: u64) {
        debug!("stream started nonce={}", nonce);
        self.metrics.stream_started.inc();
    }

    pub fn stream_ended(&self, nonce: u64) {
        debug!("stream ended nonce={}", nonce);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.metrics.stream_ended.inc();
        inner.emerge_times.remove(&nonce);
        let remove_now = inner
            .success
            .get(&nonce)
            .is_some_and(|avg| avg.can_be_removed(now));
        if remove_now {
            inner.success.remove(&nonce);
        } else if let Some(avg) = inner.success.get_mut(&nonce) {
            avg.removed = true;
            avg.removed_at = Some(now);
        }
        self.send_success_locked(&inner, now);
    }

    pub fn segment_emerged(&self, nonce: u64, seq_no: u64, duration_secs: f64) {
        debug!(
            "segment emerged nonce={} seq_no={} duration={}",
            nonce, seq_no, duration_secs
        );
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(avg) = inner.success.get_mut(&nonce) {
            avg.add_emerged(seq_no, now);
        }
        inner
            .emerge_times
            .entry(nonce)
            .or_default()
            .insert(seq_no, now);
        self.metrics.segment_emerged_unprocessed.inc();
        self.metrics.source_segment_duration.observe(duration_secs);
    }

    pub fn source_segment_appeared(&self, nonce: u64, seq_no: u64, manifest_id: &str, profile: &str) {
        debug!(
            "source segment appeared nonce={} seq_no={} manifest={} profile={}",
            nonce, seq_no, manifest_id, profile
        );
        self.metrics
            .segment_source_appeared
            .with_label_values(&[profile])
            .inc();
    }

    pub fn segment_uploaded(&self, nonce: u64, seq_no: u64, upload_duration: Duration) {
        debug!(
            "segment uploaded nonce={} seq_no={} dur={:?}",
            nonce, seq_no, upload_duration
        );
        self.metrics.segment_uploaded.inc();
        self.metrics.upload_time.observe(upload_duration.as_secs_f64());
    }

    pub fn segment_upload_failed(
        &self,
        nonce: u64,
        seq_no: u64,
        code: SegmentUploadError,
        reason: &str,
        permanent: bool,
    ) {
        let code = code.refine(reason);
        error!(
            "segment upload failed nonce={} seq_no={} code={} reason='{}'",
            nonce,
            seq_no,
            code.as_str(),
            reason
        );
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if permanent {
            Self::count_segment_emerged(&mut inner, &self.metrics, nonce, seq_no);
        }
        self.metrics
            .segment_upload_failed
            .with_label_values(&[code.as_str()])
            .inc();
        if permanent {
            Self::count_segment_transcoded(&mut inner, nonce, seq_no, true, now);
            self.send_success_locked(&inner, now);
        }
    }

    pub fn segment_transcoded(
        &self,
        nonce: u64,
        seq_no: u64,
        seg_duration_secs: f64,
        transcode_duration: Duration,
        profiles: &str,
    ) {
        debug!(
            "segment transcoded nonce={} seq_no={} dur={:?}",
            nonce, seq_no, transcode_duration
        );
        let now = Instant::now();
        let secs = transcode_duration.as_secs_f64();
        let mut inner = self.inner.lock();
        self.metrics
            .segment_transcoded
            .with_label_values(&[profiles])
            .inc();
        self.metrics.transcode_time.observe(secs);
        let avg = inner.transcode_time_avg.add_sample(now, secs);
        self.metrics.transcode_time_avg.set(avg);
        if seg_duration_secs > 0.0 {
            let ratio = secs / seg_duration_secs;
            let ratio_avg = inner.transcode_time_ratio_avg.add_sample(now, ratio);
            self.metrics.transcode_time_ratio_avg.set(ratio_avg);
        }
    }

    pub fn segment_transcode_failed(
        &self,
        code: SegmentTranscodeError,
        nonce: u64,
        seq_no: u64,
        err: &str,
        permanent: bool,
    ) {
        error!(
            "segment transcode failed code={} nonce={} seq_no={} error='{}'",
            code.as_str(),
            nonce,
            seq_no,
            err
        );
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.metrics
            .segment_transcode_failed
            .with_label_values(&[code.as_str()])
            .inc();
        if permanent {
            Self::count_segment_emerged(&mut inner, &self.metrics, nonce, seq_no);
            Self::count_segment_transcoded(
                &mut inner,
                nonce,
                seq_no,
                code != SegmentTranscodeError::SessionEnded,
                now,
            );
            self.send_success_locked(&inner, now);
        }
    }

    /// The whole segment settled: all renditions appeared or a terminal
    /// error was assigned. Feeds the overall latency averages.
    pub fn segment_fully_transcoded(
        &self,
        nonce: u64,
        seq_no: u64,
        seg_duration_secs: f64,
        err_code: Option<SegmentTranscodeError>,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let emerged_at = inner
            .emerge_times
            .get(&nonce)
            .and_then(|m| m.get(&seq_no))
            .copied();
        if let Some(emerged_at) = emerged_at {
            if err_code.is_none() {
                let latency = now.duration_since(emerged_at).as_secs_f64();
                self.metrics.transcode_overall_latency.observe(latency);
                let avg = inner.overall_latency_avg.add_sample(now, latency);
                self.metrics.transcode_overall_latency_avg.set(avg);
                if seg_duration_secs > 0.0 {
                    let ratio = latency / seg_duration_secs;
                    let ratio_avg = inner.overall_latency_ratio_avg.add_sample(now, ratio);
                    self.metrics.transcode_overall_latency_ratio_avg.set(ratio_avg);
                }
            }
            Self::count_segment_emerged(&mut inner, &self.metrics, nonce, seq_no);
        }
        if err_code.is_none() {
            self.metrics.segment_transcoded_all_appeared.inc();
        }
        let failed = err_code.is_some_and(|c| c != SegmentTranscodeError::SessionEnded);
        Self::count_segment_transcoded(&mut inner, nonce, seq_no, failed, now);
        if !failed {
            self.metrics.segment_transcoded_unprocessed.inc();
        }
        self.send_success_locked(&inner, now);
    }

    pub fn transcoded_segment_appeared(&self, nonce: u64, seq_no: u64, profile: &str) {
        debug!(
            "transcoded segment appeared nonce={} seq_no={} profile={}",
            nonce, seq_no, profile
        );
        let now = Instant::now();
        let inner = self.inner.lock();
        if let Some(emerged_at) = inner.emerge_times.get(&nonce).and_then(|m| m.get(&seq_no)) {
            let latency = now.duration_since(*emerged_at).as_secs_f64();
            self.metrics
                .transcode_latency
                .with_label_values(&[profile])
                .observe(latency);
        }
        self.metrics
            .segment_transcoded_appeared
            .with_label_values(&[profile])
            .inc();
    }

    pub fn transcode_try(&self, nonce: u64, seq_no: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(avg) = inner.success.get_mut(&nonce) else {
            return;
        };
        match avg.tries.get_mut(&seq_no) {
            Some(data) => {
                data.tries += 1;
                let label = if data.tries <= 10 {
                    data.tries.to_string()
                } else {
                    ">10".to_string()
                };
                self.metrics
                    .transcode_retried
                    .with_label_values(&[&label])
                    .inc();
            }
            None => {
                avg.tries.insert(seq_no, TryData { first: now, tries: 1 });
            }
        }
    }

    pub fn log_discovery_error(&self, raw_code: &str) {
        let code = normalize_discovery_code(raw_code);
        error!("discovery error={}", code);
        self.metrics
            .discovery_errors
            .with_label_values(&[&code])
            .inc();
    }

    pub fn max_sessions(&self, n: i64) {
        self.metrics.max_sessions.set(n);
    }

    pub fn current_sessions(&self, n: i64) {
        self.metrics.current_sessions.set(n);
    }

    pub fn ticket_value_sent(&self, recipient: &str, manifest_id: &str, value: u64) {
        if value == 0 {
            return;
        }
        self.metrics
            .ticket_value_sent
            .with_label_values(&[recipient, manifest_id])
            .inc_by(value);
    }

    pub fn tickets_sent(&self, recipient: &str, manifest_id: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.metrics
            .tickets_sent
            .with_label_values(&[recipient, manifest_id])
            .inc_by(count);
    }

    pub fn payment_create_error(&self, recipient: &str, manifest_id: &str) {
        self.metrics
            .payment_create_errors
            .with_label_values(&[recipient, manifest_id])
            .inc();
    }

    pub fn payment_recv_error(&self, sender: &str, manifest_id: &str, err_msg: &str) {
        let code = match crate::error::Error::from_payment_message(err_msg) {
            crate::error::Error::InvalidPrice => "InvalidPrice",
            crate::error::Error::InvalidRecipientRand => "InvalidRecipientRand",
            crate::error::Error::InvalidTicketFaceValue => "InvalidTicketFaceValue",
            crate::error::Error::InvalidTicketWinProb => "InvalidTicketWinProb",
            _ => "PaymentError",
        };
        self.metrics
            .payment_recv_errors
            .with_label_values(&[sender, manifest_id, code])
            .inc();
    }

    fn count_segment_emerged(
        inner: &mut CensusInner,
        metrics: &CensusMetrics,
        nonce: u64,
        seq_no: u64,
    ) {
        if let Some(emerged) = inner.emerge_times.get_mut(&nonce) {
            if emerged.remove(&seq_no).is_some() {
                metrics.segment_emerged.inc();
            }
        }
    }

    fn count_segment_transcoded(
        inner: &mut CensusInner,
        nonce: u64,
        seq_no: u64,
        failed: bool,
        now: Instant,
    ) {
        if let Some(avg) = inner.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, failed, now);
        }
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) {
        self.sweep(now);
    }

    #[cfg(test)]
    fn has_success_entry(&self, nonce: u64) -> bool {
        self.inner.lock().success.contains_key(&nonce)
    }

    #[cfg(test)]
    fn pending_emerge_count(&self, nonce: u64) -> usize {
        self.inner
            .lock()
            .emerge_times
            .get(&nonce)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_moving_average_window() {
        let start = t0();
        let mut avg = MovingAverage::new(Duration::from_secs(60), 4);

        assert!((avg.add_sample(start, 1.0) - 1.0).abs() < f64::EPSILON);
        let second = avg.add_sample(start + Duration::from_secs(30), 3.0);
        assert!((second - 2.0).abs() < f64::EPSILON);
        // The first sample is 90s old now and falls out of the window.
        let third = avg.add_sample(start + Duration::from_secs(90), 5.0);
        assert!((third - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ring_grow_across_wrap_boundary() {
        let start = t0();
        let mut ring = RingArray::with_capacity(4);
        let tv = |i: u64| TimeValue {
            time: start + Duration::from_secs(i),
            value: i as f64,
        };

        for i in 0..4 {
            ring.push(tv(i));
        }
        // Advance the tail so the next pushes wrap.
        assert!((ring.pop().unwrap().value - 0.0).abs() < f64::EPSILON);
        assert!((ring.pop().unwrap().value - 1.0).abs() < f64::EPSILON);
        ring.push(tv(4));
        ring.push(tv(5));
        // Ring is full again with the live region wrapped; this push grows.
        ring.push(tv(6));
        assert_eq!(ring.len(), 5);

        let drained: Vec<f64> = std::iter::from_fn(|| ring.pop().map(|t| t.value)).collect();
        assert_eq!(drained, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_averager_success_rate_transitions() {
        let now = t0();
        let mut avg = SegmentsAverager::new();

        avg.add_emerged(0, now);
        // Inside the error window, nothing qualifies yet.
        assert_eq!(avg.success_rate(now), None);

        avg.add_transcoded(0, false, now);
        assert_eq!(avg.success_rate(now), Some(1.0));

        avg.add_emerged(1, now);
        avg.add_transcoded(1, true, now);
        assert_eq!(avg.success_rate(now), Some(0.5));
    }

    #[test]
    fn test_averager_counts_stale_segments() {
        let now = t0();
        let mut avg = SegmentsAverager::new();
        avg.add_emerged(0, now);

        let later = now + TIME_TO_WAIT_FOR_ERROR + Duration::from_millis(1);
        assert_eq!(avg.success_rate(later), Some(0.0));
    }

    #[test]
    fn test_averager_window_evicts_oldest() {
        let now = t0();
        let mut avg = SegmentsAverager::new();
        for seq in 0..(SEGMENTS_TO_CALC_AVERAGE as u64 + 10) {
            avg.add_emerged(seq, now);
            avg.add_transcoded(seq, false, now);
        }
        assert_eq!(avg.success_rate(now), Some(1.0));
    }

    #[test]
    fn test_success_rate_bounds_and_default() {
        let census = Census::new("broadcaster", "test-node");
        // No broadcasts at all.
        assert!((census.success_rate() - 1.0).abs() < f64::EPSILON);

        census.stream_created("node1|abc", 7);
        // A fresh averager has no qualifying entries.
        assert!((census.success_rate() - 1.0).abs() < f64::EPSILON);

        census.segment_emerged(7, 0, 2.0);
        census.segment_fully_transcoded(7, 0, 2.0, None);
        let rate = census.success_rate();
        assert!((0.0..=1.0).contains(&rate));
        assert!((rate - 1.0).abs() < f64::EPSILON);

        census.segment_emerged(7, 1, 2.0);
        census.segment_transcode_failed(SegmentTranscodeError::Transcode, 7, 1, "boom", true);
        let rate = census.success_rate();
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timeout_watcher_writes_off_lost_segments() {
        let census = Census::new("broadcaster", "test-node");
        census.stream_created("node1|abc", 1);
        census.segment_emerged(1, 0, 2.0);
        assert_eq!(census.pending_emerge_count(1), 1);

        census.sweep_at(Instant::now() + TIME_TO_WAIT_FOR_ERROR + Duration::from_millis(1));
        assert_eq!(census.pending_emerge_count(1), 0);
    }

    #[test]
    fn test_removed_broadcast_survives_for_scrape_then_goes() {
        let census = Census::new("broadcaster", "test-node");
        census.stream_created("node1|abc", 1);
        census.segment_emerged(1, 0, 2.0);
        // Segment still inside its error window, so the averager is kept.
        census.stream_ended(1);
        assert!(census.has_success_entry(1));

        // One error window later it is still visible...
        census.sweep_at(Instant::now() + TIME_TO_WAIT_FOR_ERROR);
        assert!(census.has_success_entry(1));

        // ...but not after two.
        census.sweep_at(Instant::now() + 2 * TIME_TO_WAIT_FOR_ERROR + Duration::from_secs(1));
        assert!(!census.has_success_entry(1));
    }

    #[test]
    fn test_stream_ended_drops_settled_broadcast_immediately() {
        let census = Census::new("broadcaster", "test-node");
        census.stream_created("node1|abc", 2);
        census.segment_emerged(2, 0, 2.0);
        census.segment_fully_transcoded(2, 0, 2.0, None);
        census.stream_ended(2);
        assert!(!census.has_success_entry(2));
    }

    #[test]
    fn test_upload_error_refinement() {
        assert_eq!(
            SegmentUploadError::Unknown.refine("Client timeout exceeded"),
            SegmentUploadError::Timeout
        );
        assert_eq!(
            SegmentUploadError::Unknown.refine("Session ended"),
            SegmentUploadError::SessionEnded
        );
        assert_eq!(
            SegmentUploadError::ObjectStorage.refine("timeout"),
            SegmentUploadError::ObjectStorage
        );
    }

    #[test]
    fn test_gather_exports_metrics_text() {
        let census = Census::new("broadcaster", "test-node");
        census.stream_created("node1|abc", 1);
        let text = census.gather();
        assert!(text.contains("vidmesh_stream_created_total"));
        assert!(text.contains("vidmesh_success_rate"));
    }

    #[test]
    fn test_session_ended_failure_is_not_counted_failed() {
        let census = Census::new("broadcaster", "test-node");
        census.stream_created("node1|abc", 3);
        census.segment_emerged(3, 0, 2.0);
        census.segment_fully_transcoded(
            3,
            0,
            2.0,
            Some(SegmentTranscodeError::SessionEnded),
        );
        // SessionEnded settles the segment without marking it failed; the
        // slot counts as transcoded-emerged for rate purposes.
        let rate = census.success_rate();
        assert!((0.0..=1.0).contains(&rate));
    }
}
