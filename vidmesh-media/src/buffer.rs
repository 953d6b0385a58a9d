//! Bounded, ordered HLS segment buffer with a playlist view and a blocking
//! segment fetch.
//!
//! Segments arrive from the overlay possibly out of order; the buffer keeps
//! them sorted by `seq_no`, evicts the oldest past capacity and serves a
//! sliding playlist window over the most recent entries. Waiters are woken by
//! `write_segment`/`write_eof` through a `Notify` instead of a sleep loop.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::MediaError;
use crate::stream::HlsSegment;

/// Default buffer capacity: 12 hours assuming 1 s segments.
pub const DEFAULT_BUFFER_CAPACITY: usize = 43_200;

/// Number of segments in the sliding playlist window.
pub const DEFAULT_PLAYLIST_WINDOW: usize = 5;

/// State of the playlist view.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaylistState {
    /// Enough segments buffered for a full window.
    Ready(MediaPlaylist),
    /// Fewer segments than the window and the stream is still live.
    Waiting,
    /// The stream ended; no further playlists will be produced.
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaylistEntry {
    pub seq_no: u64,
    pub name: String,
    pub duration: f64,
}

/// Media playlist over the current window, rendered on demand.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaPlaylist {
    pub media_sequence: u64,
    pub target_duration: u64,
    pub entries: Vec<PlaylistEntry>,
}

impl MediaPlaylist {
    pub fn to_m3u8(&self) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));
        for entry in &self.entries {
            out.push_str(&format!("#EXTINF:{:.3},\n", entry.duration));
            out.push_str(&format!("{}\n", entry.name));
        }
        out
    }
}

struct Inner {
    /// Sorted by `seq_no` ascending.
    segments: VecDeque<HlsSegment>,
    eof: bool,
}

pub struct HlsBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    window: usize,
}

impl HlsBuffer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_BUFFER_CAPACITY, DEFAULT_PLAYLIST_WINDOW)
    }

    pub fn with_limits(capacity: usize, window: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                segments: VecDeque::new(),
                eof: false,
            }),
            notify: Notify::new(),
            capacity,
            window,
        }
    }

    /// Insert a segment, keeping `seq_no` order. A duplicate `seq_no`
    /// overwrites the previous entry; the oldest segment is evicted past
    /// capacity. O(1) for in-order arrivals.
    pub fn write_segment(&self, seq_no: u64, name: &str, duration: f64, data: Bytes) {
        let segment = HlsSegment {
            seq_no,
            name: name.to_string(),
            duration,
            data,
            eof: false,
        };

        {
            let mut inner = self.inner.lock();
            // Common case: strictly newer than everything buffered.
            let in_order = inner.segments.back().map_or(true, |last| last.seq_no < seq_no);
            if in_order {
                inner.segments.push_back(segment);
            } else {
                // Reordered or duplicate arrival: walk to the slot.
                match inner.segments.iter().position(|s| s.seq_no >= seq_no) {
                    Some(i) if inner.segments[i].seq_no == seq_no => {
                        inner.segments[i] = segment;
                    }
                    Some(i) => inner.segments.insert(i, segment),
                    None => inner.segments.push_back(segment),
                }
            }
            while inner.segments.len() > self.capacity {
                inner.segments.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    /// Terminal marker: playlists report EOF and pending fetches unblock.
    pub fn write_eof(&self) {
        self.inner.lock().eof = true;
        self.notify.notify_waiters();
    }

    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    pub fn len(&self) -> usize {
        self.inner.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().segments.is_empty()
    }

    /// Sliding window over the most recent segments, `seq_no` ascending.
    pub fn latest_playlist(&self) -> PlaylistState {
        let inner = self.inner.lock();
        if inner.eof {
            return PlaylistState::Eof;
        }
        if inner.segments.len() < self.window {
            return PlaylistState::Waiting;
        }

        let skip = inner.segments.len() - self.window;
        let entries: Vec<PlaylistEntry> = inner
            .segments
            .iter()
            .skip(skip)
            .map(|s| PlaylistEntry {
                seq_no: s.seq_no,
                name: s.name.clone(),
                duration: s.duration,
            })
            .collect();

        let media_sequence = entries.first().map_or(0, |e| e.seq_no);
        let target_duration = entries
            .iter()
            .map(|e| e.duration.ceil() as u64)
            .max()
            .unwrap_or(0);

        PlaylistState::Ready(MediaPlaylist {
            media_sequence,
            target_duration,
            entries,
        })
    }

    /// Wait until a full playlist window is available, up to `timeout`.
    /// Returns `Eof` once the stream ended and `NotFound` on expiry.
    pub async fn playlist_within(&self, timeout: Duration) -> Result<MediaPlaylist, MediaError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.latest_playlist() {
                PlaylistState::Ready(pl) => return Ok(pl),
                PlaylistState::Eof => return Err(MediaError::Eof),
                PlaylistState::Waiting => {}
            }

            if Instant::now() >= deadline {
                return Err(MediaError::NotFound);
            }
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return Err(MediaError::NotFound),
            }
        }
    }

    /// Block until a segment named `name` is buffered or the deadline
    /// passes. The segment is not consumed. After EOF a missing segment
    /// reports `Eof`.
    pub async fn wait_and_pop_segment(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Bytes, MediaError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if let Some(seg) = inner.segments.iter().find(|s| s.name == name) {
                    return Ok(seg.data.clone());
                }
                if inner.eof {
                    return Err(MediaError::Eof);
                }
            }

            if Instant::now() >= deadline {
                return Err(MediaError::Timeout);
            }
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => return Err(MediaError::Timeout),
            }
        }
    }
}

impl Default for HlsBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buf: &HlsBuffer, seq_no: u64) {
        buf.write_segment(
            seq_no,
            &format!("seg_{seq_no}.ts"),
            2.0,
            Bytes::from_static(b"\xaa"),
        );
    }

    #[test]
    fn test_playlist_waits_below_window() {
        let buf = HlsBuffer::new();
        assert_eq!(buf.latest_playlist(), PlaylistState::Waiting);
        for seq in 0..4 {
            write(&buf, seq);
        }
        assert_eq!(buf.latest_playlist(), PlaylistState::Waiting);
        write(&buf, 4);
        match buf.latest_playlist() {
            PlaylistState::Ready(pl) => {
                assert_eq!(pl.media_sequence, 0);
                assert_eq!(pl.entries.len(), 5);
            }
            other => panic!("expected ready playlist, got {other:?}"),
        }
    }

    #[test]
    fn test_playlist_window_slides_and_orders() {
        let buf = HlsBuffer::new();
        for seq in 0..8 {
            write(&buf, seq);
        }
        let PlaylistState::Ready(pl) = buf.latest_playlist() else {
            panic!("expected ready playlist");
        };
        let seqs: Vec<u64> = pl.entries.iter().map(|e| e.seq_no).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7]);
        assert_eq!(pl.media_sequence, 3);
    }

    #[test]
    fn test_reordered_arrivals_sort_by_seq_no() {
        let buf = HlsBuffer::new();
        for seq in [2u64, 0, 4, 1, 3] {
            write(&buf, seq);
        }
        let PlaylistState::Ready(pl) = buf.latest_playlist() else {
            panic!("expected ready playlist");
        };
        let seqs: Vec<u64> = pl.entries.iter().map(|e| e.seq_no).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_seq_no_overwrites() {
        let buf = HlsBuffer::new();
        for seq in 0..5 {
            write(&buf, seq);
        }
        buf.write_segment(3, "seg_3.ts", 2.0, Bytes::from_static(b"\xbb"));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_eviction_past_capacity() {
        let buf = HlsBuffer::with_limits(10, 5);
        for seq in 0..25 {
            write(&buf, seq);
        }
        assert_eq!(buf.len(), 10);
        let PlaylistState::Ready(pl) = buf.latest_playlist() else {
            panic!("expected ready playlist");
        };
        assert_eq!(pl.media_sequence, 20);
    }

    #[test]
    fn test_eof_is_terminal_for_playlist() {
        let buf = HlsBuffer::new();
        for seq in 0..6 {
            write(&buf, seq);
        }
        buf.write_eof();
        assert_eq!(buf.latest_playlist(), PlaylistState::Eof);
    }

    #[test]
    fn test_m3u8_rendering() {
        let pl = MediaPlaylist {
            media_sequence: 3,
            target_duration: 2,
            entries: vec![PlaylistEntry {
                seq_no: 3,
                name: "seg_3.ts".into(),
                duration: 2.0,
            }],
        };
        let text = pl.to_m3u8();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
        assert!(text.contains("#EXTINF:2.000,\nseg_3.ts\n"));
    }

    #[tokio::test]
    async fn test_wait_and_pop_returns_existing() {
        let buf = HlsBuffer::new();
        buf.write_segment(0, "seg_0.ts", 2.0, Bytes::from_static(b"\xaa"));
        let data = buf
            .wait_and_pop_segment("seg_0.ts", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"\xaa"));
        // Read-only: a second fetch sees the same bytes.
        let again = buf
            .wait_and_pop_segment("seg_0.ts", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again, data);
    }

    #[tokio::test]
    async fn test_wait_and_pop_unblocks_on_write() {
        let buf = std::sync::Arc::new(HlsBuffer::new());
        let waiter = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move {
                buf.wait_and_pop_segment("seg_7.ts", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        buf.write_segment(7, "seg_7.ts", 2.0, Bytes::from_static(b"\xcc"));
        let data = waiter.await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"\xcc"));
    }

    #[tokio::test]
    async fn test_wait_and_pop_unblocks_on_eof() {
        let buf = std::sync::Arc::new(HlsBuffer::new());
        let waiter = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move {
                buf.wait_and_pop_segment("missing.ts", Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        buf.write_eof();
        assert!(matches!(waiter.await.unwrap(), Err(MediaError::Eof)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_pop_times_out() {
        let buf = HlsBuffer::new();
        let res = buf
            .wait_and_pop_segment("missing.ts", Duration::from_millis(100))
            .await;
        assert!(matches!(res, Err(MediaError::Timeout)));
    }

    #[tokio::test]
    async fn test_playlist_within_unblocks_on_writes() {
        let buf = std::sync::Arc::new(HlsBuffer::new());
        let waiter = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move { buf.playlist_within(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        for seq in 0..5 {
            write(&buf, seq);
        }
        let pl = waiter.await.unwrap().unwrap();
        assert_eq!(pl.entries.len(), 5);
    }
}
