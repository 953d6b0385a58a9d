//! Name-indexed directory of live streams and their HLS buffers.
//!
//! The registry is the lifecycle owner: deleting a stream also releases any
//! HLS buffer bound to the same id. All operations are safe under concurrent
//! callers; critical sections are O(1).

use std::sync::Arc;

use dashmap::DashMap;

use crate::buffer::HlsBuffer;
use crate::error::MediaError;
use crate::stream::{HlsStream, RtmpStream, Stream, StreamId, StreamKind};

#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<StreamId, Stream>,
    buffers: DashMap<StreamId, Arc<HlsBuffer>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing stream under `id`. Rejects duplicates.
    pub fn add_stream(&self, id: StreamId, stream: Stream) -> Result<(), MediaError> {
        match self.streams.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(MediaError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(stream);
                Ok(())
            }
        }
    }

    /// Construct and register an empty stream of the given kind.
    pub fn add_new_stream(&self, id: StreamId, kind: StreamKind) -> Result<Stream, MediaError> {
        let stream = match kind {
            StreamKind::Rtmp => Stream::Rtmp(Arc::new(RtmpStream::new(id.clone()))),
            StreamKind::Hls => Stream::Hls(Arc::new(HlsStream::new(id.clone()))),
        };
        self.add_stream(id, stream.clone())?;
        Ok(stream)
    }

    pub fn get_stream(&self, id: &StreamId) -> Option<Stream> {
        self.streams.get(id).map(|s| s.clone())
    }

    /// Idempotent delete; releases the HLS buffer bound to the id as well.
    pub fn delete_stream(&self, id: &StreamId) {
        self.streams.remove(id);
        self.buffers.remove(id);
    }

    pub fn get_hls_buffer(&self, id: &StreamId) -> Option<Arc<HlsBuffer>> {
        self.buffers.get(id).map(|b| Arc::clone(&b))
    }

    /// Create (or return the existing) HLS buffer for `id`.
    pub fn add_new_hls_buffer(&self, id: StreamId) -> Arc<HlsBuffer> {
        self.buffers
            .entry(id)
            .or_insert_with(|| Arc::new(HlsBuffer::new()))
            .clone()
    }

    pub fn delete_hls_buffer(&self, id: &StreamId) {
        self.buffers.remove(id);
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_add_is_rejected() {
        let registry = StreamRegistry::new();
        let id = StreamId::new("node1|abc");
        registry.add_new_stream(id.clone(), StreamKind::Rtmp).unwrap();

        let dup = Stream::Rtmp(Arc::new(RtmpStream::new(id.clone())));
        assert!(matches!(
            registry.add_stream(id.clone(), dup),
            Err(MediaError::AlreadyExists)
        ));
        // The first registration is undisturbed.
        assert!(registry.get_stream(&id).is_some());
    }

    #[test]
    fn test_delete_is_idempotent_and_releases_buffer() {
        let registry = StreamRegistry::new();
        let id = StreamId::new("node1|abc");
        registry.add_new_stream(id.clone(), StreamKind::Hls).unwrap();
        registry.add_new_hls_buffer(id.clone());

        registry.delete_stream(&id);
        assert!(registry.get_stream(&id).is_none());
        assert!(registry.get_hls_buffer(&id).is_none());

        // Second delete is a no-op.
        registry.delete_stream(&id);
    }

    #[test]
    fn test_add_new_hls_buffer_reuses_existing() {
        let registry = StreamRegistry::new();
        let id = StreamId::new("node1|abc");
        let a = registry.add_new_hls_buffer(id.clone());
        let b = registry.add_new_hls_buffer(id.clone());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_deletes_visible_to_subsequent_gets() {
        let registry = Arc::new(StreamRegistry::new());
        let id = StreamId::new("node1|abc");
        registry.add_new_stream(id.clone(), StreamKind::Rtmp).unwrap();

        let registry2 = Arc::clone(&registry);
        let id2 = id.clone();
        let handle = std::thread::spawn(move || registry2.delete_stream(&id2));
        handle.join().unwrap();

        assert!(registry.get_stream(&id).is_none());
    }
}
