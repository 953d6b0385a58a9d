//! Overlay pub/sub adapter: segment envelopes and the transport seam.
//!
//! The wire envelope is bit-exact and stable across nodes:
//!
//! ```text
//! u32 LE record_len | u64 LE seq_no | u16 LE name_len | name bytes
//!                   | f64 LE duration | u32 LE data_len | data bytes | u8 eof
//! ```
//!
//! EOF envelopes carry `data_len = 0`. Encoding is deterministic: the same
//! segment always produces the same bytes.
//!
//! Subscriptions are channel-based: a subscriber receives envelopes over a
//! bounded channel and may unsubscribe on EOF without any deadlock risk.
//! Per-topic ordering follows the publisher's write order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::HlsBuffer;
use crate::error::MediaError;
use crate::stream::HlsSegment;

/// Capacity of a subscription's inbound envelope channel.
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 64;

pub fn encode_segment(seg: &HlsSegment) -> Bytes {
    let name = seg.name.as_bytes();
    let data = if seg.eof { &[] as &[u8] } else { &seg.data };
    let record_len = 8 + 2 + name.len() + 8 + 4 + data.len() + 1;

    let mut buf = BytesMut::with_capacity(4 + record_len);
    buf.put_u32_le(record_len as u32);
    buf.put_u64_le(seg.seq_no);
    buf.put_u16_le(name.len() as u16);
    buf.put_slice(name);
    buf.put_f64_le(seg.duration);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.put_u8(u8::from(seg.eof));
    buf.freeze()
}

pub fn decode_segment(mut buf: &[u8]) -> Result<HlsSegment, MediaError> {
    if buf.len() < 4 {
        return Err(MediaError::EnvelopeDecode("short length prefix".into()));
    }
    let record_len = buf.get_u32_le() as usize;
    if buf.len() != record_len {
        return Err(MediaError::EnvelopeDecode(format!(
            "record length mismatch: prefix {record_len}, body {}",
            buf.len()
        )));
    }
    if buf.remaining() < 8 + 2 {
        return Err(MediaError::EnvelopeDecode("truncated header".into()));
    }
    let seq_no = buf.get_u64_le();
    let name_len = buf.get_u16_le() as usize;
    if buf.remaining() < name_len {
        return Err(MediaError::EnvelopeDecode("truncated name".into()));
    }
    let name = String::from_utf8(buf[..name_len].to_vec())
        .map_err(|e| MediaError::EnvelopeDecode(format!("name not utf-8: {e}")))?;
    buf.advance(name_len);
    if buf.remaining() < 8 + 4 {
        return Err(MediaError::EnvelopeDecode("truncated duration".into()));
    }
    let duration = buf.get_f64_le();
    let data_len = buf.get_u32_le() as usize;
    if buf.remaining() != data_len + 1 {
        return Err(MediaError::EnvelopeDecode("truncated data".into()));
    }
    let data = Bytes::copy_from_slice(&buf[..data_len]);
    buf.advance(data_len);
    let eof = buf.get_u8() != 0;

    Ok(HlsSegment {
        seq_no,
        name,
        duration,
        data,
        eof,
    })
}

/// Handle identifying one subscription on a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live subscription: envelopes arrive over the bounded channel.
pub struct Subscription {
    pub id: SubscriberId,
    pub topic: String,
    pub envelopes: mpsc::Receiver<Bytes>,
}

/// The overlay transport seam. Implementations own NAT traversal, routing
/// and the wire format below the envelope; per-topic publish order is
/// preserved end to end.
#[async_trait]
pub trait OverlayNetwork: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Bytes) -> Result<(), MediaError>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription, MediaError>;
    async fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Result<(), MediaError>;
}

/// Decode envelopes from a subscription into an HLS buffer until EOF,
/// cancellation, or the transport drops. Unsubscribes itself on EOF.
pub async fn pump_subscription(
    overlay: Arc<dyn OverlayNetwork>,
    mut sub: Subscription,
    buffer: Arc<HlsBuffer>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            recv = sub.envelopes.recv() => match recv {
                Some(env) => env,
                None => break,
            },
        };

        let seg = match decode_segment(&envelope) {
            Ok(seg) => seg,
            Err(e) => {
                tracing::error!("dropping undecodable envelope on {}: {}", sub.topic, e);
                continue;
            }
        };

        if seg.eof {
            tracing::info!("eof on {}, closing buffer", sub.topic);
            buffer.write_eof();
            if let Err(e) = overlay.unsubscribe(&sub.topic, sub.id).await {
                tracing::error!("unsubscribe {} failed: {}", sub.topic, e);
            }
            break;
        }
        buffer.write_segment(seg.seq_no, &seg.name, seg.duration, seg.data);
    }
}

struct TopicSubscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Bytes>,
}

/// In-process overlay used by single-node deployments and tests: a topic map
/// fanning envelopes out to subscriber channels in publish order.
#[derive(Default)]
pub struct InMemoryOverlay {
    topics: DashMap<String, Vec<TopicSubscriber>>,
}

impl InMemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

#[async_trait]
impl OverlayNetwork for InMemoryOverlay {
    async fn publish(&self, topic: &str, envelope: Bytes) -> Result<(), MediaError> {
        // Snapshot senders, then fan out without holding the shard lock.
        let snapshot: Vec<(SubscriberId, mpsc::Sender<Bytes>)> = match self.topics.get(topic) {
            Some(subs) => subs.iter().map(|s| (s.id, s.sender.clone())).collect(),
            None => return Ok(()),
        };

        let mut closed = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(envelope.clone()).await.is_err() {
                closed.push(id);
            }
        }
        if !closed.is_empty() {
            if let Some(mut subs) = self.topics.get_mut(topic) {
                subs.retain(|s| !closed.contains(&s.id));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, MediaError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let id = SubscriberId::new();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscriber { id, sender });
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            envelopes: receiver,
        })
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriberId) -> Result<(), MediaError> {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq_no: u64) -> HlsSegment {
        HlsSegment {
            seq_no,
            name: format!("node1|abc_{seq_no}.ts"),
            duration: 2.0,
            data: Bytes::from_static(b"\xaa\xbb\xcc"),
            eof: false,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let seg = segment(42);
        let decoded = decode_segment(&encode_segment(&seg)).unwrap();
        assert_eq!(decoded, seg);

        let eof = HlsSegment::eof();
        let decoded = decode_segment(&encode_segment(&eof)).unwrap();
        assert!(decoded.eof);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_encoding_is_deterministic_and_bit_exact() {
        let seg = HlsSegment {
            seq_no: 1,
            name: "a".into(),
            duration: 2.0,
            data: Bytes::from_static(&[0xAA]),
            eof: false,
        };
        let encoded = encode_segment(&seg);
        assert_eq!(encoded, encode_segment(&seg));

        // record_len = 8 + 2 + 1 + 8 + 4 + 1 + 1 = 25
        let mut expected = vec![25, 0, 0, 0];
        expected.extend_from_slice(&1u64.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.push(b'a');
        expected.extend_from_slice(&2.0f64.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.push(0xAA);
        expected.push(0);
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode_segment(&[]).is_err());
        assert!(decode_segment(&[1, 0, 0, 0]).is_err());

        let mut truncated = encode_segment(&segment(0)).to_vec();
        truncated.pop();
        assert!(decode_segment(&truncated).is_err());
    }

    #[tokio::test]
    async fn test_overlay_preserves_publish_order() {
        let overlay = InMemoryOverlay::new();
        let mut sub = overlay.subscribe("topic").await.unwrap();

        for seq in 0..10u64 {
            overlay
                .publish("topic", encode_segment(&segment(seq)))
                .await
                .unwrap();
        }
        for seq in 0..10u64 {
            let env = sub.envelopes.recv().await.unwrap();
            assert_eq!(decode_segment(&env).unwrap().seq_no, seq);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_topic_resources() {
        let overlay = InMemoryOverlay::new();
        let sub = overlay.subscribe("topic").await.unwrap();
        assert_eq!(overlay.subscriber_count("topic"), 1);
        overlay.unsubscribe("topic", sub.id).await.unwrap();
        assert_eq!(overlay.subscriber_count("topic"), 0);
    }

    #[tokio::test]
    async fn test_pump_writes_buffer_and_unsubscribes_on_eof() {
        let overlay: Arc<dyn OverlayNetwork> = Arc::new(InMemoryOverlay::new());
        let buffer = Arc::new(HlsBuffer::new());
        let sub = overlay.subscribe("node1|abc").await.unwrap();

        let pump = tokio::spawn(pump_subscription(
            Arc::clone(&overlay),
            sub,
            Arc::clone(&buffer),
            CancellationToken::new(),
        ));

        for seq in 0..3u64 {
            overlay
                .publish("node1|abc", encode_segment(&segment(seq)))
                .await
                .unwrap();
        }
        overlay
            .publish("node1|abc", encode_segment(&HlsSegment::eof()))
            .await
            .unwrap();

        pump.await.unwrap();
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_eof());
    }
}
