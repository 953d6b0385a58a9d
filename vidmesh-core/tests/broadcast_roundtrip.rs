//! End-to-end broadcast flow over the in-process overlay: an RTMP publish is
//! segmented, advertised on the overlay, picked up by a subscriber, buffered
//! and served back as a playlist plus segment fetches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use vidmesh_core::census::Census;
use vidmesh_core::chain::ChainTimeouts;
use vidmesh_core::node::Node;
use vidmesh_core::session::{SessionConfig, SessionCoordinator};
use vidmesh_media::pubsub::InMemoryOverlay;
use vidmesh_media::{FrameSegmenter, MediaFrame, RtmpStream, StreamId, StreamRegistry};

fn coordinator(seg_length: Duration) -> Arc<SessionCoordinator> {
    let node = Node::new(
        "node1".to_string(),
        Arc::new(StreamRegistry::new()),
        Arc::new(InMemoryOverlay::new()),
        Arc::new(FrameSegmenter::new()),
        Census::new("broadcaster", "node1"),
        None,
        None,
    );
    SessionCoordinator::new(
        node,
        SessionConfig {
            seg_length,
            ..SessionConfig::default()
        },
        ChainTimeouts::default(),
    )
}

#[tokio::test]
async fn publish_then_subscribe_round_trip() {
    let coordinator = coordinator(Duration::from_secs(2));

    let rtmp = Arc::new(RtmpStream::new(StreamId::new("node1|ingest")));
    coordinator.start_publish(Arc::clone(&rtmp)).await.unwrap();

    // The paired HLS stream is the one advertised on the overlay.
    let hls_id = coordinator
        .local_stream_ids()
        .into_iter()
        .find(|id| id != rtmp.id())
        .expect("paired hls stream registered");

    // Subscribe before any segment exists.
    let viewer = {
        let coordinator = Arc::clone(&coordinator);
        let hls_id = hls_id.clone();
        tokio::spawn(async move { coordinator.media_playlist(&hls_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Five 2-second segments' worth of frames: timestamps 0..12s, with the
    // 12 s frame closing the fifth segment. The stream stays live so the
    // viewer reads a playlist, not an end-of-stream marker.
    for ts in (0..=12_000u32).step_by(500) {
        rtmp.write_frame(MediaFrame::Video {
            timestamp: ts,
            data: Bytes::from_static(b"\xaa"),
        })
        .unwrap();
    }

    let playlist = viewer.await.unwrap().unwrap();
    assert_eq!(playlist.entries.len(), 5);
    let seqs: Vec<u64> = playlist.entries.iter().map(|e| e.seq_no).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    for entry in &playlist.entries {
        assert!((entry.duration - 2.0).abs() < 0.6, "duration {}", entry.duration);
    }

    // Segment fetch by name returns the broadcast bytes.
    let name = &playlist.entries[3].name;
    let data = coordinator.hls_segment(name).await.unwrap();
    assert!(!data.is_empty());
    assert!(data.iter().all(|b| *b == 0xAA));

    let m3u8 = playlist.to_m3u8();
    assert!(m3u8.starts_with("#EXTM3U"));
    assert!(m3u8.contains(name.as_str()));

    coordinator.end_publish(rtmp.id()).await;
    assert!(coordinator.local_stream_ids().is_empty());
}

#[tokio::test]
async fn second_publish_of_same_id_fails() {
    let coordinator = coordinator(Duration::from_secs(2));
    let rtmp = Arc::new(RtmpStream::new(StreamId::new("node1|dup")));
    coordinator.start_publish(rtmp).await.unwrap();

    let second = Arc::new(RtmpStream::new(StreamId::new("node1|dup")));
    let err = coordinator.start_publish(second).await.unwrap_err();
    assert!(matches!(err, vidmesh_core::Error::AlreadyExists));
}
