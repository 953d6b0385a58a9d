//! RTMP ingest edge: bridges the wire-level RTMP server onto the session
//! coordinator. The publish hook mints the canonical stream id; demuxed
//! audio/video/metadata chunks become frames on the registered stream.

use std::collections::HashMap;
use std::sync::Arc;

use scuffle_rtmp::session::server::{ServerSessionError, SessionData, SessionHandler};
use scuffle_rtmp::ServerSession;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vidmesh_core::SessionCoordinator;
use vidmesh_media::{MediaFrame, RtmpStream};

pub struct IngestHandler {
    coordinator: Arc<SessionCoordinator>,
    streams: HashMap<u32, Arc<RtmpStream>>,
}

impl IngestHandler {
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self {
            coordinator,
            streams: HashMap::new(),
        }
    }
}

impl SessionHandler for IngestHandler {
    async fn on_publish(
        &mut self,
        stream_id: u32,
        app_name: &str,
        stream_key: &str,
    ) -> Result<(), ServerSessionError> {
        let id = self.coordinator.create_stream_id();
        info!(
            "rtmp publish app={} key={} assigned stream id {}",
            app_name, stream_key, id
        );

        let stream = Arc::new(RtmpStream::new(id));
        if let Err(e) = self.coordinator.start_publish(Arc::clone(&stream)).await {
            error!("publish rejected: {}", e);
            return Err(ServerSessionError::InvalidChunkSize(0));
        }
        self.streams.insert(stream_id, stream);
        Ok(())
    }

    async fn on_unpublish(&mut self, stream_id: u32) -> Result<(), ServerSessionError> {
        if let Some(stream) = self.streams.remove(&stream_id) {
            self.coordinator.end_publish(stream.id()).await;
        }
        Ok(())
    }

    async fn on_data(
        &mut self,
        stream_id: u32,
        data: SessionData,
    ) -> Result<(), ServerSessionError> {
        let Some(stream) = self.streams.get(&stream_id) else {
            return Ok(());
        };
        let frame = match data {
            SessionData::Video { timestamp, data } => MediaFrame::Video {
                timestamp,
                data: data.into(),
            },
            SessionData::Audio { timestamp, data } => MediaFrame::Audio {
                timestamp,
                data: data.into(),
            },
            SessionData::Amf0 { timestamp, data } => MediaFrame::Metadata {
                timestamp,
                data: data.into(),
            },
        };
        // Frames arriving after teardown are dropped, not fatal.
        if stream.write_frame(frame).is_err() {
            self.streams.remove(&stream_id);
        }
        Ok(())
    }
}

/// Accept RTMP connections until cancellation; one session per connection.
pub async fn run_rtmp_server(
    addr: String,
    coordinator: Arc<SessionCoordinator>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("rtmp server listening on {}", addr);

    loop {
        let (socket, peer) = tokio::select! {
            () = cancel.cancelled() => {
                info!("rtmp server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        info!("rtmp connection from {}", peer);

        let handler = IngestHandler::new(Arc::clone(&coordinator));
        tokio::spawn(async move {
            let session = ServerSession::new(socket, handler);
            if let Err(e) = session.run().await {
                warn!("rtmp session from {} ended with error: {:?}", peer, e);
            }
        });
    }
}
