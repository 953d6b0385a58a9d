//! HTTP media and control server.
//!
//! Playback lives under `/stream/{file}` and dispatches on the extension:
//! `.m3u8` playlists, `.ts` segment data and an `.flv` live fallback. The
//! control endpoints are unauthenticated and meant for loopback use.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vidmesh_core::chain::{self, ChainTimeouts};
use vidmesh_core::{census::Census, config, profiles, Error, Node, SessionCoordinator};
use vidmesh_media::StreamId;

/// Self-bond amount used during transcoder activation.
const ACTIVATION_STAKE: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
    pub node: Arc<Node>,
    pub census: Arc<Census>,
    pub chain_timeouts: ChainTimeouts,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/:file", get(stream_dispatch))
        .route("/transcode", get(transcode))
        .route("/setBroadcastConfig", get(set_broadcast_config))
        .route("/setTranscoderConfig", get(set_transcoder_config))
        .route("/activateTranscoder", get(activate_transcoder))
        .route("/localStreams", get(local_streams))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(
    addr: String,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("media server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn playback_error(err: &Error) -> Response {
    match err {
        Error::NotFound | Error::Eof => (StatusCode::NOT_FOUND, "not found").into_response(),
        other => {
            error!("playback error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

async fn stream_dispatch(
    Path(file): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if let Some(id) = file.strip_suffix(".m3u8") {
        return serve_playlist(&state, &StreamId::new(id)).await;
    }
    if file.ends_with(".ts") {
        return serve_segment(&state, &file).await;
    }
    if let Some(id) = file.strip_suffix(".flv") {
        return serve_flv(&state, &StreamId::new(id));
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn serve_playlist(state: &AppState, stream_id: &StreamId) -> Response {
    if stream_id.is_master_playlist() {
        // Master playlist assembly is not offered yet.
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    match state.coordinator.media_playlist(stream_id).await {
        Ok(playlist) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            playlist.to_m3u8(),
        )
            .into_response(),
        Err(e) => playback_error(&e),
    }
}

async fn serve_segment(state: &AppState, segment_name: &str) -> Response {
    match state.coordinator.hls_segment(segment_name).await {
        Ok(data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            data,
        )
            .into_response(),
        Err(e) => playback_error(&e),
    }
}

/// RTMP-play fallback: stream the raw demuxed frame payloads of the live
/// input. Remuxing into a container is left to the media framework in
/// front of this endpoint.
fn serve_flv(state: &AppState, stream_id: &StreamId) -> Response {
    let stream = match state.coordinator.rtmp_stream(stream_id) {
        Ok(stream) => stream,
        Err(e) => return playback_error(&e),
    };
    let receiver = match stream.subscribe() {
        Ok(receiver) => receiver,
        Err(_) => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    let frames = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(frame) => {
                    return Some((
                        Ok::<bytes::Bytes, std::io::Error>(frame.data().clone()),
                        receiver,
                    ))
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(frames),
    )
        .into_response()
}

/// Kick a transcode job for an advertised stream. Normally driven by
/// transcoders watching the job ledger; exposed here for direct invocation.
async fn transcode(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(strm_id) = params.get("strmID").filter(|s| !s.is_empty()) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Need to specify strmID").into_response();
    };

    let profiles = vec![profiles::p_240p_30fps_16_9()];
    match state.node.transcode(&StreamId::new(strm_id.as_str()), &profiles).await {
        Ok(ids) => {
            info!("new stream ids: {:?}", ids);
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            axum::Json(ids).into_response()
        }
        Err(e) => {
            error!("error transcoding: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Error transcoding.").into_response()
        }
    }
}

async fn set_broadcast_config(Query(params): Query<HashMap<String, String>>) -> Response {
    if let Some(price) = params.get("price") {
        match price.parse::<i64>() {
            Ok(price) => config::set_broadcast_price(price),
            Err(e) => {
                error!("price conversion failed: {}", e);
                return StatusCode::OK.into_response();
            }
        }
    }
    if let Some(job) = params.get("job") {
        match profiles::lookup(job) {
            Some(profile) => config::set_broadcast_profile(profile),
            None => error!("unknown job profile: {}", job),
        }
    }
    let settings = config::broadcast_settings();
    info!(
        "transcode job price: {}, job type: {}",
        settings.price, settings.profile.name
    );
    StatusCode::OK.into_response()
}

async fn set_transcoder_config(Query(params): Query<HashMap<String, String>>) -> Response {
    if let Some(feecut) = params.get("feecut") {
        match feecut.parse::<u8>() {
            Ok(feecut) => config::set_transcoder_fee_cut(feecut),
            Err(e) => {
                error!("fee cut conversion failed: {}", e);
                return StatusCode::OK.into_response();
            }
        }
    }
    if let Some(rewardcut) = params.get("rewardcut") {
        match rewardcut.parse::<u8>() {
            Ok(rewardcut) => config::set_transcoder_reward_cut(rewardcut),
            Err(e) => {
                error!("reward cut conversion failed: {}", e);
                return StatusCode::OK.into_response();
            }
        }
    }
    if let Some(price) = params.get("price") {
        match price.parse::<i64>() {
            Ok(price) => config::set_transcoder_segment_price(price),
            Err(e) => {
                error!("price conversion failed: {}", e);
                return StatusCode::OK.into_response();
            }
        }
    }
    let settings = config::transcoder_settings();
    info!(
        "transcoder fee cut: {}, reward cut: {}, segment price: {}",
        settings.fee_cut, settings.reward_cut, settings.segment_price
    );
    StatusCode::OK.into_response()
}

/// Multi-step on-chain registration plus self-bond.
async fn activate_transcoder(State(state): State<AppState>) -> Response {
    let Some(chain_client) = state.node.chain.clone() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no chain client configured")
            .into_response();
    };
    let settings = config::transcoder_settings();
    let result = chain::activate_transcoder(
        chain_client.as_ref(),
        &state.chain_timeouts,
        settings.fee_cut,
        settings.reward_cut,
        settings.segment_price,
        ACTIVATION_STAKE,
        &CancellationToken::new(),
    )
    .await;
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(Error::AlreadyExists) => {
            error!("transcoder is already active");
            (StatusCode::INTERNAL_SERVER_ERROR, "transcoder already active").into_response()
        }
        Err(e) => {
            error!("transcoder activation failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "activation failed").into_response()
        }
    }
}

async fn local_streams(State(state): State<AppState>) -> Response {
    let ids: Vec<String> = state
        .coordinator
        .local_stream_ids()
        .iter()
        .map(ToString::to_string)
        .collect();
    axum::Json(ids).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.census.gather(),
    )
        .into_response()
}
