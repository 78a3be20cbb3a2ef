//! HTTP inbound adapter.
//!
//! Routes, relative to the server root:
//! - `GET /stream/master.m3u8` and `GET /stream/{variant}.m3u8`
//! - `GET /stream/hls/{variant}/{index}.{ext}`
//! - `DELETE /sessions?deviceId=..&playSessionId=..`
//! - `GET /encodings`
//!
//! Stream routes take the full [`StreamRequest`] from the query string.
//! Subtitle streams cannot be expressed there, so master playlists served
//! here never advertise subtitle renditions.

use crate::application::StreamingService;
use crate::domain::jobs::{JobKind, JobSummary, StreamRequest};
use crate::domain::manifest::MAIN_VARIANT;
use crate::error::{RequestError, StreamError};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures::{future, stream, StreamExt};
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

pub fn router(service: Arc<StreamingService>) -> Router {
    Router::new()
        .route("/stream/:playlist", get(playlist))
        .route("/stream/hls/:variant/:file", get(segment))
        .route("/sessions", delete(stop_session))
        .route("/encodings", get(encodings))
        .with_state(service)
}

fn error_response(err: StreamError) -> (StatusCode, String) {
    let status = match &err {
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::Invalid(RequestError::SegmentOutOfRange { .. }) => StatusCode::NOT_FOUND,
        StreamError::Invalid(RequestError::TooManySegments { .. }) => StatusCode::BAD_REQUEST,
        // Client went away; nobody reads this.
        StreamError::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("Segment request failed: {}", err);
    }
    (status, err.to_string())
}

/// Loopback and private-range clients get the nominal rendition only.
pub fn is_local_network(peer: Option<SocketAddr>) -> bool {
    match peer.map(|addr| addr.ip()) {
        Some(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        Some(IpAddr::V6(ip)) => {
            // fc00::/7 unique local, fe80::/10 link local
            ip.is_loopback()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        None => false,
    }
}

/// Index from a segment file name such as `12.ts`.
fn parse_segment_file(file: &str, kind: JobKind) -> Option<u64> {
    let (index, extension) = file.rsplit_once('.')?;
    if extension != kind.segment_extension() {
        return None;
    }
    index.parse().ok()
}

fn segment_content_type(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Sequential => "video/mp2t",
        JobKind::Fragmented => "video/iso.segment",
    }
}

async fn playlist(
    State(service): State<Arc<StreamingService>>,
    Path(playlist): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Query(request): Query<StreamRequest>,
) -> Result<Response, (StatusCode, String)> {
    let variant = playlist
        .strip_suffix(".m3u8")
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no playlist {}", playlist)))?;

    let body = if variant == "master" {
        let local = is_local_network(peer.map(|ConnectInfo(addr)| addr));
        service.master_manifest(&request, local)
    } else if variant == MAIN_VARIANT {
        service
            .media_manifest(&request, variant)
            .map_err(error_response)?
    } else {
        return Err((StatusCode::NOT_FOUND, format!("no playlist {}", playlist)));
    };

    Ok(([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body).into_response())
}

async fn segment(
    State(service): State<Arc<StreamingService>>,
    Path((variant, file)): Path<(String, String)>,
    Query(request): Query<StreamRequest>,
) -> Result<Response, (StatusCode, String)> {
    let index = parse_segment_file(&file, request.kind)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("invalid segment {}", file)))?;
    debug!(variant = %variant, index, "Segment requested");

    // Dropping the handler, e.g. on client disconnect, stops the waits.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let delivery = service
        .segment(&request, index, &cancel)
        .await
        .map_err(error_response)?;
    let segment_file = tokio::fs::File::open(delivery.path())
        .await
        .map_err(|e| error_response(e.into()))?;

    let completion = stream::once(async move { delivery.complete() })
        .filter_map(|()| future::ready(None::<io::Result<Bytes>>));
    let body = Body::from_stream(ReaderStream::new(segment_file).chain(completion));

    Ok((
        [(header::CONTENT_TYPE, segment_content_type(request.kind))],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    device_id: String,
    play_session_id: String,
}

async fn stop_session(
    State(service): State<Arc<StreamingService>>,
    Query(session): Query<SessionQuery>,
) -> Json<serde_json::Value> {
    let stopped = service
        .stop_session(&session.device_id, &session.play_session_id)
        .await;
    Json(serde_json::json!({ "stopped": stopped }))
}

async fn encodings(State(service): State<Arc<StreamingService>>) -> Json<Vec<JobSummary>> {
    Json(service.active_jobs())
}
