//! Route handlers mapping HTTP requests onto daemon operations.
//!
//! The wire encoding is plain JSON over a unix socket. Streamed operations
//! (create, launch, restore) buffer their intermediate replies and return
//! them alongside the final status; everything else maps the daemon's reply
//! or status directly.

use axum::extract::{Query, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use skiff_core::Daemon;
use skiff_protocol::{
    AuthenticateRequest, CreateReply, CreateRequest, DeleteRequest, GetRequest, InfoRequest,
    ListRequest, MountRequest, RecoverRequest, ReplyTx, RestartRequest, RestoreReply,
    RestoreRequest, SetRequest, SnapshotRequest, SshInfoRequest, StartRequest, Status, StatusCode,
    StopRequest, SuspendRequest, UmountRequest,
};

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    pub daemon: Daemon,
}

/// HTTP status for an operation status code.
fn http_status(code: StatusCode) -> HttpStatus {
    match code {
        StatusCode::Ok => HttpStatus::OK,
        StatusCode::InvalidArgument => HttpStatus::BAD_REQUEST,
        StatusCode::NotFound => HttpStatus::NOT_FOUND,
        StatusCode::AlreadyExists | StatusCode::Aborted => HttpStatus::CONFLICT,
        StatusCode::FailedPrecondition => HttpStatus::PRECONDITION_FAILED,
        StatusCode::ResourceExhausted => HttpStatus::TOO_MANY_REQUESTS,
        StatusCode::Unimplemented => HttpStatus::NOT_IMPLEMENTED,
        StatusCode::Internal | StatusCode::Unknown => HttpStatus::INTERNAL_SERVER_ERROR,
    }
}

fn status_response(status: Status) -> Response {
    (http_status(status.code), Json(status)).into_response()
}

fn reply_response<T: Serialize>(result: Result<T, Status>) -> Response {
    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(status) => status_response(status),
    }
}

/// A streamed operation's buffered replies plus its final status.
#[derive(Debug, Serialize)]
struct StreamedOutcome<T> {
    replies: Vec<T>,
    status: Status,
}

/// Creates the router with all daemon endpoints.
#[must_use]
pub fn create_router(daemon: Daemon) -> Router {
    let state = AppState { daemon };

    Router::new()
        .route("/v1/version", get(version))
        .route("/v1/networks", get(networks))
        .route("/v1/list", get(list))
        .route("/v1/info", post(info))
        .route("/v1/create", post(create))
        .route("/v1/launch", post(launch))
        .route("/v1/start", post(start))
        .route("/v1/stop", post(stop))
        .route("/v1/restart", post(restart))
        .route("/v1/suspend", post(suspend))
        .route("/v1/recover", post(recover))
        .route("/v1/delete", post(delete))
        .route("/v1/purge", post(purge))
        .route("/v1/mount", post(mount))
        .route("/v1/umount", post(umount))
        .route("/v1/snapshot", post(snapshot))
        .route("/v1/restore", post(restore))
        .route("/v1/ssh-info", post(ssh_info))
        .route("/v1/get", get(get_setting))
        .route("/v1/set", post(set_setting))
        .route("/v1/keys", get(keys))
        .route("/v1/authenticate", post(authenticate))
        .with_state(state)
}

async fn version(State(state): State<AppState>) -> Response {
    Json(state.daemon.version()).into_response()
}

async fn networks(State(state): State<AppState>) -> Response {
    reply_response(state.daemon.networks())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    ipv4: bool,
}

async fn list(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    reply_response(
        state
            .daemon
            .list(ListRequest {
                request_ipv4: params.ipv4,
            })
            .await,
    )
}

async fn info(State(state): State<AppState>, Json(request): Json<InfoRequest>) -> Response {
    reply_response(state.daemon.info(request).await)
}

async fn run_create(state: AppState, request: CreateRequest, start: bool) -> Response {
    let (reply, mut rx) = ReplyTx::channel();
    let status = if start {
        state.daemon.launch(request, &reply).await
    } else {
        state.daemon.create(request, &reply).await
    };
    drop(reply);

    let mut replies: Vec<CreateReply> = Vec::new();
    while let Ok(streamed) = rx.try_recv() {
        replies.push(streamed);
    }

    (
        http_status(status.code),
        Json(StreamedOutcome { replies, status }),
    )
        .into_response()
}

async fn create(State(state): State<AppState>, Json(request): Json<CreateRequest>) -> Response {
    run_create(state, request, false).await
}

async fn launch(State(state): State<AppState>, Json(request): Json<CreateRequest>) -> Response {
    run_create(state, request, true).await
}

async fn start(State(state): State<AppState>, Json(request): Json<StartRequest>) -> Response {
    status_response(state.daemon.start(request).await)
}

async fn stop(State(state): State<AppState>, Json(request): Json<StopRequest>) -> Response {
    status_response(state.daemon.stop(request).await)
}

async fn restart(State(state): State<AppState>, Json(request): Json<RestartRequest>) -> Response {
    status_response(state.daemon.restart(request).await)
}

async fn suspend(State(state): State<AppState>, Json(request): Json<SuspendRequest>) -> Response {
    status_response(state.daemon.suspend(request).await)
}

async fn recover(State(state): State<AppState>, Json(request): Json<RecoverRequest>) -> Response {
    status_response(state.daemon.recover(request).await)
}

async fn delete(State(state): State<AppState>, Json(request): Json<DeleteRequest>) -> Response {
    reply_response(state.daemon.delete(request).await)
}

async fn purge(State(state): State<AppState>) -> Response {
    reply_response(state.daemon.purge().await)
}

async fn mount(State(state): State<AppState>, Json(request): Json<MountRequest>) -> Response {
    status_response(state.daemon.mount(request).await)
}

async fn umount(State(state): State<AppState>, Json(request): Json<UmountRequest>) -> Response {
    status_response(state.daemon.umount(request).await)
}

async fn snapshot(State(state): State<AppState>, Json(request): Json<SnapshotRequest>) -> Response {
    reply_response(state.daemon.snapshot(request).await)
}

async fn restore(State(state): State<AppState>, Json(request): Json<RestoreRequest>) -> Response {
    let (reply, mut rx) = ReplyTx::channel();
    let status = state.daemon.restore(request, &reply).await;
    drop(reply);

    let mut replies: Vec<RestoreReply> = Vec::new();
    while let Ok(streamed) = rx.try_recv() {
        replies.push(streamed);
    }

    (
        http_status(status.code),
        Json(StreamedOutcome { replies, status }),
    )
        .into_response()
}

async fn ssh_info(State(state): State<AppState>, Json(request): Json<SshInfoRequest>) -> Response {
    reply_response(state.daemon.ssh_info(request).await)
}

#[derive(Debug, Deserialize)]
struct GetParams {
    key: String,
}

async fn get_setting(State(state): State<AppState>, Query(params): Query<GetParams>) -> Response {
    reply_response(state.daemon.get(GetRequest { key: params.key }))
}

async fn set_setting(State(state): State<AppState>, Json(request): Json<SetRequest>) -> Response {
    status_response(state.daemon.set(request))
}

async fn keys(State(state): State<AppState>) -> Response {
    Json(state.daemon.keys()).into_response()
}

async fn authenticate(
    State(state): State<AppState>,
    Json(request): Json<AuthenticateRequest>,
) -> Response {
    status_response(state.daemon.authenticate(request))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(StatusCode::Ok), HttpStatus::OK);
        assert_eq!(http_status(StatusCode::NotFound), HttpStatus::NOT_FOUND);
        assert_eq!(
            http_status(StatusCode::InvalidArgument),
            HttpStatus::BAD_REQUEST
        );
        assert_eq!(
            http_status(StatusCode::FailedPrecondition),
            HttpStatus::PRECONDITION_FAILED
        );
        assert_eq!(http_status(StatusCode::Aborted), HttpStatus::CONFLICT);
        assert_eq!(
            http_status(StatusCode::Unimplemented),
            HttpStatus::NOT_IMPLEMENTED
        );
    }
}
