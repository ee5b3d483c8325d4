// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use futures::{StreamExt, TryStreamExt};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use tokio::net::TcpListener;
use tracing::{error, info};
use url::Url;

use relay_core::{ArchiveId, ByteStream, RelayError, TicketError, UploadTicket};
use relay_http::body::{json_body, str_param, BodyStream};
use relay_http::cors::add_cors_headers;
use relay_http::response::{self, ErrResponse, GenericResponse, ResponseResult};
use relay_http::signal::{Shutdown, ShutdownSignals};
use relay_http::Server;
use relay_protocol::PROTOCOL_VERSION;

use crate::api::{
    ApiError, ArchiveList, ArchiveSummary, CreateArchive, EntrySummary, FetchEntry, ProxyList,
    ServerVersion,
};
use crate::state::RelayState;
use crate::websocket::accept_delegate;
use crate::Config;

/// Serve the relay on `listener` until a shutdown signal arrives or `stop_server` resolves.
///
/// `post_setup_hook` is awaited once the server is ready to accept connections. Open archives
/// are finalized before this returns.
pub async fn run_server(
    config: Config,
    listener: TcpListener,
    post_setup_hook: impl Future<Output = ()>,
    stop_server: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr().context("reading listener address")?;
    let public_origin = public_origin(&config, local_addr)?;
    let state = Arc::new(RelayState::new(&config, &public_origin).await?);
    let server = Server::new(config.max_connections);

    info!("Listening on {local_addr}");
    let responder_state = state.clone();
    let run = server.serve_listener(listener, move |request, _| {
        let state = responder_state.clone();
        async move { respond(state, request).await }
    });

    let mut signals = ShutdownSignals::install().context("installing signal handlers")?;
    let on_signal = async {
        if signals.next().await? == Shutdown::Graceful {
            info!("Graceful shutdown requested...");
            tokio::select! {
                _ = server.graceful_shutdown() => return Ok(()),
                fast = signals.next() => fast.map(|_| ())?,
            }
        }
        info!("Fast shutdown requested...");
        Ok::<_, std::io::Error>(())
    };

    post_setup_hook.await;
    tokio::select! {
        biased;
        _ = stop_server => info!("Server stopped..."),
        _ = run => {},
        handled = on_signal => if let Err(err) = handled {
            error!("Stopped waiting for shutdown signals: {err}");
        },
    };

    state.shutdown().await;
    Ok(())
}

/// The configured public origin, or else one derived from the listening address.
fn public_origin(config: &Config, local_addr: SocketAddr) -> anyhow::Result<Url> {
    if let Some(origin) = &config.public_origin {
        return Url::parse(origin).with_context(|| format!("parsing public origin {origin:?}"));
    }
    let mut addr = local_addr;
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
    }
    Url::parse(&format!("http://{addr}")).context("deriving public origin")
}

async fn respond(state: Arc<RelayState>, request: Request<Incoming>) -> GenericResponse {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let path = request.uri().path().to_owned();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let mut response = match (&method, segments.as_slice()) {
        (&Method::OPTIONS, _) => response::empty(),
        (&Method::GET, ["version"]) => version(),
        (&Method::GET, ["v1", "archives"]) => list_archives(&state),
        (&Method::POST, ["v1", "archives"]) => handle_err(create_archive(&state, request)).await,
        (&Method::POST, ["v1", "archives", id, "close"])
        | (&Method::DELETE, ["v1", "archives", id]) => {
            handle_err(close_archive(&state, id)).await
        }
        (&Method::PUT | &Method::POST, ["v1", "archives", id, "entries"]) => {
            handle_err(add_entry(&state, id, request)).await
        }
        (&Method::POST, ["v1", "archives", id, "fetch"]) => {
            handle_err(fetch_entry(&state, id, request)).await
        }
        (&Method::PUT | &Method::POST, ["v1", "uploads", ticket]) => {
            handle_err(upload(&state, ticket, request)).await
        }
        (&Method::GET, ["v1", "proxy", host]) => accept_delegate(state.clone(), host, request),
        (&Method::GET, ["v1", "proxies"]) => response::json(
            StatusCode::OK,
            &ProxyList {
                hosts: state.relay.registry().hosts(),
            },
        ),
        (&Method::GET, ["v1", "delegate"]) => response::json(StatusCode::OK, &state.manifest),
        (&Method::GET, ["v1", "delegate", "artifact"]) => match &state.delegate_artifact {
            Some(artifact) => response::octets(StatusCode::OK, artifact.clone()),
            None => ApiError::not_found("The delegate artifact").into_response(),
        },
        _ => response::not_found(),
    };
    add_cors_headers(&headers, response.headers_mut(), &state.trusted_origins);
    response
}

async fn handle_err(future: impl Future<Output = ResponseResult>) -> GenericResponse {
    match future.await {
        Ok(r) | Err(ErrResponse(r)) => r,
    }
}

fn version() -> GenericResponse {
    response::json(
        StatusCode::OK,
        &ServerVersion {
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            protocol_version: PROTOCOL_VERSION,
        },
    )
}

fn archive_id(id: &str) -> Result<ArchiveId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::not_found(format!("Archive {id:?}")))
}

/// The request body as it arrives, for writing straight into an archive.
fn body_stream(request: Request<Incoming>) -> ByteStream {
    BodyStream(request.into_body())
        .map_err(std::io::Error::other)
        .boxed()
}

fn list_archives(state: &RelayState) -> GenericResponse {
    let root = state.relay.archives().root();
    let archives = state
        .relay
        .archives()
        .list()
        .iter()
        .map(|info| ArchiveSummary::new(info, root))
        .collect();
    response::json(StatusCode::OK, &ArchiveList { archives })
}

async fn create_archive(state: &RelayState, request: Request<Incoming>) -> ResponseResult {
    let CreateArchive { path } = json_body(request.into_body(), state.json_size_limit)
        .await
        .map_err(ApiError::from)?;
    let archives = state.relay.archives();
    let info = archives.create(&path).await.map_err(ApiError::from)?;
    Ok(response::json(
        StatusCode::CREATED,
        &ArchiveSummary::new(&info, archives.root()),
    ))
}

async fn close_archive(state: &RelayState, id: &str) -> ResponseResult {
    let id = archive_id(id)?;
    let archives = state.relay.archives();
    let info = archives.close(&id).await.map_err(ApiError::from)?;
    Ok(response::json(
        StatusCode::OK,
        &ArchiveSummary::new(&info, archives.root()),
    ))
}

async fn add_entry(state: &RelayState, id: &str, request: Request<Incoming>) -> ResponseResult {
    let id = archive_id(id)?;
    let name = str_param(request.uri(), "name").ok_or_else(|| ApiError::missing_param("name"))?;
    let size = state
        .relay
        .archives()
        .add_entry(&id, &name, body_stream(request))
        .await
        .map_err(ApiError::from)?;
    Ok(response::json(StatusCode::OK, &EntrySummary { name, size }))
}

async fn fetch_entry(state: &RelayState, id: &str, request: Request<Incoming>) -> ResponseResult {
    let id = archive_id(id)?;
    let FetchEntry { url, name, headers } = json_body(request.into_body(), state.json_size_limit)
        .await
        .map_err(ApiError::from)?;
    let entry = state
        .relay
        .relay(&id, &name, &url, headers)
        .await
        .map_err(ApiError::from)?;
    Ok(response::json(
        StatusCode::OK,
        &EntrySummary {
            name: entry.name,
            size: entry.size,
        },
    ))
}

async fn upload(state: &RelayState, ticket: &str, request: Request<Incoming>) -> ResponseResult {
    let ticket: UploadTicket = ticket
        .parse()
        .map_err(|_| ApiError::from(RelayError::InvalidTicket(TicketError::Unknown)))?;
    let size = state
        .relay
        .ingest(&ticket, body_stream(request))
        .await
        .map_err(ApiError::from)?;
    Ok(response::json(
        StatusCode::OK,
        &serde_json::json!({ "size": size }),
    ))
}
