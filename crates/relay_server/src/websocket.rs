// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delegate channels over websockets.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, info_span, warn, Instrument};

use relay_core::{drive, Channel, RpcPeer};
use relay_http::response::{self, GenericResponse};
use relay_protocol::normalize_host;

use crate::api::ApiError;
use crate::state::RelayState;

/// Answer a websocket upgrade request from a delegate serving `host`, then run its channel
/// in the background.
pub fn accept_delegate(
    state: Arc<RelayState>,
    host: &str,
    mut request: Request<Incoming>,
) -> GenericResponse {
    let host = normalize_host(host);
    if host.is_empty() {
        return ApiError::invalid_input("Delegates must name the origin host they serve.")
            .into_response();
    }
    let wants_websocket = request
        .headers()
        .get(UPGRADE)
        .is_some_and(|upgrade| upgrade.as_bytes().eq_ignore_ascii_case(b"websocket"));
    let Some(key) = request.headers().get(SEC_WEBSOCKET_KEY).filter(|_| wants_websocket) else {
        return ApiError::invalid_input("Expected a websocket upgrade request.").into_response();
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut request);
    let channel_state = state.clone();
    let span = info_span!("delegate", %host);
    let spawned = state.spawn_delegate(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    serve_channel(channel_state, host, socket).await;
                }
                Err(err) => warn!("Websocket upgrade failed: {err}"),
            }
        }
        .instrument(span),
    );
    if !spawned {
        return response::text(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down.");
    }

    let mut response = response::empty();
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept) = HeaderValue::from_str(&accept) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    response
}

/// Register the delegate for `host`, relay frames both ways until either side goes away, and
/// then unregister it. Calls still pending on the channel fail when it ends.
async fn serve_channel(
    state: Arc<RelayState>,
    host: String,
    socket: WebSocketStream<TokioIo<Upgraded>>,
) {
    let (channel, mut outbound) = Channel::open();
    let peer = Arc::new(RpcPeer::new(channel).with_deadline(state.call_timeout));
    let registry = state.relay.registry();
    if let Some(replaced) = registry.register(&host, peer.clone()) {
        info!(
            "Channel {} replaces channel {}",
            peer.channel_id(),
            replaced.channel_id()
        );
    }
    info!("Delegate connected on channel {}", peer.channel_id());

    let (mut sink, stream) = socket.split();
    let inbound = stream.filter_map(|message| futures::future::ready(frame_text(message)));
    let forward = async {
        while let Some(frame) = outbound.recv().await {
            if let Err(err) = sink.send(Message::Text(frame)).await {
                warn!("Could not write to delegate: {err}");
                break;
            }
        }
    };
    let mut shutdown = state.delegate_shutdown();

    tokio::select! {
        _ = drive(&peer, inbound) => {}
        _ = forward => {}
        _ = shutdown.wait_for(|&done| done) => info!("Closing delegate channel for shutdown"),
    }

    registry.unregister(&host, &peer);
    peer.close();
    let _ = sink.close().await;
    info!("Delegate disconnected");
}

/// The protocol text carried by a websocket message. Control frames carry none, and binary
/// frames that aren't UTF-8 are rejected.
fn frame_text(message: Result<Message, WsError>) -> Option<Result<String, WsError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Some(Ok(text)),
            Err(err) => {
                warn!("Rejected binary frame from delegate: {err}");
                None
            }
        },
        Ok(_) => None,
        Err(err) => Some(Err(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_utf8_frames_reach_the_channel() {
        let text = |message| frame_text(Ok(message)).map(Result::unwrap);
        assert_eq!(text(Message::Text("{}".into())).as_deref(), Some("{}"));
        assert_eq!(text(Message::Binary(b"{}".to_vec())).as_deref(), Some("{}"));
        assert_eq!(text(Message::Binary(vec![0xff, 0xfe, b'{'])), None);
        assert_eq!(text(Message::Ping(vec![1])), None);

        assert!(matches!(
            frame_text(Err(WsError::ConnectionClosed)),
            Some(Err(WsError::ConnectionClosed))
        ));
    }
}
