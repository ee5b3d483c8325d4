// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A delegate's connection to the relay server.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use relay_protocol::{
    channel_url, DelegateManifest, Envelope, Outcome, Request, PROTOCOL_VERSION,
};

use crate::error::DelegateError;
use crate::executor::RelayExecutor;

/// Ask `server` where and how delegates should connect.
pub async fn discover(server: &Url) -> Result<DelegateManifest, DelegateError> {
    let url = server.join("/v1/delegate")?;
    let request_error = |status: Option<u16>| {
        let ctx = format!("fetching the delegate manifest from {url}");
        move |source: reqwest::Error| DelegateError::RequestError {
            ctx,
            status,
            source: Box::new(source),
        }
    };
    let response = reqwest::get(url.clone()).await.map_err(request_error(None))?;
    let status = Some(response.status().as_u16());
    let manifest: DelegateManifest = response
        .error_for_status()
        .map_err(request_error(status))?
        .json()
        .await
        .map_err(request_error(status))?;
    if !manifest.is_compatible() {
        return Err(DelegateError::IncompatibleProtocol {
            server: manifest.protocol_version,
            ours: PROTOCOL_VERSION,
        });
    }
    Ok(manifest)
}

/// Serves fetch instructions for one origin host over one channel.
pub struct DelegateSession {
    server: Url,
    host: String,
    executor: RelayExecutor,
}

impl DelegateSession {
    /// A session announcing itself to `server` as the delegate for `host`.
    pub fn new(server: Url, host: impl Into<String>, executor: RelayExecutor) -> Self {
        Self {
            server,
            host: host.into(),
            executor,
        }
    }

    /// Connect, then carry out instructions until the server closes the channel.
    ///
    /// Instructions run concurrently; each outcome is written back as soon as it is known.
    /// Instructions still running when the channel ends are abandoned.
    pub async fn run(&self) -> Result<(), DelegateError> {
        self.run_with(|| {}).await
    }

    /// Like [`run`](Self::run), but calls `connected` once the channel is up.
    pub async fn run_with(&self, connected: impl FnOnce()) -> Result<(), DelegateError> {
        let url = channel_url(&self.server, &self.host)?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!("Connected to {url}");
        connected();
        self.serve(socket).await
    }

    async fn serve<S>(&self, socket: S) -> Result<(), DelegateError>
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>,
    {
        let (mut sink, mut stream) = socket.split();
        let (outcomes, mut pending_outcomes) = mpsc::unbounded_channel::<String>();
        let mut executions = JoinSet::new();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.dispatch(&text, &mut executions, &outcomes);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
                Some(outcome) = pending_outcomes.recv() => {
                    sink.send(Message::Text(outcome)).await?;
                }
                Some(finished) = executions.join_next(), if !executions.is_empty() => {
                    if let Err(err) = finished {
                        warn!("Execution task failed: {err}");
                    }
                }
            }
        }
        info!("Channel closed by server");
        Ok(())
    }

    fn dispatch(
        &self,
        frame: &str,
        executions: &mut JoinSet<()>,
        outcomes: &mpsc::UnboundedSender<String>,
    ) {
        let envelope = match Envelope::<Request>::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Rejected instruction: {err}");
                if let Some(correlation_id) = err.correlation_id() {
                    send(
                        outcomes,
                        Envelope::new(correlation_id, Outcome::error(err)),
                    );
                }
                return;
            }
        };

        let Envelope {
            correlation_id,
            body: Request::Fetch(request),
        } = envelope;
        let executor = self.executor.clone();
        let outcomes = outcomes.clone();
        let span = info_span!("fetch", %correlation_id, url = %request.url);
        executions.spawn(
            async move {
                let outcome = executor.execute(request).await;
                send(&outcomes, Envelope::new(correlation_id, outcome));
            }
            .instrument(span),
        );
    }
}

fn send(outcomes: &mpsc::UnboundedSender<String>, envelope: Envelope<Outcome>) {
    match envelope.encode() {
        Ok(frame) => {
            debug!("Sending outcome for {}", envelope.correlation_id);
            // the channel is gone if this fails, and the server fails the call itself
            let _ = outcomes.send(frame);
        }
        Err(err) => warn!("Could not encode outcome: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use relay_protocol::{CorrelationId, FetchRequest};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    use crate::transport::test_utils::MockTransport;

    async fn next_outcome<S>(server: &mut WebSocketStream<S>) -> Envelope<Outcome>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            if let Message::Text(text) = server.next().await.unwrap().unwrap() {
                return Envelope::decode(&text).unwrap();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executes_instructions_and_rejects_unknown_ops() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let mut server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let transport = Arc::new(MockTransport {
            chunks: vec![b"hello"],
            ..Default::default()
        });
        let session = DelegateSession::new(
            Url::parse("http://relay.test").unwrap(),
            "origin2",
            RelayExecutor::new(transport.clone()),
        );

        let test = async {
            server
                .send(Message::Text(
                    r#"{"correlationId":1,"op":"explode"}"#.to_owned(),
                ))
                .await
                .unwrap();
            assert_eq!(
                next_outcome(&mut server).await,
                Envelope::new(
                    CorrelationId(1),
                    Outcome::error("unsupported op \"explode\"")
                )
            );

            // no correlation id, so nothing to answer
            server
                .send(Message::Text("garbage".to_owned()))
                .await
                .unwrap();

            let fetch = Envelope::new(
                CorrelationId(2),
                Request::Fetch(FetchRequest {
                    url: "https://origin2/readme".into(),
                    headers: vec![],
                    destination: "http://relay.test/v1/uploads/t".into(),
                }),
            );
            server
                .send(Message::Text(fetch.encode().unwrap()))
                .await
                .unwrap();
            assert_eq!(
                next_outcome(&mut server).await,
                Envelope::new(CorrelationId(2), Outcome::Success)
            );

            server.close(None).await.unwrap();
        };

        let (served, ()) = tokio::join!(session.serve(client), test);
        served.unwrap();
        assert_eq!(
            transport.uploads(),
            vec![(
                "http://relay.test/v1/uploads/t".to_owned(),
                b"hello".to_vec()
            )]
        );
    }
}
