// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fetching remote files into archives through delegates.

use std::sync::Arc;
use std::task::Poll;

use futures::{FutureExt, StreamExt};
use relay_protocol::{origin_key, FetchRequest, Outcome, Request, UPLOAD_PATH};
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};

use crate::archive::ByteStream;
use crate::error::RelayError;
use crate::paths::validate_entry_name;
use crate::registry::ProxyRegistry;
use crate::session::{ArchiveId, ArchiveSessionStore};
use crate::tickets::{Claim, TicketBook, TicketStatus, UploadTicket};

/// An entry that made it into an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayedEntry {
    pub name: String,
    pub size: u64,
}

/// Routes fetches to delegates and the resulting uploads into archives.
pub struct FetchRelay {
    registry: Arc<ProxyRegistry>,
    archives: Arc<ArchiveSessionStore>,
    tickets: TicketBook,
    /// Where delegates can reach this server, without a trailing slash.
    public_origin: String,
}

impl FetchRelay {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        archives: Arc<ArchiveSessionStore>,
        public_origin: &str,
    ) -> Self {
        Self {
            registry,
            archives,
            tickets: TicketBook::new(),
            public_origin: public_origin.trim_end_matches('/').to_owned(),
        }
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn archives(&self) -> &Arc<ArchiveSessionStore> {
        &self.archives
    }

    /// Have the delegate for `url`'s host fetch it and upload it as entry `name` of `archive`.
    ///
    /// Only resolves once the delegate is done, and only succeeds once the entry has been
    /// completely written. Routing problems are reported on the first poll, without waiting
    /// on anything.
    pub async fn relay(
        &self,
        archive: &ArchiveId,
        name: &str,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<RelayedEntry, RelayError> {
        let name = validate_entry_name(name)?;
        if !self.archives.contains(archive) {
            return Err(RelayError::ArchiveNotFound(*archive));
        }
        let host = origin_key(url)?;
        let peer = self
            .registry
            .lookup(&host)
            .ok_or_else(|| RelayError::NoDelegate { host: host.clone() })?;

        let ticket = IssuedTicket {
            book: &self.tickets,
            ticket: self.tickets.issue(*archive, name),
        };
        let request = Request::Fetch(FetchRequest {
            url: url.to_owned(),
            headers,
            destination: self.destination(&ticket.ticket),
        });

        let span = info_span!("relay", %archive, entry = name, %host);
        async move {
            info!("Relaying {url}");
            let outcome = peer.call(request).await;
            let uploaded = ticket.revoke();
            match (outcome?, uploaded) {
                (Outcome::Success, Some(TicketStatus::Completed { size })) => {
                    info!("Relayed {size} bytes");
                    Ok(RelayedEntry {
                        name: name.to_owned(),
                        size,
                    })
                }
                (Outcome::Success, status) => {
                    warn!("Delegate reported success, but the upload ended as {status:?}");
                    Err(RelayError::relay(
                        "delegate reported success without completing the upload",
                    ))
                }
                (Outcome::Error { error }, _) => {
                    warn!("Delegate failed: {error}");
                    Err(RelayError::Relay { cause: error })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Write an upload made with `ticket` into the archive entry the ticket was issued for.
    ///
    /// Returns once `content` has been entirely consumed and written, or has failed. If the
    /// relay the ticket belongs to ends first, the upload fails and the entry is dropped.
    pub async fn ingest(
        &self,
        ticket: &UploadTicket,
        content: ByteStream,
    ) -> Result<u64, RelayError> {
        let Claim {
            archive,
            entry,
            revoked,
        } = self.tickets.claim(ticket)?;
        let content = until_revoked(content, revoked);
        let result = self.archives.add_entry(&archive, &entry, content).await;
        let status = match &result {
            Ok(size) => TicketStatus::Completed { size: *size },
            Err(err) => TicketStatus::Failed {
                cause: err.to_string(),
            },
        };
        self.tickets.settle(ticket, status);
        result
    }

    fn destination(&self, ticket: &UploadTicket) -> String {
        format!("{}{UPLOAD_PATH}{ticket}", self.public_origin)
    }
}

/// `content`, failing as soon as `revoked` resolves.
fn until_revoked(mut content: ByteStream, revoked: oneshot::Receiver<()>) -> ByteStream {
    let mut revoked = revoked.fuse();
    futures::stream::poll_fn(move |cx| {
        if revoked.poll_unpin(cx).is_ready() {
            return Poll::Ready(Some(Err(std::io::Error::other(
                "upload ticket was revoked",
            ))));
        }
        content.poll_next_unpin(cx)
    })
    .boxed()
}

/// Revokes its ticket when dropped, so abandoned relays don't leave uploads open.
struct IssuedTicket<'a> {
    book: &'a TicketBook,
    ticket: UploadTicket,
}

impl IssuedTicket<'_> {
    fn revoke(self) -> Option<TicketStatus> {
        self.book.revoke(&self.ticket)
    }
}

impl Drop for IssuedTicket<'_> {
    fn drop(&mut self) {
        self.book.revoke(&self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::io::Read;

    use std::time::Duration;

    use bytes::Bytes;
    use relay_protocol::Envelope;

    use crate::archive::{ArchiveError, ZipFormat};
    use crate::channel::{Channel, Outbound};
    use crate::paths::ConfinedRoot;
    use crate::rpc::RpcPeer;

    struct Fixture {
        _dir: tempfile::TempDir,
        relay: FetchRelay,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let archives = ArchiveSessionStore::new(ConfinedRoot::new(dir.path()), Arc::new(ZipFormat));
        let relay = FetchRelay::new(
            Arc::new(ProxyRegistry::new()),
            Arc::new(archives),
            "http://relay.test/",
        );
        Fixture { _dir: dir, relay }
    }

    fn connect(relay: &FetchRelay, host: &str) -> (Arc<RpcPeer>, Outbound) {
        let (channel, outbound) = Channel::open();
        let peer = Arc::new(RpcPeer::new(channel));
        relay.registry().register(host, peer.clone());
        (peer, outbound)
    }

    fn bytes(content: &'static [u8]) -> ByteStream {
        futures::stream::once(async move { Ok(Bytes::from_static(content)) }).boxed()
    }

    async fn next_fetch(outbound: &mut Outbound) -> Envelope<Request> {
        Envelope::decode(&outbound.recv().await.unwrap()).unwrap()
    }

    fn ticket_of(fetch: &FetchRequest) -> UploadTicket {
        let (base, ticket) = fetch.destination.rsplit_once('/').unwrap();
        assert_eq!(base, "http://relay.test/v1/uploads");
        ticket.parse().unwrap()
    }

    fn reply(peer: &RpcPeer, id: relay_protocol::CorrelationId, outcome: Outcome) {
        peer.handle_frame(&Envelope::new(id, outcome).encode().unwrap())
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn relayed_bytes_land_in_the_archive() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("out/a.zip").await.unwrap();
        let (peer, mut outbound) = connect(&relay, "origin2");

        let size = relay
            .archives()
            .add_entry(&archive.id, "readme.txt", bytes(b"hello"))
            .await
            .unwrap();
        assert_eq!(size, 5);

        let relayed = relay.relay(&archive.id, "remote.bin", "https://origin2/data", vec![]);
        let delegate = async {
            let request = next_fetch(&mut outbound).await;
            let Request::Fetch(fetch) = request.body;
            assert_eq!(fetch.url, "https://origin2/data");
            let ticket = ticket_of(&fetch);
            let size = relay
                .ingest(&ticket, bytes(&[0xde, 0xad, 0xbe, 0xef]))
                .await
                .unwrap();
            assert_eq!(size, 4);
            reply(&peer, request.correlation_id, Outcome::Success);
            ticket
        };
        let (relayed, ticket) = tokio::join!(relayed, delegate);
        assert_eq!(
            relayed.unwrap(),
            RelayedEntry {
                name: "remote.bin".into(),
                size: 4
            }
        );

        // tickets die with their relay
        assert!(matches!(
            relay.ingest(&ticket, bytes(b"again")).await,
            Err(RelayError::InvalidTicket(_))
        ));

        let closed = relay.archives().close(&archive.id).await.unwrap();
        let mut zip = zip::ZipArchive::new(File::open(closed.path).unwrap()).unwrap();
        let mut content = vec![];
        zip.by_name("remote.bin")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, [0xde, 0xad, 0xbe, 0xef]);

        assert!(matches!(
            relay
                .archives()
                .add_entry(&archive.id, "late", bytes(b"x"))
                .await,
            Err(RelayError::ArchiveNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_delegates_fail_without_suspending() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("a.zip").await.unwrap();

        let result = relay
            .relay(&archive.id, "remote.bin", "https://origin2/data", vec![])
            .now_or_never()
            .expect("routing failures must not suspend");
        assert!(matches!(
            result,
            Err(RelayError::NoDelegate { host }) if host == "origin2"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unknown_archives_and_bad_urls_are_rejected() {
        let Fixture { _dir, relay } = fixture();
        let unknown: ArchiveId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let result = relay
            .relay(&unknown, "x", "https://origin2/data", vec![])
            .now_or_never()
            .unwrap();
        assert!(matches!(result, Err(RelayError::ArchiveNotFound(_))));

        let archive = relay.archives().create("a.zip").await.unwrap();
        let result = relay
            .relay(&archive.id, "x", "ftp://origin2/data", vec![])
            .now_or_never()
            .unwrap();
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn delegate_errors_are_surfaced_verbatim() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("a.zip").await.unwrap();
        let (peer, mut outbound) = connect(&relay, "origin2");

        let relayed = relay.relay(&archive.id, "missing.bin", "https://origin2/nope", vec![]);
        let delegate = async {
            let request = next_fetch(&mut outbound).await;
            reply(
                &peer,
                request.correlation_id,
                Outcome::error("fetch of https://origin2/nope failed with HTTP 404"),
            );
        };
        let (relayed, ()) = tokio::join!(relayed, delegate);
        match relayed {
            Err(RelayError::Relay { cause }) => assert!(cause.contains("404")),
            other => panic!("expected a relay failure, got {other:?}"),
        }

        // no entry was created
        let closed = relay.archives().close(&archive.id).await.unwrap();
        let zip = zip::ZipArchive::new(File::open(closed.path).unwrap()).unwrap();
        assert_eq!(zip.len(), 0);
        // the delegate channel is still usable
        assert!(!peer.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn success_without_upload_is_a_failure() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("a.zip").await.unwrap();
        let (peer, mut outbound) = connect(&relay, "origin2");

        let relayed = relay.relay(&archive.id, "x", "https://origin2/data", vec![]);
        let delegate = async {
            let request = next_fetch(&mut outbound).await;
            reply(&peer, request.correlation_id, Outcome::Success);
        };
        let (relayed, ()) = tokio::join!(relayed, delegate);
        assert!(matches!(relayed, Err(RelayError::Relay { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn closed_channels_interrupt_relays() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("a.zip").await.unwrap();
        let (peer, mut outbound) = connect(&relay, "origin2");

        let relayed = relay.relay(&archive.id, "x", "https://origin2/data", vec![]);
        let disconnect = async {
            next_fetch(&mut outbound).await;
            peer.close();
        };
        let (relayed, ()) = tokio::join!(relayed, disconnect);
        assert!(matches!(relayed, Err(RelayError::Interrupted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_relays_cancel_their_uploads() {
        let Fixture { _dir, relay } = fixture();
        let archive = relay.archives().create("a.zip").await.unwrap();
        let (channel, mut outbound) = Channel::open();
        let peer = Arc::new(RpcPeer::new(channel).with_deadline(Some(Duration::from_millis(50))));
        relay.registry().register("origin2", peer.clone());

        let relayed = relay.relay(&archive.id, "remote.bin", "https://origin2/data", vec![]);
        let delegate = async {
            let request = next_fetch(&mut outbound).await;
            let Request::Fetch(fetch) = request.body;
            let slow = futures::stream::once(async { Ok(Bytes::from_static(&[0xde, 0xad])) })
                .chain(futures::stream::once(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Bytes::from_static(&[0xbe, 0xef]))
                }))
                .boxed();
            relay.ingest(&ticket_of(&fetch), slow).await
        };
        let (relayed, ingested) = tokio::join!(relayed, delegate);
        assert!(matches!(relayed, Err(RelayError::TimedOut(_))), "{relayed:?}");
        assert!(
            matches!(
                ingested,
                Err(RelayError::Archive(ArchiveError::Source { .. }))
            ),
            "{ingested:?}"
        );

        // nothing is left behind to block a retry
        relay
            .archives()
            .add_entry(&archive.id, "remote.bin", bytes(b"retry"))
            .await
            .unwrap();
        let closed = relay.archives().close(&archive.id).await.unwrap();
        let mut zip = zip::ZipArchive::new(File::open(closed.path).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut content = vec![];
        zip.by_name("remote.bin")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"retry");
    }
}
