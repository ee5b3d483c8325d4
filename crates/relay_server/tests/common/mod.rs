// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper::header::COOKIE;
use hyper::{Method, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use relay_delegate::transport::test_utils::MockTransport;
use relay_delegate::{DelegateSession, RelayExecutor, RelayTransport, ReqwestTransport};
use relay_http::nursery::Nursery;
use relay_http::response;
use relay_http::Server;
use relay_server::api::ProxyList;
use relay_server::{run_server, Opts};

pub struct TestServer {
    server_port: u16,
    archive_root: tempfile::TempDir,
    stop_server: Arc<Notify>,
    server_task_nursery: Nursery,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let archive_root = tempfile::tempdir().unwrap();
        let (listener, server_port) = make_listener_on_free_port([127, 0, 0, 1]).await;
        let config = Opts::try_parse_from([
            "relay_server",
            "--archive-root",
            archive_root.path().to_str().unwrap(),
        ])
        .unwrap()
        .config;

        // signal to start once server is done setting up
        let finished_setup = Arc::new(Notify::new());
        // signal server to stop once tests are done
        let stop_server = Arc::new(Notify::new());

        let server_task_nursery = {
            let mut server_task_nursery = Nursery::new();
            let finished_setup = finished_setup.clone();
            let stop_server = stop_server.clone();
            server_task_nursery.spawn(async move {
                run_server(
                    config,
                    listener,
                    async {
                        finished_setup.notify_one();
                    },
                    async {
                        stop_server.notified().await;
                    },
                )
                .await
                .unwrap()
            });
            server_task_nursery
        };

        // wait for server to finish starting
        finished_setup.notified().await;

        Self {
            server_port,
            archive_root,
            stop_server,
            server_task_nursery,
        }
    }

    /// Stops the server, returning the directory its archives were written to.
    pub async fn stop(self) -> tempfile::TempDir {
        info!("stopping server...");
        self.stop_server.notify_one();
        self.server_task_nursery.finish().await;
        self.archive_root
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.server_port)
    }

    pub fn archive_root(&self) -> &Path {
        self.archive_root.path()
    }

    /// Connect a delegate for `host` and wait until the server has registered it.
    pub async fn connect_delegate(
        &self,
        host: &str,
        transport: Arc<dyn RelayTransport>,
    ) -> JoinHandle<()> {
        let server = Url::parse(&self.url("/")).unwrap();
        let session = DelegateSession::new(server, host, RelayExecutor::new(transport));
        let delegate = tokio::spawn(async move {
            if let Err(err) = session.run().await {
                info!("delegate ended: {err}");
            }
        });

        let client = reqwest::Client::new();
        for _ in 0..200 {
            let proxies: ProxyList = client
                .get(self.url("/v1/proxies"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if proxies.hosts.iter().any(|h| h == host) {
                return delegate;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("delegate for {host} never registered");
    }
}

/// A delegate that fetches from real origins, sending `cookies` to `origin`.
pub fn reqwest_transport(origin: &Url, cookies: &[&str]) -> Arc<dyn RelayTransport> {
    let jar = ReqwestTransport::cookie_jar(origin, cookies.iter().copied());
    Arc::new(ReqwestTransport::new(jar, true).unwrap())
}

pub fn mock_transport(transport: MockTransport) -> Arc<dyn RelayTransport> {
    Arc::new(transport)
}

/// Bind a tokio TcpListener on a free port (using the :0 method) and return it,
/// along with the port that was bound.
pub async fn make_listener_on_free_port(ip_addr: impl Into<IpAddr>) -> (TcpListener, u16) {
    let listener = TcpListener::bind(SocketAddr::from((ip_addr, 0)))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A plain HTTP server standing in for a remote origin.
///
/// Serves `/readme` and `/remote.bin`, `/private` only to requests carrying the
/// `session=abc` cookie, and 404s everything else.
pub struct OriginServer {
    pub origin: Url,
    server: Arc<Server>,
    task: JoinHandle<()>,
}

impl OriginServer {
    pub async fn spawn() -> Self {
        let (listener, port) = make_listener_on_free_port([127, 0, 0, 1]).await;
        let server = Arc::new(Server::new(16));
        let serving = server.clone();
        let task = tokio::spawn(async move {
            serving
                .serve_listener(listener, |request, _| async move {
                    let authorized = request
                        .headers()
                        .get(COOKIE)
                        .and_then(|cookie| cookie.to_str().ok())
                        .is_some_and(|cookie| cookie.contains("session=abc"));
                    match (request.method(), request.uri().path()) {
                        (&Method::GET, "/readme") => response::text(StatusCode::OK, "hello"),
                        (&Method::GET, "/remote.bin") => {
                            response::octets(StatusCode::OK, vec![0xde, 0xad, 0xbe, 0xef])
                        }
                        (&Method::GET, "/private") if authorized => {
                            response::text(StatusCode::OK, "secret")
                        }
                        (&Method::GET, "/private") => {
                            response::text(StatusCode::UNAUTHORIZED, "who are you?")
                        }
                        _ => response::not_found(),
                    }
                })
                .await
        });
        Self {
            origin: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            server,
            task,
        }
    }

    /// The registry key delegates for this origin use.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.origin.port().unwrap())
    }

    pub fn url(&self, path: &str) -> String {
        self.origin.join(path).unwrap().to_string()
    }

    pub async fn stop(self) {
        self.server.graceful_shutdown().await;
        self.task.await.unwrap();
    }
}

/// Every entry of the zip archive at `path`, in order.
pub fn read_zip(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut content = vec![];
            entry.read_to_end(&mut content).unwrap();
            (entry.name().to_owned(), content)
        })
        .collect()
}
