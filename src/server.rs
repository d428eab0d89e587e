use std::{future::Future, io, net::SocketAddr, time::Duration};

use futures::future::BoxFuture;
use hyper::{server::conn::http1, service::Service, Request, Response};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::{config::ServerConfig, error::ServeError, no_cache::NoCache, static_files::StaticFiles};

const LISTEN_BACKLOG: i32 = 1024;
/// How long open connections may keep going after shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Pause after a failed accept, e.g. when the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Binds the listening socket. Must be called from inside a tokio runtime.
    ///
    /// Fails if something else is already listening on the address; there is no fallback port.
    pub fn bind(config: ServerConfig) -> Result<Self, ServeError> {
        let listener = listen(config.addr)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServeError::Bind {
                addr: config.addr,
                source,
            })?;
        Ok(Server { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// The listener is closed as soon as shutdown starts. Connections still in flight
    /// get [`SHUTDOWN_GRACE`] to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, config } = self;
        let service = NoCache::new(StaticFiles::new(config.root));
        let http = http1::Builder::new();
        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);

        tracing::info!(addr = %listener.local_addr().unwrap_or(config.addr), "Accepting requests.");

        loop {
            tokio::select! {
                (stream, peer) = accept_with_backoff(|| listener.accept()) => {
                    tracing::debug!(%peer, "Accepted connection");

                    let service = AccessLog { inner: service.clone(), peer };
                    let connection = graceful.watch(http.serve_connection(TokioIo::new(stream), service));
                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            tracing::debug!(%peer, %err, "Connection closed with error");
                        }
                    });
                }
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        drop(listener);

        tokio::select! {
            () = graceful.shutdown() => tracing::debug!("All connections closed"),
            () = tokio::time::sleep(SHUTDOWN_GRACE) => {
                tracing::warn!(grace = ?SHUTDOWN_GRACE, "Connections still open after grace period");
            }
        }
        Ok(())
    }
}

/// Retries `accept` until it yields a connection, sleeping [`ACCEPT_BACKOFF`] after each error.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                tracing::error!(%err, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn listen(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    // Lets a restarted server take the port over from sockets in TIME_WAIT.
    // Not set on Windows, where it would allow two live listeners.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// One log line per request, like a classic access log.
#[derive(Clone)]
struct AccessLog<S> {
    inner: S,
    peer: SocketAddr,
}

impl<S, B, ResBody> Service<Request<B>> for AccessLog<S>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let peer = self.peer;
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let response = self.inner.call(req);
        Box::pin(async move {
            let response = response.await?;
            tracing::info!(%peer, %method, path = %path, status = response.status().as_u16(), "Request");
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        path::Path,
    };

    use anyhow::Context as _;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpStream,
        sync::oneshot,
        task::JoinHandle,
    };

    use super::*;

    struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        fn assert_no_cache(&self) {
            assert_eq!(
                self.header("cache-control"),
                Some("no-cache, no-store, must-revalidate")
            );
            assert_eq!(self.header("pragma"), Some("no-cache"));
            assert_eq!(self.header("expires"), Some("0"));
        }
    }

    fn parse_reply(buf: &[u8]) -> anyhow::Result<Reply> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        let httparse::Status::Complete(head_len) = response.parse(buf)? else {
            anyhow::bail!("Incomplete response head");
        };
        Ok(Reply {
            status: response.code.context("Missing status code")?,
            headers: response
                .headers
                .iter()
                .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
            body: buf[head_len..].to_vec(),
        })
    }

    async fn fetch(addr: SocketAddr, method: &str, path: &str) -> anyhow::Result<Reply> {
        fetch_with(addr, method, path, "").await
    }

    /// `extra` holds additional header lines, each ending in CRLF.
    async fn fetch_with(
        addr: SocketAddr,
        method: &str,
        path: &str,
        extra: &str,
    ) -> anyhow::Result<Reply> {
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n{extra}\r\n"
        );
        send_raw(addr, request.as_bytes()).await
    }

    async fn send_raw(addr: SocketAddr, request: &[u8]) -> anyhow::Result<Reply> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request).await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        parse_reply(&buf)
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    fn start(
        root: &Path,
    ) -> anyhow::Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<Result<(), ServeError>>)> {
        let server = Server::bind(ServerConfig::new(loopback(), root.to_path_buf()))?;
        let addr = server.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Ok((addr, stop, handle))
    }

    #[tokio::test]
    async fn serves_files_without_caching() -> anyhow::Result<()> {
        let site = tempfile::tempdir()?;
        std::fs::write(site.path().join("index.html"), "<h1>RSG</h1>")?;
        let (addr, stop, handle) = start(site.path())?;

        let reply = fetch(addr, "GET", "/index.html").await?;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"<h1>RSG</h1>");
        assert_eq!(reply.header("content-type"), Some("text/html; charset=utf-8"));
        reply.assert_no_cache();

        let reply = fetch(addr, "GET", "/").await?;
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"<h1>RSG</h1>");
        reply.assert_no_cache();

        let _ = stop.send(());
        handle.await??;
        Ok(())
    }

    #[tokio::test]
    async fn every_status_carries_no_cache_headers() -> anyhow::Result<()> {
        let site = tempfile::tempdir()?;
        std::fs::create_dir(site.path().join("css"))?;
        std::fs::write(site.path().join("css/styles.css"), "body{}")?;
        let (addr, stop, handle) = start(site.path())?;

        for (method, path, status) in [
            ("GET", "/missing.js", 404),
            ("GET", "/../secret", 404),
            ("GET", "/css", 301),
            ("GET", "/css/", 200),
            ("HEAD", "/css/styles.css", 200),
            ("POST", "/css/styles.css", 501),
            ("GET", "/css/styles.css/", 404),
            ("GET", "/%ff", 400),
        ] {
            let reply = fetch(addr, method, path).await?;
            assert_eq!(reply.status, status, "{method} {path}");
            reply.assert_no_cache();
        }

        let unchanged = "If-Modified-Since: Fri, 01 Jan 2100 00:00:00 GMT\r\n";
        let reply = fetch_with(addr, "GET", "/css/styles.css", unchanged).await?;
        assert_eq!(reply.status, 304);
        assert!(reply.body.is_empty());
        reply.assert_no_cache();

        let _ = stop.send(());
        handle.await??;
        Ok(())
    }

    // hyper answers requests it cannot parse itself, before any service runs,
    // so those replies go out without the no-cache headers.
    #[tokio::test]
    async fn unparsable_requests_are_rejected_by_hyper() -> anyhow::Result<()> {
        let site = tempfile::tempdir()?;
        let (addr, stop, handle) = start(site.path())?;

        let reply = send_raw(addr, b"GARBAGE\r\n\r\n").await?;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.header("connection"), Some("close"));
        assert_eq!(reply.header("cache-control"), None);

        let _ = stop.send(());
        handle.await??;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accepts_back_off() {
        let started = tokio::time::Instant::now();
        let mut failures = 3;

        let accepted = accept_with_backoff(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
            } else {
                Ok(42)
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, 42);
        assert_eq!(failures, 0);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() -> anyhow::Result<()> {
        let site = tempfile::tempdir()?;
        let (addr, stop, handle) = start(site.path())?;
        fetch(addr, "GET", "/").await?;

        let _ = stop.send(());
        handle.await??;

        let again = Server::bind(ServerConfig::new(addr, site.path().to_path_buf()))?;
        assert_eq!(again.local_addr()?, addr);
        Ok(())
    }

    #[tokio::test]
    async fn second_instance_fails_to_bind() -> anyhow::Result<()> {
        let site = tempfile::tempdir()?;
        let first = Server::bind(ServerConfig::new(loopback(), site.path().to_path_buf()))?;
        let addr = first.local_addr()?;

        let second = Server::bind(ServerConfig::new(addr, site.path().to_path_buf()));
        match second {
            Err(ServeError::Bind { addr: failed, source }) => {
                assert_eq!(failed, addr);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            Err(err) => anyhow::bail!("unexpected error: {err}"),
            Ok(_) => anyhow::bail!("second listener bound to {addr}"),
        }
        Ok(())
    }
}
