use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    time::Instant,
};
use uuid::Uuid;

use crate::bore::{
    net, telemetry,
    tunnel::{
        CONTROL_PORT,
        auth::Authenticator,
        conn::{self, BufConn},
        pending::{PENDING_TIMEOUT, PendingConnections},
        protocol::{self, ClientMessage, ProtocolError, ServerMessage},
        relay,
    },
};

/// Accept deadline on a leased port; a heartbeat goes out every time it lapses.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a failed accept on the control port (EMFILE and friends).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound TCP connections for the accept loops.
pub(crate) trait Acceptor: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Waits up to `window` for one connection. An accept error is logged and the
/// rest of the window is slept off, so a failing listener cannot spin.
async fn accept_within<L: Acceptor>(ln: &L, window: Duration) -> Option<(TcpStream, SocketAddr)> {
    let deadline = Instant::now() + window;
    match tokio::time::timeout_at(deadline, ln.accept()).await {
        Err(_elapsed) => None,
        Ok(Err(err)) => {
            tracing::debug!(err = %err, "server: accept failed");
            tokio::time::sleep_until(deadline).await;
            None
        }
        Ok(Ok(v)) => Some(v),
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface for the control port and every leased port.
    pub bind_addr: String,
    pub control_port: u16,
    /// Lowest nonzero port a client may request.
    pub min_port: u16,
    pub secret: Option<String>,
    pub heartbeat_interval: Duration,
    pub pending_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            control_port: CONTROL_PORT,
            min_port: 1023,
            secret: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pending_timeout: PENDING_TIMEOUT,
        }
    }
}

struct Shared {
    opts: ServerOptions,
    auth: Option<Authenticator>,
    pending: Arc<PendingConnections<TcpStream>>,
}

pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        let auth = opts
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Authenticator::new);
        let pending = PendingConnections::new(opts.pending_timeout);
        Self {
            shared: Arc::new(Shared {
                opts,
                auth,
                pending,
            }),
        }
    }

    pub fn pending(&self) -> Arc<PendingConnections<TcpStream>> {
        self.shared.pending.clone()
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = net::join_host_port(&self.shared.opts.bind_addr, self.shared.opts.control_port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("server: bind control port {addr}"))
    }

    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = self.bind().await?;
        self.serve(ln, shutdown).await
    }

    /// Runs the control-port accept loop until shutdown. Each connection gets
    /// its own task; a failing or panicking session never stops the loop, and
    /// neither does a failed accept.
    pub async fn serve(
        &self,
        ln: TcpListener,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.serve_on(ln, shutdown).await
    }

    pub(crate) async fn serve_on<L: Acceptor>(
        &self,
        ln: L,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = %ln.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            min_port = self.shared.opts.min_port,
            auth = self.shared.auth.is_some(),
            "server: listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "server: accept control connection failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    tracing::info!(control = %peer, "server: incoming connection");
                    metrics::counter!(telemetry::CONTROL_SESSIONS_TOTAL).increment(1);

                    let session = tokio::spawn(self.shared.clone().handle_connection(stream, peer));
                    tokio::spawn(async move {
                        match session.await {
                            Ok(Ok(())) => tracing::info!(control = %peer, "server: connection exited"),
                            Ok(Err(err)) => tracing::warn!(control = %peer, err = %format!("{err:#}"), "server: connection exited with error"),
                            Err(err) if err.is_panic() => tracing::error!(control = %peer, "server: connection handler panicked"),
                            Err(_) => {}
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

impl Shared {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut conn = conn::buffered(stream);

        if let Some(auth) = &self.auth {
            if let Err(err) = auth.server_handshake(&mut conn).await {
                tracing::warn!(control = %peer, err = %err, "server: authentication failed");
                metrics::counter!(telemetry::AUTH_FAILURES_TOTAL).increment(1);
                protocol::send(&mut conn, &ServerMessage::Error("authentication failed".into()))
                    .await?;
                return Ok(());
            }
        }

        match protocol::recv_client(&mut conn).await {
            Ok(ClientMessage::Hello(port)) => self.serve_lease(conn, port).await,
            Ok(ClientMessage::Accept(id)) => self.forward(conn, id).await,
            Ok(ClientMessage::Authenticate(_)) => {
                tracing::error!(control = %peer, "server: unexpected authenticate message");
                Ok(())
            }
            Err(ProtocolError::Closed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Binds the requested public port and loops: heartbeat, short accept,
    /// announce any new user connection. Ends when a control write fails.
    /// The listener is dropped on every return path.
    async fn serve_lease(&self, mut conn: BufConn<TcpStream>, port: u16) -> anyhow::Result<()> {
        if port != 0 && port < self.opts.min_port {
            tracing::warn!(port, min_port = self.opts.min_port, "server: client port number too low");
            protocol::send(&mut conn, &ServerMessage::Error("client port number too low".into()))
                .await?;
            return Ok(());
        }
        tracing::info!(port, "server: new client");

        let addr = net::join_host_port(&self.opts.bind_addr, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(ln) => ln,
            Err(err) => {
                tracing::error!(port, err = %err, "server: could not bind to local port");
                protocol::send(&mut conn, &ServerMessage::Error("port already in use".into()))
                    .await?;
                return Ok(());
            }
        };

        let bound = listener.local_addr()?.port();
        protocol::send(&mut conn, &ServerMessage::Hello(bound)).await?;

        loop {
            if let Err(err) = protocol::send(&mut conn, &ServerMessage::Heartbeat).await {
                tracing::info!(port = bound, err = %err, "server: control connection lost; closing listener");
                return Ok(());
            }

            let Some((user, addr)) = accept_within(&listener, self.opts.heartbeat_interval).await
            else {
                continue;
            };
            metrics::counter!(telemetry::USER_CONNECTIONS_TOTAL).increment(1);

            let id = self.pending.insert(user);
            tracing::info!(
                addr = %addr,
                port = bound,
                id = %id,
                pending = self.pending.len(),
                "server: new connection"
            );
            protocol::send(&mut conn, &ServerMessage::Connection(id))
                .await
                .context("server: announce connection")?;
        }
    }

    /// Pairs a data connection with the pending user connection it claims.
    async fn forward(&self, conn: BufConn<TcpStream>, id: Uuid) -> anyhow::Result<()> {
        tracing::info!(id = %id, "server: forwarding connection");

        let Some(mut user) = self.pending.take(&id) else {
            tracing::warn!(id = %id, "server: missing connection");
            return Ok(());
        };

        let mut data = conn::flush_buffered(conn, &mut user).await?;
        let stats = relay::relay(&mut data, &mut user).await;
        tracing::debug!(
            id = %id,
            to_user = stats.a_to_b,
            from_user = stats.b_to_a,
            "server: relay finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Fails the first `failures` accepts with EMFILE, then behaves normally.
    struct ExhaustedListener {
        inner: TcpListener,
        failures: AtomicUsize,
    }

    impl ExhaustedListener {
        async fn bind(failures: usize) -> Self {
            Self {
                inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl Acceptor for ExhaustedListener {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            async move {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(io::Error::from_raw_os_error(24));
                }
                self.inner.accept().await
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    async fn start(opts: ServerOptions) -> (Arc<Server>, SocketAddr, tokio::sync::watch::Sender<bool>) {
        let server = Arc::new(Server::new(ServerOptions {
            bind_addr: "127.0.0.1".into(),
            control_port: 0,
            ..opts
        }));
        let ln = server.bind().await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let s = server.clone();
        tokio::spawn(async move { s.serve(ln, rx).await });
        (server, addr, tx)
    }

    async fn dial(addr: SocketAddr) -> BufConn<TcpStream> {
        conn::buffered(TcpStream::connect(addr).await.unwrap())
    }

    async fn next_non_heartbeat(conn: &mut BufConn<TcpStream>) -> ServerMessage {
        loop {
            let msg = protocol::recv_server(conn).await.unwrap();
            if msg != ServerMessage::Heartbeat {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn control_accept_errors_do_not_stop_the_server() {
        let server = Arc::new(Server::new(ServerOptions {
            bind_addr: "127.0.0.1".into(),
            ..Default::default()
        }));
        let ln = ExhaustedListener::bind(3).await;
        let addr = ln.local_addr().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let s = server.clone();
        let serving = tokio::spawn(async move { s.serve_on(ln, rx).await });

        let mut c = dial(addr).await;
        protocol::send(&mut c, &ClientMessage::Hello(0)).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), protocol::recv_server(&mut c))
            .await
            .expect("server should still answer")
            .unwrap();
        assert!(matches!(reply, ServerMessage::Hello(port) if port != 0));
        assert!(!serving.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_leased_accept_waits_out_the_heartbeat_window() {
        let ln = ExhaustedListener::bind(usize::MAX).await;
        let window = Duration::from_millis(500);

        let started = Instant::now();
        assert!(accept_within(&ln, window).await.is_none());
        assert!(started.elapsed() >= window);
    }

    #[tokio::test]
    async fn rejects_port_below_minimum() {
        let (_s, addr, _tx) = start(ServerOptions::default()).await;
        let mut c = dial(addr).await;

        protocol::send(&mut c, &ClientMessage::Hello(80)).await.unwrap();
        assert_eq!(
            protocol::recv_server(&mut c).await.unwrap(),
            ServerMessage::Error("client port number too low".into())
        );
        assert!(matches!(
            protocol::recv_server(&mut c).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn port_zero_is_chosen_by_the_server_and_released_on_disconnect() {
        let (_s, addr, _tx) = start(ServerOptions {
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let mut c = dial(addr).await;

        protocol::send(&mut c, &ClientMessage::Hello(0)).await.unwrap();
        let ServerMessage::Hello(port) = protocol::recv_server(&mut c).await.unwrap() else {
            panic!("expected hello");
        };
        assert_ne!(port, 0);
        assert_eq!(
            protocol::recv_server(&mut c).await.unwrap(),
            ServerMessage::Heartbeat
        );

        let _user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(matches!(next_non_heartbeat(&mut c).await, ServerMessage::Connection(_)));

        drop(c);
        let released = async {
            loop {
                if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), released)
            .await
            .expect("leased port should be released");
    }

    #[tokio::test]
    async fn reports_port_already_in_use() {
        let (_s, addr, _tx) = start(ServerOptions::default()).await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut c = dial(addr).await;
        protocol::send(&mut c, &ClientMessage::Hello(port)).await.unwrap();
        assert_eq!(
            protocol::recv_server(&mut c).await.unwrap(),
            ServerMessage::Error("port already in use".into())
        );
    }

    #[tokio::test]
    async fn wrong_secret_gets_an_error_before_close() {
        let (_s, addr, _tx) = start(ServerOptions {
            secret: Some("server-secret".into()),
            ..Default::default()
        })
        .await;
        let mut c = dial(addr).await;

        let ServerMessage::Challenge(challenge) = protocol::recv_server(&mut c).await.unwrap() else {
            panic!("expected challenge");
        };
        let tag = Authenticator::new("client-secret").answer(&challenge);
        protocol::send(&mut c, &ClientMessage::Authenticate(tag)).await.unwrap();

        assert_eq!(
            protocol::recv_server(&mut c).await.unwrap(),
            ServerMessage::Error("authentication failed".into())
        );
        assert!(matches!(
            protocol::recv_server(&mut c).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn accept_for_unknown_id_closes_the_connection() {
        let (_s, addr, _tx) = start(ServerOptions::default()).await;
        let mut c = dial(addr).await;

        protocol::send(&mut c, &ClientMessage::Accept(Uuid::new_v4()))
            .await
            .unwrap();
        let mut buf = Vec::new();
        assert_eq!(c.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stray_authenticate_ends_the_session() {
        let (_s, addr, _tx) = start(ServerOptions::default()).await;
        let mut c = dial(addr).await;

        protocol::send(&mut c, &ClientMessage::Authenticate("00".into()))
            .await
            .unwrap();
        let mut buf = Vec::new();
        assert_eq!(c.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unclaimed_user_connection_is_closed_after_timeout() {
        let (server, addr, _tx) = start(ServerOptions {
            pending_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let mut c = dial(addr).await;

        protocol::send(&mut c, &ClientMessage::Hello(0)).await.unwrap();
        let ServerMessage::Hello(port) = next_non_heartbeat(&mut c).await else {
            panic!("expected hello");
        };

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let ServerMessage::Connection(id) = next_non_heartbeat(&mut c).await else {
            panic!("expected connection");
        };
        assert!(server.pending().contains(&id));

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut buf))
            .await
            .expect("user socket should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(!server.pending().contains(&id));
    }

    #[tokio::test]
    async fn accept_pairs_data_connection_with_user_and_flushes_early_bytes() {
        let (server, addr, _tx) = start(ServerOptions {
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let mut control = dial(addr).await;

        protocol::send(&mut control, &ClientMessage::Hello(0)).await.unwrap();
        let ServerMessage::Hello(port) = next_non_heartbeat(&mut control).await else {
            panic!("expected hello");
        };

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let ServerMessage::Connection(id) = next_non_heartbeat(&mut control).await else {
            panic!("expected connection");
        };

        // Accept and the first payload bytes arrive in a single segment.
        let mut data = TcpStream::connect(addr).await.unwrap();
        let mut wire = protocol::encode(&ClientMessage::Accept(id)).unwrap();
        wire.extend_from_slice(b"hello user");
        data.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 10];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello user");
        assert!(!server.pending().contains(&id));

        user.write_all(b"hi client").await.unwrap();
        let mut buf = [0u8; 9];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi client");
    }
}
