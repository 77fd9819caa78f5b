use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch};
use uuid::Uuid;

use crate::bore::{
    net,
    tunnel::{
        CONTROL_PORT,
        auth::Authenticator,
        conn::{self, BufConn},
        protocol::{self, ClientMessage, ProtocolError, ServerMessage},
        relay,
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_host: String,
    pub control_port: u16,
    /// Public port to request; 0 lets the server choose.
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub secret: Option<String>,
    pub local_dial_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            control_port: CONTROL_PORT,
            remote_port: 0,
            local_host: "localhost".into(),
            local_port: 0,
            secret: None,
            local_dial_timeout: Duration::from_secs(3),
        }
    }
}

struct Shared {
    opts: ClientOptions,
    auth: Option<Authenticator>,
    port: watch::Sender<Option<u16>>,
}

pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        opts.server_host = opts.server_host.trim().to_string();
        if opts.server_host.is_empty() {
            anyhow::bail!("client: remote server host is required");
        }
        if opts.local_dial_timeout <= Duration::from_millis(0) {
            opts.local_dial_timeout = Duration::from_secs(3);
        }

        let auth = opts
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Authenticator::new);
        let (port, _rx) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(Shared { opts, auth, port }),
        })
    }

    /// Public port reported by the server, once known.
    pub fn subscribe_port(&self) -> watch::Receiver<Option<u16>> {
        self.shared.port.subscribe()
    }

    /// Opens the control connection and processes server messages until the
    /// server closes it (`Ok`) or reports an error (`Err`).
    pub async fn start(&self) -> anyhow::Result<()> {
        let opts = &self.shared.opts;
        let mut conn = self.shared.handshake().await?;

        protocol::send(&mut conn, &ClientMessage::Hello(opts.remote_port))
            .await
            .context("client: send hello")?;

        loop {
            let msg = match protocol::recv_server(&mut conn).await {
                Ok(msg) => msg,
                Err(ProtocolError::Closed) => {
                    tracing::info!(server = %opts.server_host, "client: control connection closed");
                    return Ok(());
                }
                Err(err) => return Err(err).context("client: read control message"),
            };

            match msg {
                ServerMessage::Hello(port) => {
                    tracing::info!(
                        remote = %net::join_host_port(&opts.server_host, port),
                        local = %net::join_host_port(&opts.local_host, opts.local_port),
                        "client: listening"
                    );
                    self.shared.port.send_replace(Some(port));
                }
                ServerMessage::Heartbeat => {}
                ServerMessage::Connection(id) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = shared.handle_connection(id).await {
                            tracing::warn!(id = %id, err = %format!("{err:#}"), "client: connection failed");
                        }
                    });
                }
                ServerMessage::Error(message) => {
                    tracing::error!(message = %message, "client: server error");
                    anyhow::bail!("server error: {message}");
                }
                other => {
                    tracing::warn!(message = ?other, "client: unexpected message");
                    return Ok(());
                }
            }
        }
    }
}

impl Shared {
    /// Dials the control port and authenticates if a secret is configured.
    async fn handshake(&self) -> anyhow::Result<BufConn<TcpStream>> {
        let addr = net::join_host_port(&self.opts.server_host, self.opts.control_port);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("client: connect to remote server {addr}"))?;
        let mut conn = conn::buffered(stream);

        if let Some(auth) = &self.auth {
            auth.client_handshake(&mut conn)
                .await
                .context("client: authenticate")?;
        }
        Ok(conn)
    }

    /// Claims one user connection on a fresh data connection and relays it to
    /// the local service.
    async fn handle_connection(&self, id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.handshake().await?;
        protocol::send(&mut conn, &ClientMessage::Accept(id))
            .await
            .context("client: send accept")?;

        let addr = net::join_host_port(&self.opts.local_host, self.opts.local_port);
        let mut local = tokio::time::timeout(self.opts.local_dial_timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("client: dial timeout {addr}"))?
            .with_context(|| format!("client: can't connect to local service {addr}"))?;

        let mut data = conn::flush_buffered(conn, &mut local).await?;
        let stats = relay::relay(&mut data, &mut local).await;
        tracing::debug!(
            id = %id,
            to_local = stats.a_to_b,
            from_local = stats.b_to_a,
            "client: relay finished"
        );
        Ok(())
    }
}
