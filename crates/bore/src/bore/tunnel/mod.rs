//! Reverse TCP tunnel.
//!
//! A client behind NAT keeps one control connection to the server. For every
//! public user that connects to the client's leased port, the server sends a
//! `Connection` id; the client opens a fresh connection, claims the id with
//! `Accept`, and both sides fall back to relaying raw bytes.

pub mod auth;
pub mod client;
pub mod conn;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod server;

/// Well-known control port, used for control and data connections alike.
pub const CONTROL_PORT: u16 = 7835;

/// Serves tunnels until `shutdown` flips; fails only if the control port
/// cannot be bound or accepted on.
pub async fn run_server(
    server: &server::Server,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    server.listen_and_serve(shutdown).await
}

/// Runs one tunnel lease; returns when the control connection ends or
/// `shutdown` flips.
pub async fn run_client(
    client: &client::Client,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tokio::select! {
        res = client.start() => res,
        _ = shutdown.wait_for(|stop| *stop) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
    };

    struct Harness {
        control: SocketAddr,
        _shutdown: tokio::sync::watch::Sender<bool>,
    }

    async fn start_server(secret: Option<&str>) -> Harness {
        let server = Arc::new(Server::new(ServerOptions {
            bind_addr: "127.0.0.1".into(),
            control_port: 0,
            min_port: 1023,
            secret: secret.map(str::to_string),
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        }));
        let ln = server.bind().await.unwrap();
        let control = ln.local_addr().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        Harness {
            control,
            _shutdown: tx,
        }
    }

    /// Local service that echoes everything back.
    async fn echo_service() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    fn client_for(h: &Harness, local_port: u16, secret: Option<&str>) -> Arc<Client> {
        Arc::new(
            Client::new(ClientOptions {
                server_host: "127.0.0.1".into(),
                control_port: h.control.port(),
                remote_port: 0,
                local_host: "127.0.0.1".into(),
                local_port,
                secret: secret.map(str::to_string),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn leased_port(client: &Arc<Client>) -> u16 {
        let mut rx = client.subscribe_port();
        let c = client.clone();
        tokio::spawn(async move { c.start().await });
        let port = *tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_some))
            .await
            .expect("server hello")
            .unwrap();
        port.expect("bound port")
    }

    #[tokio::test]
    async fn end_to_end_relays_bytes_both_ways() {
        let h = start_server(None).await;
        let local = echo_service().await;
        let client = client_for(&h, local, None);
        let port = leased_port(&client).await;
        assert_ne!(port, 0);

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        user.write_all(b"hello through the tunnel").await.unwrap();
        let mut buf = [0u8; 24];
        tokio::time::timeout(Duration::from_secs(5), user.read_exact(&mut buf))
            .await
            .expect("echo")
            .unwrap();
        assert_eq!(&buf, b"hello through the tunnel");

        // Larger payload, in order.
        let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 253) as u8).collect();
        let (mut r, mut w) = user.into_split();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            w.write_all(&payload).await.unwrap();
            w
        });
        let mut got = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(10), r.read_exact(&mut got))
            .await
            .expect("large echo")
            .unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn end_to_end_serves_several_users_concurrently() {
        let h = start_server(Some("shared")).await;
        let local = echo_service().await;
        let client = client_for(&h, local, Some("shared"));
        let port = leased_port(&client).await;

        let mut users = Vec::new();
        for i in 0..5u8 {
            users.push(tokio::spawn(async move {
                let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let msg = [i; 32];
                s.write_all(&msg).await.unwrap();
                let mut buf = [0u8; 32];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, msg);
            }));
        }
        for u in users {
            tokio::time::timeout(Duration::from_secs(5), u)
                .await
                .expect("user finished")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn local_service_that_speaks_first_reaches_the_user() {
        let h = start_server(None).await;
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            s.write_all(b"220 ready\r\n").await.unwrap();
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
        });

        let client = client_for(&h, local, None);
        let port = leased_port(&client).await;

        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 11];
        tokio::time::timeout(Duration::from_secs(5), user.read_exact(&mut buf))
            .await
            .expect("greeting")
            .unwrap();
        assert_eq!(&buf, b"220 ready\r\n");
    }

    #[tokio::test]
    async fn mismatched_secret_never_establishes_a_tunnel() {
        let h = start_server(Some("server")).await;
        let client = client_for(&h, 1, Some("client"));
        let rx = client.subscribe_port();

        let res = tokio::time::timeout(Duration::from_secs(5), client.start())
            .await
            .expect("client should stop");
        assert!(res.is_err());
        assert_eq!(*rx.borrow(), None);
    }

    #[tokio::test]
    async fn run_client_returns_on_shutdown() {
        let h = start_server(None).await;
        let client = client_for(&h, 1, None);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let c = client.clone();
        let task = tokio::spawn(async move { super::run_client(&c, rx).await });
        let mut port_rx = client.subscribe_port();
        tokio::time::timeout(Duration::from_secs(5), port_rx.wait_for(Option::is_some))
            .await
            .expect("server hello")
            .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("client stopped")
            .unwrap()
            .unwrap();
    }
}
