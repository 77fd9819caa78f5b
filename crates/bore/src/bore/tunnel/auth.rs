//! Challenge/response authentication over the control channel.
//!
//! The shared secret is hashed once into a fixed-size key. The server sends a
//! random challenge, the client answers with `hex(HMAC-SHA256(key, challenge))`.
//! The key itself never crosses the wire.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};
use uuid::Uuid;

use crate::bore::tunnel::protocol::{self, ClientMessage, ProtocolError, ServerMessage};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed")]
    Rejected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Authenticator {
    key: [u8; 32],
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    fn tag(&self, challenge: &Uuid) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts keys of any length");
        mac.update(challenge.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Hex-encoded tag for `challenge`.
    pub fn answer(&self, challenge: &Uuid) -> String {
        hex::encode(self.tag(challenge))
    }

    /// Constant-time check of a hex tag. Malformed hex is simply a mismatch.
    pub fn validate(&self, challenge: &Uuid, tag: &str) -> bool {
        let Ok(got) = hex::decode(tag) else {
            return false;
        };
        self.tag(challenge).as_slice().ct_eq(got.as_slice()).into()
    }

    /// Server side: issue a fresh challenge and require exactly one valid
    /// `Authenticate` in reply. The caller reports failure to the peer.
    pub async fn server_handshake<S>(&self, conn: &mut S) -> Result<(), AuthError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        let challenge = Uuid::new_v4();
        protocol::send(conn, &ServerMessage::Challenge(challenge)).await?;

        match protocol::recv_client(conn).await? {
            ClientMessage::Authenticate(tag) if self.validate(&challenge, &tag) => Ok(()),
            _ => Err(AuthError::Rejected),
        }
    }

    /// Client side: answer a challenge if the server sent one.
    ///
    /// Any other first message is taken to mean the server does not require
    /// authentication; it is consumed and the handshake succeeds.
    pub async fn client_handshake<S>(&self, conn: &mut S) -> Result<(), AuthError>
    where
        S: AsyncBufRead + AsyncWrite + Unpin,
    {
        match protocol::recv_server(conn).await? {
            ServerMessage::Challenge(challenge) => {
                let tag = self.answer(&challenge);
                protocol::send(conn, &ClientMessage::Authenticate(tag)).await?;
            }
            other => {
                tracing::warn!(message = ?other, "auth: server sent no challenge; skipping authentication");
            }
        }
        Ok(())
    }
}
