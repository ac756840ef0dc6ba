//! Interposes a TLS engine between the plaintext filter chain and the socket.
//!
//! Installed only when a service is configured as secured (§4.5). Built around
//! `read_tls`/`read_plaintext`/`event_set`, keyed off `rustls::IoState`, as an
//! arbitrary byte sink rather than a single HTTP-shaped reader: inbound
//! ciphertext is fed to the engine and the plaintext it produces is handed to
//! the session's filter chain; outbound plaintext is intercepted before it
//! reaches the write queue and replaced with ciphertext.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use log::debug;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::buffer::CompositeBuf;

/// Either side of a TLS connection, behind one interface so the selector
/// loop does not need to know which.
///
/// `ServerConnection` and `ClientConnection` share no common trait for
/// `read_tls`/`write_tls`/`process_new_packets`/`reader`/`writer` — each
/// derefs to its own `ConnectionCommon<XxxConnectionData>` — so every
/// operation below matches on the variant rather than reaching for a single
/// dynamically-dispatched handle.
enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

/// Runs `$op` against whichever rustls connection `$self` wraps, binding it
/// to `$conn` in each arm.
macro_rules! with_conn {
    ($self:expr, |$conn:ident| $op:expr) => {
        match &mut $self.engine {
            Engine::Server($conn) => $op,
            Engine::Client($conn) => $op,
        }
    };
}

/// Drives a `rustls` engine for one session.
pub struct TlsHelper {
    engine: Engine,
}

impl TlsHelper {
    /// Begins a server-side handshake using `config`.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(TlsHelper {
            engine: Engine::Server(ServerConnection::new(config)?),
        })
    }

    /// Begins a client-side handshake to `server_name` using `config`.
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<Self, rustls::Error> {
        Ok(TlsHelper {
            engine: Engine::Client(ClientConnection::new(config, server_name)?),
        })
    }

    /// True once the handshake has completed and application data may flow.
    pub fn handshake_complete(&self) -> bool {
        match &self.engine {
            Engine::Server(c) => !c.is_handshaking(),
            Engine::Client(c) => !c.is_handshaking(),
        }
    }

    /// Whether the engine currently wants to read or write on the socket,
    /// for computing this session's registration interest.
    pub fn wants(&self) -> (bool, bool) {
        match &self.engine {
            Engine::Server(c) => (c.wants_read(), c.wants_write()),
            Engine::Client(c) => (c.wants_read(), c.wants_write()),
        }
    }

    /// Reads ciphertext off `socket` into the engine, processes any complete
    /// TLS records, and returns the plaintext produced (if any).
    ///
    /// Returns `Ok(None)` when the peer has closed the connection cleanly.
    pub fn read_ciphertext<S: Read>(&mut self, socket: &mut S) -> io::Result<Option<Vec<u8>>> {
        let read = loop {
            let outcome = with_conn!(self, |c| c.read_tls(socket));
            match outcome {
                Ok(0) => break 0,
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break usize::MAX,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if read == 0 {
            return Ok(None);
        }
        if read == usize::MAX {
            // WouldBlock with nothing new read this call; still attempt to
            // drain any plaintext the engine already produced.
        }

        with_conn!(self, |c| c.process_new_packets())
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;

        let mut plaintext = Vec::new();
        loop {
            let mut chunk = [0u8; 4096];
            let outcome = with_conn!(self, |c| c.reader().read(&mut chunk));
            match outcome {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Some(plaintext))
    }

    /// Encrypts `plaintext` and returns the ciphertext ready to enqueue on
    /// the session's write queue in place of the original payload.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> io::Result<CompositeBuf> {
        with_conn!(self, |c| c.writer().write_all(plaintext))?;
        let mut out = Vec::new();
        while with_conn!(self, |c| c.wants_write()) {
            let mut chunk = Vec::new();
            with_conn!(self, |c| c.write_tls(&mut chunk))?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(CompositeBuf::from_bytes(out.into()))
    }

    /// Drives the handshake by writing any pending outbound TLS records to
    /// `socket` directly (used for the initial handshake flight and any
    /// renegotiation, before the session's ordinary write queue exists to
    /// carry them).
    pub fn drive_handshake<S: Write>(&mut self, socket: &mut S) -> io::Result<usize> {
        let mut total = 0;
        while with_conn!(self, |c| c.wants_write()) {
            let outcome = with_conn!(self, |c| c.write_tls(socket));
            match outcome {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        debug!(target: "tls", "drove {total} bytes of handshake output");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CERT_PEM: &[u8] = include_bytes!("../tests/fixtures/test-cert.pem");
    const TEST_KEY_PEM: &[u8] = include_bytes!("../tests/fixtures/test-key.pem");

    /// Loads the fixed self-signed cert/key checked in under
    /// `tests/fixtures/` so handshake tests don't need a live CA; this crate
    /// does not implement cryptography itself (§1 non-goals), only drives
    /// the engine.
    fn test_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let cert_der = rustls_pemfile::certs(&mut &TEST_CERT_PEM[..])
            .next()
            .expect("fixture cert")
            .expect("valid cert PEM");
        let key_der = rustls_pemfile::pkcs8_private_keys(&mut &TEST_KEY_PEM[..])
            .next()
            .expect("fixture key")
            .expect("valid key PEM");

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert_der.clone()],
                rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
            )
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (Arc::new(server_config), Arc::new(client_config))
    }

    #[test]
    fn fresh_engines_are_mid_handshake() {
        let (server_cfg, client_cfg) = test_configs();
        let server = TlsHelper::server(server_cfg).unwrap();
        let client = TlsHelper::client(
            client_cfg,
            rustls::pki_types::ServerName::try_from("localhost").unwrap(),
        )
        .unwrap();
        assert!(!server.handshake_complete());
        assert!(!client.handshake_complete());
    }
}
