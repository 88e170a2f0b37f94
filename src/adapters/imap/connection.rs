use async_imap::Session;
use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::types::error::SyncError;

// An IMAP session is generic over the stream type; ours is TLS over TCP
// wrapped in the tokio compat layer.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct ImapConnection {
    pub session: ImapSession,
    pub host: String,
}

impl ImapConnection {
    pub async fn logout(mut self) -> Result<(), SyncError> {
        debug!(host = %self.host, "Logging out");
        self.session
            .logout()
            .await
            .map_err(|e| SyncError::Network(format!("LOGOUT failed: {}", e)))
    }
}

pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> Result<ImapConnection, SyncError> {
    info!(host = %host, port = port, "Connecting to IMAP server");

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| SyncError::Network(format!("TCP connection failed: {}", e)))?;

    let tcp = tcp.compat();
    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls
        .connect(host, tcp)
        .await
        .map_err(|e| SyncError::Network(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    info!(user = %username, "Logging in");
    let session = client
        .login(username, password)
        .await
        .map_err(|(e, _)| SyncError::Auth(format!("Login failed: {}", e)))?;

    Ok(ImapConnection {
        session,
        host: host.to_string(),
    })
}
