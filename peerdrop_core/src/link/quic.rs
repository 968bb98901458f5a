//! QUIC peer link.
//!
//! One connection per peer carries `channels_per_peer` bidirectional streams.
//! Each stream opens with a two-byte header (magic, channel index); after
//! that every frame is `[kind u8][len u32 BE][payload]`.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use quinn::{
    ClientConfig, Connection, Endpoint, ReadExactError, RecvStream, SendStream, ServerConfig,
    TransportConfig,
};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ChannelSet, DataChannel};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::protocol::Frame;
use crate::session::SessionHandle;
use crate::transfer::constants::MAX_FRAME_SIZE;
use crate::PeerId;

const ALPN: &[u8] = b"peerdrop";
const STREAM_MAGIC: u8 = 0xD7;
const FRAME_TEXT: u8 = 0;
const FRAME_BINARY: u8 = 1;

/// Install the ring crypto provider (idempotent)
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Generate a self-signed certificate for QUIC
pub fn generate_self_signed_cert()
-> Result<(Vec<CertificateDer<'static>>, PrivatePkcs8KeyDer<'static>)> {
    let certified_key = generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    let cert_der = CertificateDer::from(certified_key.cert.der().to_vec());
    Ok((vec![cert_der], key))
}

fn transport_config() -> Result<TransportConfig> {
    let mut transport_config = TransportConfig::default();
    transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    transport_config.keep_alive_interval(Some(Duration::from_secs(2)));
    transport_config.stream_receive_window((10 * 1024 * 1024u32).into()); // 10 MiB
    transport_config.receive_window((20 * 1024 * 1024u32).into()); // 20 MiB
    transport_config.send_window(20 * 1024 * 1024);
    Ok(transport_config)
}

/// Create a QUIC server endpoint
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    install_crypto_provider();
    let (certs, key) = generate_self_signed_cert()?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    Ok(Endpoint::server(server_config, bind_addr)?)
}

/// Create a QUIC client endpoint (skip certificate verification for P2P)
pub fn make_client_endpoint() -> Result<Endpoint> {
    install_crypto_provider();
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Write one frame to a stream
pub async fn write_frame(stream: &mut SendStream, frame: &Frame) -> Result<()> {
    let (kind, payload): (u8, &[u8]) = match frame {
        Frame::Text(text) => (FRAME_TEXT, text.as_bytes()),
        Frame::Binary(data) => (FRAME_BINARY, data),
    };
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Read one frame; `None` when the peer finished the stream cleanly
pub async fn read_frame(stream: &mut RecvStream) -> Result<Option<Frame>> {
    let mut header = [0u8; 5];
    match stream.read_exact(&mut header).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("Frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    match header[0] {
        FRAME_TEXT => Ok(Some(Frame::Text(String::from_utf8(payload)?))),
        FRAME_BINARY => Ok(Some(Frame::Binary(Bytes::from(payload)))),
        other => Err(anyhow!("Unknown frame kind {}", other)),
    }
}

/// Send half of one QUIC stream as a [`DataChannel`]
pub struct QuicChannel {
    stream: Mutex<SendStream>,
    open: AtomicBool,
}

impl QuicChannel {
    pub fn new(stream: SendStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl DataChannel for QuicChannel {
    async fn send(&self, frame: Frame) -> crate::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransferError::ChannelClosed);
        }
        let mut stream = self.stream.lock().await;
        write_frame(&mut stream, &frame).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            TransferError::transport(e.to_string())
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut stream) = self.stream.try_lock() {
            let _ = stream.finish();
        }
    }
}

/// Dial `addr` and link the connection into `session`. Returns the peer id.
pub async fn connect_peer(
    endpoint: &Endpoint,
    addr: SocketAddr,
    session: &SessionHandle,
    config: &TransferConfig,
) -> Result<PeerId> {
    let connection = endpoint.connect(addr, "localhost")?.await?;
    let peer_id = connection.remote_address().to_string();

    let mut streams = Vec::with_capacity(config.channels_per_peer);
    for index in 0..config.channels_per_peer {
        let (mut send, recv) = connection.open_bi().await?;
        // The header makes the stream visible to the peer right away
        send.write_all(&[STREAM_MAGIC, index as u8]).await?;
        streams.push((send, recv));
    }

    attach(connection, peer_id.clone(), streams, session, config.control_channel).await?;
    Ok(peer_id)
}

/// Accept incoming connections forever, linking each into `session`
pub async fn accept_peers(endpoint: Endpoint, session: SessionHandle, config: TransferConfig) {
    while let Some(incoming) = endpoint.accept().await {
        let session = session.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Incoming connection failed: {}", e);
                    return;
                }
            };
            let peer_id = connection.remote_address().to_string();
            if let Err(e) = accept_streams(connection.clone(), &peer_id, &session, &config).await {
                warn!("Linking {} failed: {}", peer_id, e);
                connection.close(1u32.into(), b"link setup failed");
            }
        });
    }
}

async fn accept_streams(
    connection: Connection,
    peer_id: &str,
    session: &SessionHandle,
    config: &TransferConfig,
) -> Result<()> {
    let width = config.channels_per_peer;
    let mut slots: Vec<Option<(SendStream, RecvStream)>> = (0..width).map(|_| None).collect();

    for _ in 0..width {
        let (send, mut recv) = connection.accept_bi().await?;
        let mut header = [0u8; 2];
        recv.read_exact(&mut header).await?;
        if header[0] != STREAM_MAGIC {
            bail!("Bad stream header from {}", peer_id);
        }
        let index = header[1] as usize;
        let Some(slot) = slots.get_mut(index) else {
            bail!("Channel index {} out of range from {}", index, peer_id);
        };
        if slot.is_some() {
            bail!("Channel {} opened twice by {}", index, peer_id);
        }
        *slot = Some((send, recv));
    }

    let streams = slots.into_iter().flatten().collect();
    attach(connection, peer_id.to_string(), streams, session, config.control_channel).await
}

/// Register the channel set and spawn one reader per stream plus a watcher
/// that reports the peer gone when the connection closes.
async fn attach(
    connection: Connection,
    peer_id: PeerId,
    streams: Vec<(SendStream, RecvStream)>,
    session: &SessionHandle,
    control: usize,
) -> Result<()> {
    let mut channels: Vec<Arc<dyn DataChannel>> = Vec::with_capacity(streams.len());
    let mut readers = Vec::with_capacity(streams.len());
    for (send, recv) in streams {
        channels.push(Arc::new(QuicChannel::new(send)));
        readers.push(recv);
    }
    let width = channels.len();
    session
        .peer_link(peer_id.clone(), ChannelSet::new(channels, control)?)
        .await?;
    info!("QUIC link to {} up ({} channels)", peer_id, width);

    for (index, mut recv) in readers.into_iter().enumerate() {
        let session = session.clone();
        let peer_id = peer_id.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut recv).await {
                    Ok(Some(frame)) => {
                        if session.deliver(peer_id.clone(), index, frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Channel {} of {} failed: {}", index, peer_id, e);
                        break;
                    }
                }
            }
            // Losing any channel loses the link
            connection.close(0u32.into(), b"channel closed");
        });
    }

    let session = session.clone();
    tokio::spawn(async move {
        let reason = connection.closed().await;
        info!("QUIC link to {} closed: {}", peer_id, reason);
        let _ = session.peer_gone(peer_id).await;
    });
    Ok(())
}

/// Custom certificate verifier that skips verification (for self-signed certs in P2P)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
