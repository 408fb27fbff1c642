#![allow(dead_code)]
use super::build_mock_response;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// In-process DoQ resolver on 127.0.0.1 with a self-signed `localhost` cert.
pub struct MockDoqServer {
    addr: SocketAddr,
    cert: CertificateDer<'static>,
    endpoint: quinn::Endpoint,
    accepted: Arc<AtomicUsize>,
    wire_ids: Arc<Mutex<Vec<u16>>>,
}

impl MockDoqServer {
    pub async fn start() -> Result<Self, BoxError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)?;
        tls.alpn_protocols = vec![b"doq".to_vec()];
        tls.max_early_data_size = u32::MAX;

        let crypto = QuicServerConfig::try_from(Arc::new(tls))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
        let addr = endpoint.local_addr()?;

        let accepted = Arc::new(AtomicUsize::new(0));
        let wire_ids = Arc::new(Mutex::new(Vec::new()));

        let accept_endpoint = endpoint.clone();
        let accept_count = Arc::clone(&accepted);
        let seen_ids = Arc::clone(&wire_ids);
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                accept_count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(incoming, Arc::clone(&seen_ids)));
            }
        });

        Ok(Self {
            addr,
            cert,
            endpoint,
            accepted,
            wire_ids,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cert(&self) -> CertificateDer<'static> {
        self.cert.clone()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn wire_ids(&self) -> Vec<u16> {
        self.wire_ids.lock().unwrap().clone()
    }
}

impl Drop for MockDoqServer {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"");
    }
}

async fn handle_connection(incoming: quinn::Incoming, wire_ids: Arc<Mutex<Vec<u16>>>) {
    let connection = match incoming.await {
        Ok(c) => c,
        Err(_) => return,
    };

    while let Ok((send, recv)) = connection.accept_bi().await {
        tokio::spawn(handle_stream(send, recv, Arc::clone(&wire_ids)));
    }
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    wire_ids: Arc<Mutex<Vec<u16>>>,
) {
    let mut len_prefix = [0u8; 2];
    if recv.read_exact(&mut len_prefix).await.is_err() {
        return;
    }
    let mut query = vec![0u8; u16::from_be_bytes(len_prefix) as usize];
    if recv.read_exact(&mut query).await.is_err() || query.len() < 12 {
        return;
    }

    wire_ids
        .lock()
        .unwrap()
        .push(u16::from_be_bytes([query[0], query[1]]));

    let response = build_mock_response(&query);
    let _ = send.write_all(&(response.len() as u16).to_be_bytes()).await;
    let _ = send.write_all(&response).await;
    let _ = send.finish();
}
