//! TLS client configuration for DNS-over-QUIC (RFC 9250 §4.1)
//!
//! - ALPN `doq`
//! - early data enabled so reconnects can use 0-RTT
//! - webpki roots plus any extra trust anchors, or no verification at all
//!   in insecure mode

use doqfwd_domain::DomainError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt;
use std::sync::Arc;

pub const DOQ_ALPN: &[u8] = b"doq";

/// TLS settings of one DoQ upstream.
#[derive(Clone, Default)]
pub struct DoqTlsConfig {
    /// SNI and certificate name. Required unless `insecure_skip_verify` is set.
    pub server_name: Option<String>,

    /// Accept any certificate. Testing only.
    pub insecure_skip_verify: bool,

    /// Trust anchors added on top of the webpki roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for DoqTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoqTlsConfig")
            .field("server_name", &self.server_name)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("extra_roots", &self.extra_roots.len())
            .finish()
    }
}

impl DoqTlsConfig {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            ..Self::default()
        }
    }

    pub fn insecure() -> Self {
        Self {
            insecure_skip_verify: true,
            ..Self::default()
        }
    }

    pub fn with_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.extra_roots.push(cert);
        self
    }

    /// Fails when the config neither names a server nor asks for insecure mode.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.server_name.as_deref() {
            Some(name) => {
                ServerName::try_from(name.to_string()).map_err(|e| {
                    DomainError::ConfigError(format!("Invalid TLS server name '{}': {}", name, e))
                })?;
                Ok(())
            }
            None if self.insecure_skip_verify => Ok(()),
            None => Err(DomainError::ConfigError(
                "DoQ TLS config must set a server name or enable insecure_skip_verify"
                    .to_string(),
            )),
        }
    }

    pub(crate) fn build_client_config(&self) -> Result<ClientConfig, DomainError> {
        self.validate()?;
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut config = if self.insecure_skip_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerification))
                .with_no_client_auth()
        } else {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            for cert in &self.extra_roots {
                root_store.add(cert.clone()).map_err(|e| {
                    DomainError::ConfigError(format!("Invalid trust anchor: {}", e))
                })?;
            }
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        config.alpn_protocols = vec![DOQ_ALPN.to_vec()];
        config.enable_early_data = true;
        Ok(config)
    }
}

struct NoCertVerification;

impl fmt::Debug for NoCertVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
