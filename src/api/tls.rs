//! TLS transport for the API-SSL service.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::ApiError;

/// TLS settings for an API connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TlsOptions {
    /// Connect to the API-SSL port and wrap the stream in TLS.
    pub enabled: bool,
    /// Accept any server certificate. Routers usually present self-signed
    /// certificates.
    pub skip_verify: bool,
}

/// Builds a client configuration backed by the ring provider.
///
/// # Errors
///
/// Returns [`ApiError::Tls`] when the provider rejects the default protocol
/// versions.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, ApiError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| ApiError::Tls(err.to_string()))?;

    let config = if options.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Performs the TLS handshake over an established TCP stream.
///
/// # Errors
///
/// Returns [`ApiError::Tls`] when `host` is not a valid server name or the
/// handshake fails.
pub async fn handshake(
    stream: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<TcpStream>, ApiError> {
    let config = client_config(options)?;
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|err| ApiError::Tls(format!("invalid server name {host}: {err}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|err| ApiError::Tls(err.to_string()))
}

/// Certificate verifier used when verification is switched off. Handshake
/// signatures are still checked against the presented certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn client_config_builds_for_both_verification_modes(#[case] skip_verify: bool) {
        let options = TlsOptions {
            enabled: true,
            skip_verify,
        };
        let config = client_config(&options).expect("config should build");
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn permissive_verifier_advertises_provider_schemes() {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = AcceptAnyCertificate {
            provider: Arc::clone(&provider),
        };
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
