#![cfg(feature = "client")]
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::crypto::aws_lc_rs as provider;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use ttl_lru::TtlLruCache;

// Loading the system certificate store is not cheap, so completed
// ClientConfigs are cached. The TTL gives us an opportunity to pick up
// system certificate updates within a reasonable time frame.
static CONFIG_CACHE: LazyLock<TtlLruCache<bool, Arc<ClientConfig>>> =
    LazyLock::new(|| TtlLruCache::new(2));
const CONFIG_TTL: Duration = Duration::from_secs(15 * 60);

/// TLS policy knobs for the STARTTLS upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification. Useful when probing hosts that
    /// present self-signed or mismatched certificates; the session is
    /// still encrypted.
    pub insecure: bool,
}

impl TlsOptions {
    pub fn build_tls_connector(&self) -> TlsConnector {
        if let Some(config) = CONFIG_CACHE.get(&self.insecure) {
            return TlsConnector::from(config);
        }

        let provider = Arc::new(provider::default_provider());

        let verifier: Arc<dyn ServerCertVerifier> = if self.insecure {
            Arc::new(danger::NoCertificateVerification::new(provider.clone()))
        } else {
            Arc::new(rustls_platform_verifier::Verifier::new().with_provider(provider.clone()))
        };

        let config = Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
                .expect("inconsistent cipher-suite/versions selected")
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth(),
        );
        CONFIG_CACHE.insert(self.insecure, config.clone(), CONFIG_TTL);

        TlsConnector::from(config)
    }
}

mod danger {
    use std::sync::Arc;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{
        verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::DigitallySignedStruct;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
