//! The handshake and record layer protecting the projection link.
//!
//! The head unit is the tls client. Handshake blobs are tunnelled through
//! control-channel messages by the session, this module only turns blobs
//! into blobs until the exchange completes, then wraps and unwraps message
//! payloads.

use crate::{CryptorError, KeystoreError, cert};
use rustls::pki_types::{CertificateDer, pem::PemObject};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// The server verifier for the projection link. The mobile device is trusted
/// by protocol rather than by name, so certificate acceptance is by assertion
/// while signature checks still run through webpki.
#[derive(Debug)]
struct PeerVerifier {
    /// The object providing the signature verification
    base: Arc<rustls::client::WebPkiServerVerifier>,
}

impl PeerVerifier {
    /// Build a new verifier using the given root certificate store
    fn new(roots: Arc<rustls::RootCertStore>) -> Result<Self, KeystoreError> {
        Ok(Self {
            base: rustls::client::WebPkiServerVerifier::builder(roots)
                .build()
                .map_err(|_| KeystoreError::InvalidRootCert)?,
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.base.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.base.supported_verify_schemes()
    }
}

/// Parse one pem object out of the given bytes
fn pem_from(data: &[u8]) -> Option<(rustls::pki_types::pem::SectionKind, Vec<u8>)> {
    let mut br = Cursor::new(data);
    rustls::pki_types::pem::from_buf(&mut br).ok().flatten()
}

/// The handshake driver and record codec for one session.
pub struct Cryptor {
    /// The tls state machine for the session
    conn: rustls::client::ClientConnection,
}

impl Cryptor {
    /// Construct a new self from the embedded keystore, or from a custom
    /// certificate and private key pair in pem form when one is configured.
    pub fn new(custom_certificate: Option<&(Vec<u8>, Vec<u8>)>) -> Result<Self, KeystoreError> {
        let mut root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let rootder = {
            let pem = pem_from(cert::ROOT_CERT.as_bytes()).ok_or(KeystoreError::InvalidRootCert)?;
            CertificateDer::from_pem(pem.0, pem.1).ok_or(KeystoreError::InvalidRootCert)?
        };

        let pair = if let Some(custom) = custom_certificate {
            custom
        } else {
            &(
                cert::CERTIFICATE.as_bytes().to_vec(),
                cert::PRIVATE_KEY.as_bytes().to_vec(),
            )
        };
        let certificate = {
            let pem = pem_from(&pair.0).ok_or(KeystoreError::InvalidCertificate)?;
            CertificateDer::from_pem(pem.0, pem.1).ok_or(KeystoreError::InvalidCertificate)?
        };
        let key = {
            let pem = pem_from(&pair.1).ok_or(KeystoreError::InvalidPrivateKey)?;
            rustls::pki_types::PrivateKeyDer::from_pem(pem.0, pem.1)
                .ok_or(KeystoreError::InvalidPrivateKey)?
        };

        root_store
            .add(rootder)
            .map_err(|_| KeystoreError::InvalidRootCert)?;
        let root_store = Arc::new(root_store);
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store.clone())
            .with_client_auth_cert(vec![certificate], key)
            .map_err(KeystoreError::Setup)?;
        let verifier = Arc::new(PeerVerifier::new(root_store)?);
        config.dangerous().set_certificate_verifier(verifier);
        let server = "mobile.device"
            .try_into()
            .map_err(|_| KeystoreError::InvalidRootCert)?;
        let conn = rustls::ClientConnection::new(Arc::new(config), server)
            .map_err(KeystoreError::Setup)?;
        Ok(Self { conn })
    }

    /// Is the handshake still in progress?
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Drive the handshake one step. Feeds the peer blob, if any, into the
    /// tls machine and returns the blob to relay back, if one is produced.
    /// The caller checks [Cryptor::is_handshaking] afterwards to learn
    /// whether authentication completed.
    pub fn handshake_step(&mut self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>, CryptorError> {
        if let Some(data) = data {
            if self.conn.wants_read() {
                let mut dc = Cursor::new(data);
                self.conn
                    .read_tls(&mut dc)
                    .map_err(CryptorError::HandshakeIo)?;
                self.conn
                    .process_new_packets()
                    .map_err(CryptorError::HandshakeFailed)?;
            }
        }
        if self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn
                .write_tls(&mut out)
                .map_err(CryptorError::HandshakeIo)?;
            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    /// Wrap a message payload for the wire
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptorError> {
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(CryptorError::RecordIo)?;
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(CryptorError::RecordIo)?;
        }
        Ok(out)
    }

    /// Unwrap a message payload from the wire
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptorError> {
        let mut plain_data = vec![0u8; ciphertext.len()];
        let mut cursor = Cursor::new(ciphertext);
        let mut index = 0;
        loop {
            let consumed = self
                .conn
                .read_tls(&mut cursor)
                .map_err(CryptorError::RecordIo)?;
            self.conn
                .process_new_packets()
                .map_err(CryptorError::DecryptFailed)?;
            if consumed == 0 {
                break;
            }
            if let Ok(l) = self.conn.reader().read(&mut plain_data[index..]) {
                index += l;
            }
        }
        plain_data.truncate(index);
        Ok(plain_data)
    }
}
