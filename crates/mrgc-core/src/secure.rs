//! Secure-compute boundary.
//!
//! Encryption and decryption happen inside an attested enclave owned by the
//! worker. The control plane only ever passes opaque handles across this
//! boundary, so none of these types expose their bytes through `Debug`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Reference to a key held by the key-management service.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyRef").field(&self.0).finish()
    }
}

/// Encrypted payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(Vec<u8>);

impl Ciphertext {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext({} bytes)", self.0.len())
    }
}

/// Attestation document produced by the enclave.
#[derive(Clone, PartialEq, Eq)]
pub struct Attestation(Vec<u8>);

impl Attestation {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attestation({} bytes)", self.0.len())
    }
}

#[derive(Debug, Error)]
pub enum SecureComputeError {
    #[error("attestation rejected: {0}")]
    AttestationRejected(String),

    #[error("key {0} not available")]
    KeyUnavailable(String),

    #[error("secure compute unavailable: {0}")]
    Unavailable(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The opaque encrypt/decrypt service.
///
/// Implemented and called by the worker's inference runtime, which owns the
/// enclave. The control plane itself only handles the boundary types.
pub trait SecureCompute: Send + Sync {
    fn encrypt<'a>(
        &'a self,
        plaintext: &'a [u8],
        key: &'a KeyRef,
    ) -> BoxFuture<'a, Result<Ciphertext, SecureComputeError>>;

    fn decrypt<'a>(
        &'a self,
        ciphertext: &'a Ciphertext,
        key: &'a KeyRef,
        attestation: &'a Attestation,
    ) -> BoxFuture<'a, Result<Vec<u8>, SecureComputeError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// XOR "enclave" that only accepts one attestation document.
    struct FakeEnclave {
        accepted: Attestation,
    }

    impl SecureCompute for FakeEnclave {
        fn encrypt<'a>(
            &'a self,
            plaintext: &'a [u8],
            key: &'a KeyRef,
        ) -> BoxFuture<'a, Result<Ciphertext, SecureComputeError>> {
            Box::pin(async move {
                let k = key.as_str().len() as u8;
                Ok(Ciphertext::from_bytes(plaintext.iter().map(|b| b ^ k).collect()))
            })
        }

        fn decrypt<'a>(
            &'a self,
            ciphertext: &'a Ciphertext,
            key: &'a KeyRef,
            attestation: &'a Attestation,
        ) -> BoxFuture<'a, Result<Vec<u8>, SecureComputeError>> {
            Box::pin(async move {
                if attestation != &self.accepted {
                    return Err(SecureComputeError::AttestationRejected(
                        "unknown measurement".into(),
                    ));
                }
                let k = key.as_str().len() as u8;
                Ok(ciphertext.as_bytes().iter().map(|b| b ^ k).collect())
            })
        }
    }

    #[test]
    fn debug_never_prints_payload_bytes() {
        let ct = Ciphertext::from_bytes(vec![1, 2, 3]);
        assert_eq!(format!("{ct:?}"), "Ciphertext(3 bytes)");
        let att = Attestation::from_bytes(vec![9; 16]);
        assert_eq!(format!("{att:?}"), "Attestation(16 bytes)");
    }

    #[tokio::test]
    async fn boundary_is_usable_through_trait_object() {
        let enclave: Box<dyn SecureCompute> = Box::new(FakeEnclave {
            accepted: Attestation::from_bytes(b"pcr0".to_vec()),
        });
        let key = KeyRef::new("alias/inference");

        let ct = enclave.encrypt(b"prompt", &key).await.unwrap();
        assert_ne!(ct.as_bytes(), b"prompt");

        let good = Attestation::from_bytes(b"pcr0".to_vec());
        let pt = enclave.decrypt(&ct, &key, &good).await.unwrap();
        assert_eq!(pt, b"prompt");

        let bad = Attestation::from_bytes(b"other".to_vec());
        let err = enclave.decrypt(&ct, &key, &bad).await.unwrap_err();
        assert!(matches!(err, SecureComputeError::AttestationRejected(_)));
    }
}
