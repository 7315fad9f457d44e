//! Authenticated, encrypted byte channel over a raw TCP stream.
//!
//! Handshake:
//! 1. both sides swap ephemeral X25519 public keys
//! 2. HKDF-SHA256 over the shared secret yields one key per direction and a
//!    challenge, salted with both ephemeral keys in sorted order
//! 3. both sides prove ownership of their ed25519 node key by signing the
//!    challenge, sent over the now encrypted channel
//!
//! Data travels in fixed-size sealed frames:
//! [4-byte LE data length][up to 1024 data bytes, zero padded] + 16-byte tag.
//! Each direction uses its own key and a 96-bit counter nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, VerifyingKey, SIGNATURE_LENGTH};
use hkdf::Hkdf;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::network::node_key::NodeKey;

pub const DATA_LEN_SIZE: usize = 4;
pub const DATA_MAX_SIZE: usize = 1024;
pub const TOTAL_FRAME_SIZE: usize = DATA_MAX_SIZE + DATA_LEN_SIZE;
pub const AEAD_TAG_SIZE: usize = 16;
pub const SEALED_FRAME_SIZE: usize = TOTAL_FRAME_SIZE + AEAD_TAG_SIZE;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const AUTH_SIG_MSG_SIZE: usize = KEY_SIZE + SIGNATURE_LENGTH;
const KDF_INFO: &[u8] = b"MCONN_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN";

#[derive(Error, Debug)]
pub enum SecretConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer sent a low-order ephemeral key")]
    LowOrderKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("failed to decrypt frame")]
    Decrypt,
    #[error("failed to encrypt frame")]
    Encrypt,
    #[error("frame declares {0} data bytes (max {max})", max = DATA_MAX_SIZE)]
    FrameTooLarge(usize),
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Per-direction 96-bit nonce; the low 8 bytes after a 4-byte zero prefix
/// hold a little-endian counter.
struct NonceCounter(u64);

impl NonceCounter {
    fn next(&mut self) -> Result<[u8; NONCE_SIZE], SecretConnectionError> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&self.0.to_le_bytes());
        self.0 = self
            .0
            .checked_add(1)
            .ok_or(SecretConnectionError::NonceExhausted)?;
        Ok(nonce)
    }
}

/// Read half of a secret connection.
pub struct SecretReader {
    inner: OwnedReadHalf,
    cipher: Aes256Gcm,
    nonce: NonceCounter,
    /// Plaintext left over from the last frame.
    pending: Vec<u8>,
}

/// Write half of a secret connection.
pub struct SecretWriter {
    inner: OwnedWriteHalf,
    cipher: Aes256Gcm,
    nonce: NonceCounter,
}

pub struct SecretConnection {
    reader: SecretReader,
    writer: SecretWriter,
    remote_pubkey: VerifyingKey,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl SecretConnection {
    /// Performs the key exchange and mutual authentication over `stream`.
    pub async fn make(stream: TcpStream, node_key: &NodeKey) -> Result<Self, SecretConnectionError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let loc_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let loc_eph = PublicKey::from(&loc_secret);

        let mut rem_eph_bytes = [0u8; KEY_SIZE];
        tokio::try_join!(
            write_half.write_all(loc_eph.as_bytes()),
            read_half.read_exact(&mut rem_eph_bytes),
        )?;
        let rem_eph = PublicKey::from(rem_eph_bytes);

        let shared = loc_secret.diffie_hellman(&rem_eph);
        if !shared.was_contributory() {
            return Err(SecretConnectionError::LowOrderKey);
        }

        let loc_is_least = loc_eph.as_bytes() < rem_eph.as_bytes();
        let (lo, hi) = if loc_is_least {
            (loc_eph.as_bytes(), rem_eph.as_bytes())
        } else {
            (rem_eph.as_bytes(), loc_eph.as_bytes())
        };
        let mut salt = [0u8; KEY_SIZE * 2];
        salt[..KEY_SIZE].copy_from_slice(lo);
        salt[KEY_SIZE..].copy_from_slice(hi);

        let mut okm = Zeroizing::new([0u8; KEY_SIZE * 3]);
        Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes())
            .expand(KDF_INFO, &mut okm[..])
            .map_err(|_| SecretConnectionError::KeyDerivation)?;

        let (first, rest) = okm.split_at(KEY_SIZE);
        let (second, challenge) = rest.split_at(KEY_SIZE);
        let (recv_key, send_key) = if loc_is_least {
            (first, second)
        } else {
            (second, first)
        };

        let mut reader = SecretReader {
            inner: read_half,
            cipher: Aes256Gcm::new_from_slice(recv_key)
                .map_err(|_| SecretConnectionError::KeyDerivation)?,
            nonce: NonceCounter(0),
            pending: Vec::new(),
        };
        let mut writer = SecretWriter {
            inner: write_half,
            cipher: Aes256Gcm::new_from_slice(send_key)
                .map_err(|_| SecretConnectionError::KeyDerivation)?,
            nonce: NonceCounter(0),
        };

        let mut auth_msg = [0u8; AUTH_SIG_MSG_SIZE];
        auth_msg[..KEY_SIZE].copy_from_slice(node_key.public_key().as_bytes());
        auth_msg[KEY_SIZE..].copy_from_slice(&node_key.sign(challenge).to_bytes());

        let mut rem_auth = [0u8; AUTH_SIG_MSG_SIZE];
        tokio::try_join!(writer.write_all(&auth_msg), reader.read_exact(&mut rem_auth))?;

        let mut rem_key_bytes = [0u8; KEY_SIZE];
        rem_key_bytes.copy_from_slice(&rem_auth[..KEY_SIZE]);
        let remote_pubkey = VerifyingKey::from_bytes(&rem_key_bytes)
            .map_err(|e| SecretConnectionError::AuthFailed(format!("bad public key: {}", e)))?;
        let mut sig_bytes = [0u8; SIGNATURE_LENGTH];
        sig_bytes.copy_from_slice(&rem_auth[KEY_SIZE..]);
        let signature = Signature::from_bytes(&sig_bytes);
        remote_pubkey
            .verify_strict(challenge, &signature)
            .map_err(|_| SecretConnectionError::AuthFailed("challenge verification failed".into()))?;

        Ok(Self {
            reader,
            writer,
            remote_pubkey,
            local_addr,
            remote_addr,
        })
    }

    pub fn remote_pubkey(&self) -> &VerifyingKey {
        &self.remote_pubkey
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Borrows both halves at once so they can be driven concurrently.
    pub fn halves_mut(&mut self) -> (&mut SecretReader, &mut SecretWriter) {
        (&mut self.reader, &mut self.writer)
    }

    pub fn into_split(self) -> (SecretReader, SecretWriter) {
        (self.reader, self.writer)
    }
}

impl SecretReader {
    /// Reads at most `buf.len()` plaintext bytes; 0 means nothing was requested.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SecretConnectionError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            self.read_frame().await?;
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SecretConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    /// Reads one length-delimited bincode message of at most `max_size` bytes.
    pub async fn read_msg<T: DeserializeOwned>(
        &mut self,
        max_size: usize,
    ) -> Result<T, SecretConnectionError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_size {
            return Err(SecretConnectionError::MessageTooLarge {
                size: len,
                max: max_size,
            });
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(bincode::deserialize(&payload)?)
    }

    async fn read_frame(&mut self) -> Result<(), SecretConnectionError> {
        let mut sealed = [0u8; SEALED_FRAME_SIZE];
        self.inner.read_exact(&mut sealed).await?;
        let nonce = self.nonce.next()?;
        let frame = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(&nonce), &sealed[..])
                .map_err(|_| SecretConnectionError::Decrypt)?,
        );
        let mut len_bytes = [0u8; DATA_LEN_SIZE];
        len_bytes.copy_from_slice(&frame[..DATA_LEN_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > DATA_MAX_SIZE {
            return Err(SecretConnectionError::FrameTooLarge(len));
        }
        self.pending
            .extend_from_slice(&frame[DATA_LEN_SIZE..DATA_LEN_SIZE + len]);
        Ok(())
    }
}

impl SecretWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), SecretConnectionError> {
        for chunk in data.chunks(DATA_MAX_SIZE) {
            let mut frame = Zeroizing::new([0u8; TOTAL_FRAME_SIZE]);
            frame[..DATA_LEN_SIZE].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame[DATA_LEN_SIZE..DATA_LEN_SIZE + chunk.len()].copy_from_slice(chunk);
            let nonce = self.nonce.next()?;
            let sealed = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), &frame[..])
                .map_err(|_| SecretConnectionError::Encrypt)?;
            self.inner.write_all(&sealed).await?;
        }
        Ok(())
    }

    /// Writes one length-delimited bincode message of at most `max_size` bytes.
    pub async fn write_msg<T: Serialize>(
        &mut self,
        msg: &T,
        max_size: usize,
    ) -> Result<(), SecretConnectionError> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > max_size {
            return Err(SecretConnectionError::MessageTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        self.write_all(&buf).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), SecretConnectionError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), SecretConnectionError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_util::tcp_pair;

    #[tokio::test]
    async fn test_handshake_authenticates_both_sides() {
        let (a, b) = tcp_pair().await;
        let key_a = NodeKey::from_bytes(&[1u8; 32]);
        let key_b = NodeKey::from_bytes(&[2u8; 32]);

        let (conn_a, conn_b) = tokio::join!(
            SecretConnection::make(a, &key_a),
            SecretConnection::make(b, &key_b)
        );
        let (conn_a, conn_b) = (conn_a.unwrap(), conn_b.unwrap());

        assert_eq!(conn_a.remote_pubkey(), &key_b.public_key());
        assert_eq!(conn_b.remote_pubkey(), &key_a.public_key());
        assert_eq!(conn_a.remote_addr(), conn_b.local_addr());
    }

    #[tokio::test]
    async fn test_data_spanning_frames() {
        let (a, b) = tcp_pair().await;
        let key_a = NodeKey::from_bytes(&[1u8; 32]);
        let key_b = NodeKey::from_bytes(&[2u8; 32]);
        let (conn_a, conn_b) = tokio::join!(
            SecretConnection::make(a, &key_a),
            SecretConnection::make(b, &key_b)
        );
        let (_, mut writer) = conn_a.unwrap().into_split();
        let (mut reader, _) = conn_b.unwrap().into_split();

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let sent = data.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer
        });

        let mut received = vec![0u8; data.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, data);
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_low_order_key_rejected() {
        let (mut raw, b) = tcp_pair().await;
        let key_b = NodeKey::from_bytes(&[2u8; 32]);

        // The identity point yields an all-zero shared secret.
        raw.write_all(&[0u8; KEY_SIZE]).await.unwrap();
        let err = SecretConnection::make(b, &key_b).await.err().unwrap();
        assert!(matches!(err, SecretConnectionError::LowOrderKey));
    }

    #[tokio::test]
    async fn test_msg_size_limit() {
        let (a, b) = tcp_pair().await;
        let key_a = NodeKey::from_bytes(&[1u8; 32]);
        let key_b = NodeKey::from_bytes(&[2u8; 32]);
        let (conn_a, conn_b) = tokio::join!(
            SecretConnection::make(a, &key_a),
            SecretConnection::make(b, &key_b)
        );
        let (_, mut writer) = conn_a.unwrap().into_split();
        let (mut reader, _) = conn_b.unwrap().into_split();

        let big = vec![7u8; 512];
        assert!(matches!(
            writer.write_msg(&big, 16).await,
            Err(SecretConnectionError::MessageTooLarge { .. })
        ));

        writer.write_msg(&big, 4096).await.unwrap();
        assert!(matches!(
            reader.read_msg::<Vec<u8>>(16).await,
            Err(SecretConnectionError::MessageTooLarge { .. })
        ));
    }
}
