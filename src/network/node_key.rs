//! Persistent ed25519 node key.
//!
//! Key file format (JSON): `{"priv_key": "<64 hex chars>"}`

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::network::node_info::NodeId;

#[derive(Error, Debug)]
pub enum NodeKeyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed key file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
}

#[derive(Serialize, Deserialize)]
struct NodeKeyFile {
    priv_key: String,
}

/// The long-term identity key of this node.
#[derive(Clone)]
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    pub fn load(path: &Path) -> Result<Self, NodeKeyError> {
        let contents = Zeroizing::new(fs::read_to_string(path)?);
        let file: NodeKeyFile = serde_json::from_str(&contents)?;
        let file_key = Zeroizing::new(file.priv_key);
        let raw = Zeroizing::new(
            hex::decode(file_key.as_str()).map_err(|e| NodeKeyError::InvalidKey(e.to_string()))?,
        );
        let bytes: &[u8; 32] = raw.as_slice().try_into().map_err(|_| {
            NodeKeyError::InvalidKey(format!("expected 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn save(&self, path: &Path) -> Result<(), NodeKeyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = NodeKeyFile {
            priv_key: hex::encode(self.signing_key.to_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_string_pretty(&file)?);
        fs::write(path, json.as_bytes())?;
        Ok(())
    }

    /// Loads the key at `path`, generating and saving a new one if missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, NodeKeyError> {
        if path.exists() {
            return Self::load(path);
        }
        let key = Self::generate();
        key.save(path)?;
        tracing::info!(path = %path.display(), node_id = %key.id(), "Generated new node key");
        Ok(key)
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey").field("id", &self.id()).finish()
    }
}
