//! Wire types exchanged with the local agent and its token sink.
//!
//! The agent advertises its file sinks over HTTP, reads the public key we
//! publish for a Diffie-Hellman exchange, and writes tokens (optionally
//! encrypted) into the sink file.

use serde::{Deserialize, Serialize};

/// The only key agreement curve the agent and client share.
pub const DH_TYPE_CURVE25519: &str = "curve25519";

/// Agent endpoint listing its file sinks.
pub const AGENT_PATH_FILE_SINKS: &str = "/agent/v1/file-sinks";

/// Query parameter selecting one sink by name.
pub const AGENT_SINK_NAME_PARAM: &str = "sinkName";

/// A file sink as advertised by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSink {
    /// Path of the file the agent writes tokens into.
    #[serde(default)]
    pub token_file_path: String,
    /// Key agreement curve, empty for a plaintext sink.
    #[serde(default)]
    pub dh_type: String,
    /// Where the agent expects our public key, empty for a plaintext sink.
    #[serde(default)]
    pub dh_path: String,
}

impl AgentSink {
    /// Whether the agent wants a key exchange before writing tokens.
    #[must_use]
    pub fn requires_exchange(&self) -> bool {
        !self.dh_path.is_empty()
    }
}

/// Our half of the exchange, written to the agent's `dh_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    /// Raw curve25519 public key.
    #[serde(with = "base64_bytes")]
    pub curve25519_public_key: Vec<u8>,
}

/// An encrypted token as written by the agent into the sink file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkEnvelope {
    /// The agent's curve25519 public key.
    #[serde(with = "base64_bytes")]
    pub curve25519_public_key: Vec<u8>,
    /// AES-GCM ciphertext including the tag.
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    /// AES-GCM nonce.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

impl SinkEnvelope {
    /// Parse sink file contents as an envelope.
    ///
    /// Returns `None` when the contents are not the envelope shape, which is
    /// how a plaintext sink is told apart from an encrypted one.
    #[must_use]
    pub fn parse(contents: &str) -> Option<Self> {
        serde_json::from_str(contents.trim()).ok()
    }
}

/// Standard base64 for byte fields, matching how the agent encodes them.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
