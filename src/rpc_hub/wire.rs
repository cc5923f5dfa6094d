//! Wire framing (§6) — `{methodName, args}` tuples, MessagePack-encoded.
//!
//! Grounded on `ipc::mod`'s JSON-RPC envelope shape, adapted to the binary
//! MessagePack framing §6 specifies literally ("ordered message-pack-compatible
//! binary framing") instead of JSON-RPC 2.0 text.

use serde::{Deserialize, Serialize};

use crate::error::{OrbitMeshError, Result};

/// One wire message: a method name plus opaque MessagePack-encoded args.
/// `call_id` correlates request/response pairs for client-results calls
/// (§9); `None` for one-way notifications (`heartbeat`, `reportProgress`,
/// dashboard broadcasts piggybacked over the same framing internally never
/// leave the process, so this only covers agent<->server traffic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub method: String,
    pub call_id: Option<String>,
    #[serde(with = "serde_bytes")]
    pub args: Vec<u8>,
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

impl Frame {
    pub fn notification<T: Serialize>(method: &str, args: &T) -> Result<Self> {
        Ok(Self {
            method: method.to_string(),
            call_id: None,
            args: rmp_serde::to_vec(args).map_err(|e| encode_err(method, e))?,
        })
    }

    pub fn request<T: Serialize>(method: &str, call_id: &str, args: &T) -> Result<Self> {
        Ok(Self {
            method: method.to_string(),
            call_id: Some(call_id.to_string()),
            args: rmp_serde::to_vec(args).map_err(|e| encode_err(method, e))?,
        })
    }

    pub fn decode_args<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.args).map_err(|e| OrbitMeshError::TransportFailure {
            agent_id: String::new(),
            reason: format!("decoding args for {}: {e}", self.method),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| encode_err(&self.method, e))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| OrbitMeshError::TransportFailure {
            agent_id: String::new(),
            reason: format!("decoding frame: {e}"),
        })
    }
}

/// §4.12 `acknowledgeJob(jobId, agentId)` wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgeJobArgs {
    pub job_id: String,
    pub agent_id: String,
}

fn encode_err(method: &str, e: rmp_serde::encode::Error) -> OrbitMeshError {
    OrbitMeshError::TransportFailure {
        agent_id: String::new(),
        reason: format!("encoding args for {method}: {e}"),
    }
}
