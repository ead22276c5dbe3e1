use serde::{Deserialize, Serialize};

use crate::ids::AttemptId;

/* --------- Rutas HTTP del servicio de nodo --------- */

pub const HEALTH: &str = "/health";
pub const JOBS: &str = "/api/v1/jobs";
pub const JOB: &str = "/api/v1/jobs/:id";
pub const ATTEMPT_STATUSES: &str = "/api/v1/attempts/status";
pub const NODE_STATUS: &str = "/api/v1/nodes/status";
pub const NODE_ID: &str = "/api/v1/node/id";
pub const NODE_STOP: &str = "/api/v1/node/stop";
pub const EXECUTE: &str = "/api/v1/executor/execute";
pub const CANCEL: &str = "/api/v1/executor/cancel";
pub const DELETE: &str = "/api/v1/executor/delete";
pub const THROTTLE: &str = "/api/v1/executor/throttle";
pub const FS: &str = "/api/v1/fs";
pub const FS_MKDIR: &str = "/api/v1/fs/mkdir";
pub const FS_EXISTS: &str = "/api/v1/fs/exists";

/// Paquete del job y entrada, tal cual. Viajan en base64 dentro del JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(with = "base64_bytes")]
    pub jar: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub input: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub attempt: AttemptId,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub attempt: AttemptId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRequest {
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}
