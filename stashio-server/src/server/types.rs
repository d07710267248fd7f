use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

/// Reply to a chunk upload: total bytes received on the stream.
#[derive(Debug, Serialize)]
pub(crate) struct SendStatusResponse {
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct KeyInfoResponse {
    pub size: u32,
    pub hashes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkQuery {
    pub decompress: Option<bool>,
}
