use serde::{Deserialize, Serialize};

use crate::constants::{BEARER_SCHEME, Method};

// ---------------------------------------------------------------------------
// Call header
// ---------------------------------------------------------------------------

/// First frame of every connection: which method to run and the caller's
/// credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHeader {
    pub method: Method,
    /// `"Bearer <token>"`; absent for anonymous calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl CallHeader {
    /// Builds a header carrying a bearer token.
    pub fn with_bearer(method: Method, token: &str) -> Self {
        Self {
            method,
            authorization: Some(format!("{BEARER_SCHEME} {token}")),
        }
    }

    /// Extracts the token from a `Bearer` authorization value.
    ///
    /// The scheme is matched case-insensitively. Returns `None` when the
    /// header is missing or uses another scheme.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.authorization.as_deref()?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
            return None;
        }
        let token = token.trim();
        if token.is_empty() { None } else { Some(token) }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Lists transferable files. Carries no fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesRequest {}

/// Requests a file by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub filename: String,
}

/// Opens an upload. Without a filename the server only counts the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Names of regular files available for download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub filenames: Vec<String>,
}

/// Result of a client-streaming upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Total bytes received.
    pub size: u64,
    /// SHA-256 hex digest of the received bytes.
    pub checksum: String,
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// One chunk of a transfer as it appears on the wire.
///
/// `data` is base64-encoded in JSON so arbitrary bytes survive; `sequence` is
/// a plain JSON integer and keeps its full 64-bit range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub sequence: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Custom base64 serde module for byte payloads.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
