//! Self-describing image payloads (`data:<mime>;base64,<payload>`).

use crate::frame::FrameError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

const BASE64_MARKER: &str = ";base64,";

/// A compressed still image embedded as a data URI, ready for redisplay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{mime}{BASE64_MARKER}{}", STANDARD.encode(bytes)))
    }

    /// MIME type declared in the URI header, e.g. `image/jpeg`.
    pub fn mime(&self) -> &str {
        self.0
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(BASE64_MARKER))
            .map(|(mime, _)| mime)
            .unwrap_or("")
    }

    /// Base64 payload without the header.
    pub fn payload(&self) -> &str {
        self.0
            .split_once(BASE64_MARKER)
            .map(|(_, payload)| payload)
            .unwrap_or("")
    }

    /// True when the URI carries no image bytes.
    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    /// Length of the whole URI in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, FrameError> {
        STANDARD
            .decode(self.payload())
            .map_err(|e| FrameError::MalformedDataUri(format!("base64: {e}")))
    }
}
