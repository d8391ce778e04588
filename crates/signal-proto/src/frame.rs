use serde::{Deserialize, Serialize};

/// Raw payload bytes carried by one `file-chunk` frame.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Description of a file announced by `file-start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

/// Messages exchanged over an open data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    FileStart { metadata: FileMetadata },
    /// `data` is base64 of at most [`CHUNK_SIZE`] raw bytes.
    FileChunk { data: String, sequence: u32 },
    FileEnd { name: String },
    Text { text: String },
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text { text: text.into() }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns `None` for anything that is not a recognised frame, including
    /// plain text and JSON objects with an unknown `type`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Number of chunks a payload of `size` bytes is split into.
pub fn expected_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}
