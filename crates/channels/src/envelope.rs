use std::fmt;

use serde::{Deserialize, Serialize, Serializer, ser::SerializeMap};

/// Content kind of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured content submitted to a provider.
///
/// Serializes to `{"text": body}` or `{"<kind>": {"url": ref}, "caption": body}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        caption: String,
    },
}

impl Envelope {
    /// `"text"` or the media kind name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { kind, .. } => kind.as_str(),
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text { text } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("text", text)?;
                map.end()
            },
            Self::Media { kind, url, caption } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(kind.as_str(), &serde_json::json!({ "url": url }))?;
                map.serialize_entry("caption", caption)?;
                map.end()
            },
        }
    }
}

/// Provider acknowledgement of a submitted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
}
