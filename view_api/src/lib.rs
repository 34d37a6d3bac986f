//! Wire types shared between the view server and its clients.

mod code;

pub use code::{normalize, CodeError, RoomCode};

use serde::{Deserialize, Serialize};

/// Longest image data URI accepted by the server, in characters.
pub const MAX_IMAGE_CHARS: usize = 2_500_000;

/// Prefix every accepted image data URI must start with.
pub const IMAGE_PREFIX: &str = "data:image/";

/// Latest image and write time recorded for a room.
///
/// Both fields are `null` on the wire until the room is written for the first time.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub image: Option<String>,
    /// Milliseconds since the Unix epoch, stamped by the server.
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// A recently written room as listed by `GET /api/view`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRoom {
    pub code: RoomCode,
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RoomsResponse {
    pub rooms: Vec<ActiveRoom>,
}

/// Body of `POST /api/view/{code}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub image: String,
}

/// Reasons an uploaded image is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("Image required")]
    Missing,
    #[error("Unsupported image type")]
    UnsupportedType,
    #[error("Image too large")]
    TooLarge,
}

/// Check an image data URI against the upload rules, in the order the server applies them.
pub fn validate_image(image: &str) -> Result<(), ImageError> {
    if image.is_empty() {
        return Err(ImageError::Missing);
    }
    if !image.starts_with(IMAGE_PREFIX) {
        return Err(ImageError::UnsupportedType);
    }
    if image.len() > MAX_IMAGE_CHARS && image.chars().count() > MAX_IMAGE_CHARS {
        return Err(ImageError::TooLarge);
    }
    Ok(())
}
