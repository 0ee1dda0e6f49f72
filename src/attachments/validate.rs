//! MIME and size checks for attachments.

use crate::config::ImageSettings;
use crate::platforms::{AttachmentBytes, AttachmentMeta};

use super::OmitReason;

const OCTET_STREAM: &str = "application/octet-stream";

/// Lower-case a MIME type and drop any parameters (`; charset=...`).
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// Detect common image formats from their magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn is_generic(mime: &str) -> bool {
    mime.is_empty() || mime == OCTET_STREAM
}

/// Reject on probe metadata before downloading. Unknown values pass.
pub fn check_probe(meta: &AttachmentMeta, settings: &ImageSettings) -> Result<(), OmitReason> {
    if let Some(size) = meta.size {
        if !settings.size_allowed(size) {
            return Err(OmitReason::TooLarge);
        }
    }
    if let Some(mime) = meta.mime_type.as_deref().map(normalize_mime) {
        // Generic types are decided after download, from the content.
        if !is_generic(&mime) && !settings.mime_allowed(&mime) {
            return Err(OmitReason::MimeNotAllowed);
        }
    }
    Ok(())
}

/// Validate downloaded content and return the effective MIME type.
pub fn check_download(content: &AttachmentBytes, settings: &ImageSettings) -> Result<String, OmitReason> {
    if content.bytes.is_empty() {
        return Err(OmitReason::Empty);
    }
    if !settings.size_allowed(content.size()) {
        return Err(OmitReason::TooLarge);
    }

    let declared = normalize_mime(&content.mime_type);
    let mime = if is_generic(&declared) {
        sniff_mime(&content.bytes)
            .map(str::to_string)
            .unwrap_or_else(|| OCTET_STREAM.to_string())
    } else {
        declared
    };
    if !settings.mime_allowed(&mime) {
        return Err(OmitReason::MimeNotAllowed);
    }
    Ok(mime)
}
