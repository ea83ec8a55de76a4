//! `data:` URLs for image uploads.

use std::io;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};

/// Mime type inferred from a file extension, defaulting to PNG.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

pub fn encode(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", general_purpose::STANDARD.encode(bytes))
}

/// Reads an image file and returns it as a data URL.
pub fn from_file(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(encode(&bytes, mime_for_path(path)))
}

/// Decodes the payload of a base64 data URL.
pub fn decode(data_url: &str) -> Option<Vec<u8>> {
    let (header, payload) = data_url.strip_prefix("data:")?.split_once(',')?;
    if !header.ends_with(";base64") {
        return None;
    }
    general_purpose::STANDARD.decode(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_png() {
        assert_eq!(encode(b"hi", "image/png"), "data:image/png;base64,aGk=");
    }

    #[test]
    fn test_decode_rejects_plain_payloads() {
        assert_eq!(decode("data:image/png;base64,aGk="), Some(b"hi".to_vec()));
        assert_eq!(decode("data:text/plain,hi"), None);
        assert_eq!(decode("aGk="), None);
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_for_path(Path::new("shot.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("button")), "image/png");
    }
}
