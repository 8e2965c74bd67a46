use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Image is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    Png,
    Jpeg,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
        }
    }

    /// PNG when the bytes or the extension say so, JPEG for everything else.
    pub fn infer(path: &Path, bytes: &[u8]) -> Self {
        let png_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("png"))
            .unwrap_or(false);

        if bytes.starts_with(&PNG_SIGNATURE) || png_extension {
            ImageMime::Png
        } else {
            ImageMime::Jpeg
        }
    }
}

/// A picked image, ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub file_name: String,
    pub mime: ImageMime,
    pub base64: String,
    pub size: u64,
}

impl ImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime.as_str(), self.base64)
    }
}

/// Read an image from disk, refusing anything over `max_bytes` before the
/// content is read.
pub async fn load_image(path: &Path, max_bytes: u64) -> Result<ImagePayload, InputError> {
    let size = tokio::fs::metadata(path).await?.len();
    if size > max_bytes {
        return Err(InputError::TooLarge { size, limit: max_bytes });
    }

    let bytes = tokio::fs::read(path).await?;
    // The file may have grown since the metadata check
    let size = bytes.len() as u64;
    if size > max_bytes {
        return Err(InputError::TooLarge { size, limit: max_bytes });
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mime = ImageMime::infer(path, &bytes);
    log::info!("Loaded image {:?}: {} bytes, {}", path, size, mime.as_str());

    Ok(ImagePayload {
        file_name,
        mime,
        base64: STANDARD.encode(&bytes),
        size,
    })
}
