use std::{io::Cursor, path::Path};

use image::{DynamicImage, ImageFormat};

use super::DownloadError;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

/// Container a client can display without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSignature {
    Jpeg,
    Png,
    Other,
}

impl ImageSignature {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(JPEG_MAGIC) {
            Self::Jpeg
        } else if bytes.starts_with(PNG_MAGIC) {
            Self::Png
        } else {
            Self::Other
        }
    }
}

fn reencode_jpeg(bytes: &[u8]) -> Result<Vec<u8>, DownloadError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| DownloadError::UnsupportedFormat(format!("cannot decode image: {}", e)))?;
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| DownloadError::UnsupportedFormat(format!("cannot encode jpeg: {}", e)))?;
    Ok(out.into_inner())
}

/// Leaves JPEG and PNG files untouched and rewrites anything else as JPEG in place.
/// Returns the extension the file should be published under.
pub async fn normalize(path: &Path) -> Result<&'static str, DownloadError> {
    let bytes = tokio::fs::read(path).await?;
    match ImageSignature::detect(&bytes) {
        ImageSignature::Jpeg => Ok("jpg"),
        ImageSignature::Png => Ok("png"),
        ImageSignature::Other => {
            debug!("Re-encoding {} to jpeg", path.display());
            let jpeg = tokio::task::spawn_blocking(move || reencode_jpeg(&bytes))
                .await
                .map_err(|e| DownloadError::Io(e.to_string()))??;
            tokio::fs::write(path, jpeg).await?;
            Ok("jpg")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test::encode_image as encode;

    #[test]
    fn test_detect() {
        assert_eq!(ImageSignature::detect(&[0xFF, 0xD8, 0xFF, 0xE0]), ImageSignature::Jpeg);
        assert_eq!(ImageSignature::detect(&encode(ImageFormat::Png)), ImageSignature::Png);
        assert_eq!(ImageSignature::detect(b"RIFF....WEBP"), ImageSignature::Other);
    }

    #[tokio::test]
    async fn test_normalize_webp_becomes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.part");
        tokio::fs::write(&path, encode(ImageFormat::WebP)).await.unwrap();

        assert_eq!(normalize(&path).await.unwrap(), "jpg");
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(ImageSignature::detect(&bytes), ImageSignature::Jpeg);
    }

    #[tokio::test]
    async fn test_normalize_keeps_png_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.part");
        let png = encode(ImageFormat::Png);
        tokio::fs::write(&path, &png).await.unwrap();

        assert_eq!(normalize(&path).await.unwrap(), "png");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), png);
    }

    #[tokio::test]
    async fn test_normalize_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.part");
        tokio::fs::write(&path, b"definitely not an image").await.unwrap();
        assert!(matches!(normalize(&path).await, Err(DownloadError::UnsupportedFormat(_))));
    }
}
