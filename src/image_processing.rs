use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::store::{AttachmentId, AttachmentStore};

pub const RENDITION_MAX_WIDTH: u32 = 500;
pub const RENDITION_MAX_HEIGHT: u32 = 500;
pub const RENDITION_QUALITY: u8 = 85;
const RENDITION_MIME: &str = "image/jpeg";

/// Resizes and re-encodes an image into its cached rendition.
pub trait ImageCodec: Send + Sync {
    /// Writes the rendition of `src` and returns where it was written.
    fn resize_reencode(&self, src: &Path, max_width: u32, max_height: u32, crop: bool, quality: u8)
    -> Result<PathBuf>;
}

/// `<stem>-<w>x<h>.jpg` beside the original.
pub fn rendition_path(original: &Path, max_width: u32, max_height: u32) -> PathBuf {
    let stem = original
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    original.with_file_name(format!("{stem}-{max_width}x{max_height}.jpg"))
}

/// `image`-crate codec producing JPEG renditions.
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegRenditionCodec;

impl ImageCodec for JpegRenditionCodec {
    fn resize_reencode(
        &self,
        src: &Path,
        max_width: u32,
        max_height: u32,
        crop: bool,
        quality: u8,
    ) -> Result<PathBuf> {
        let image = image::open(src).map_err(|err| anyhow!("decode image failed: {err}"))?;
        let resized = fit_within(image, max_width, max_height, crop);
        let dest = rendition_path(src, max_width, max_height);
        // Readers treat an existing rendition as complete, so it only appears once fully written.
        let partial = partial_path(&dest);
        let encoded = File::create(&partial)
            .map_err(anyhow::Error::from)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                DynamicImage::ImageRgb8(resized.to_rgb8())
                    .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
                    .map_err(|err| anyhow!("encode jpeg failed: {err}"))?;
                writer.flush()?;
                Ok(())
            })
            .and_then(|()| std::fs::rename(&partial, &dest).map_err(anyhow::Error::from));
        if let Err(err) = encoded {
            let _ = std::fs::remove_file(&partial);
            return Err(err);
        }
        Ok(dest)
    }
}

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

fn partial_path(dest: &Path) -> PathBuf {
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("rendition");
    dest.with_file_name(format!(".{name}.{}-{seq}.part", std::process::id()))
}

fn fit_within(image: DynamicImage, max_width: u32, max_height: u32, crop: bool) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_width && height <= max_height {
        return image;
    }
    if crop {
        image.resize_to_fill(max_width.min(width), max_height.min(height), FilterType::Lanczos3)
    } else {
        image.resize(max_width, max_height, FilterType::Lanczos3)
    }
}

/// The image bytes chosen for upload to the metadata service.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub is_rendition: bool,
}

/// Picks the capped rendition, creating it when missing, else the original upload.
pub async fn resolve_image(
    attachments: &dyn AttachmentStore,
    codec: Arc<dyn ImageCodec>,
    attachment_id: AttachmentId,
) -> Result<ResolvedImage, GenerationError> {
    let not_found = || GenerationError::ImageNotFound { attachment_id };
    let original = attachments
        .file_path(attachment_id)
        .await
        .map_err(GenerationError::storage)?
        .ok_or_else(not_found)?;
    if !file_exists(&original).await {
        return Err(not_found());
    }

    let cached = rendition_path(&original, RENDITION_MAX_WIDTH, RENDITION_MAX_HEIGHT);
    let rendition = if file_exists(&cached).await {
        Some(cached)
    } else {
        create_rendition(codec, original.clone()).await
    };

    let (path, is_rendition) = match rendition {
        Some(path) => (path, true),
        None => (original, false),
    };
    let bytes = fs::read(&path).await.map_err(|_| not_found())?;
    let mime_type = detect_mime_type(&bytes)
        .or_else(|| mime_from_extension(&path))
        .unwrap_or(RENDITION_MIME)
        .to_string();
    debug!(attachment_id, path = %path.display(), is_rendition, "resolved image");
    Ok(ResolvedImage {
        path,
        bytes,
        mime_type,
        is_rendition,
    })
}

async fn create_rendition(codec: Arc<dyn ImageCodec>, original: PathBuf) -> Option<PathBuf> {
    let source = original.clone();
    let result = tokio::task::spawn_blocking(move || {
        codec.resize_reencode(
            &source,
            RENDITION_MAX_WIDTH,
            RENDITION_MAX_HEIGHT,
            true,
            RENDITION_QUALITY,
        )
    })
    .await;
    match result {
        Ok(Ok(path)) if file_exists(&path).await => Some(path),
        Ok(Ok(path)) => {
            warn!(path = %path.display(), "rendition reported but missing, using original");
            None
        }
        Ok(Err(err)) => {
            warn!(original = %original.display(), "rendition failed, using original: {err}");
            None
        }
        Err(err) => {
            warn!(original = %original.display(), "rendition task failed, using original: {err}");
            None
        }
    }
}

async fn file_exists(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}
