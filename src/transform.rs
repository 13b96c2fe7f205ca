//! Grayscale conversion of a reassembled upload

use image::{ImageFormat, ImageReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from the image transform stage
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("not a decodable image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("could not encode processed image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transform cancelled after deadline")]
    Cancelled,

    #[error("transform task failed: {0}")]
    Join(String),
}

/// Output format for a given input format.
///
/// Formats whose encoders take 8-bit luma keep their format; anything else
/// is written as PNG.
pub fn output_format(input: Option<ImageFormat>) -> ImageFormat {
    match input {
        Some(f @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Bmp | ImageFormat::Tiff)) => f,
        _ => ImageFormat::Png,
    }
}

/// Path of the processed file for a raw temp file: `processed_<raw name>`
/// in the same directory.
pub fn processed_path(raw: &Path) -> PathBuf {
    let name = raw
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    raw.with_file_name(format!("processed_{}", name))
}

/// Decode `input`, convert to grayscale and write it to `output`.
///
/// Blocking. `cancel` is checked around the encode; once it is set the
/// function leaves nothing at `output`.
pub fn grayscale_file(
    input: &Path,
    output: &Path,
    cancel: &AtomicBool,
) -> Result<ImageFormat, TransformError> {
    let reader = ImageReader::open(input)?.with_guessed_format()?;
    let source_format = reader.format();
    let img = reader.decode().map_err(TransformError::Decode)?;
    let gray = img.to_luma8();

    if cancel.load(Ordering::Acquire) {
        return Err(TransformError::Cancelled);
    }

    let format = output_format(source_format);
    gray.save_with_format(output, format)
        .map_err(TransformError::Encode)?;

    if cancel.load(Ordering::Acquire) {
        let _ = std::fs::remove_file(output);
        return Err(TransformError::Cancelled);
    }

    debug!(
        "Converted {:?} ({}x{}, {:?}) to grayscale {:?}",
        input,
        gray.width(),
        gray.height(),
        source_format,
        format
    );
    Ok(format)
}

/// Sets the cancel flag when dropped, so a transform whose caller timed out
/// or went away leaves no output behind.
pub struct CancelOnDrop(pub Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Run `grayscale_file` on the blocking pool.
pub async fn grayscale(
    input: PathBuf,
    output: PathBuf,
    cancel: Arc<AtomicBool>,
) -> Result<ImageFormat, TransformError> {
    tokio::task::spawn_blocking(move || grayscale_file(&input, &output, &cancel))
        .await
        .map_err(|e| TransformError::Join(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_rgb(path: &Path, format: ImageFormat) {
        let img = RgbImage::from_fn(8, 4, |x, y| Rgb([(x * 30) as u8, (y * 60) as u8, 200]));
        img.save_with_format(path, format).unwrap();
    }

    #[test]
    fn test_png_becomes_grayscale_png() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("temp_receipt.png");
        let output = processed_path(&input);
        write_rgb(&input, ImageFormat::Png);

        let format = grayscale_file(&input, &output, &AtomicBool::new(false)).unwrap();
        assert_eq!(format, ImageFormat::Png);

        let processed = image::open(&output).unwrap();
        assert_eq!(processed.dimensions(), (8, 4));
        assert_eq!(processed.color(), image::ColorType::L8);
    }

    #[test]
    fn test_jpeg_keeps_format_despite_misleading_name() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("scan.bin");
        write_rgb(&input, ImageFormat::Jpeg);
        let output = dir.path().join("out");

        let format = grayscale_file(&input, &output, &AtomicBool::new(false)).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_corrupted_input_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("temp_receipt.png");
        std::fs::write(&input, b"\x89PNG\r\n\x1a\nthis is not really a png").unwrap();
        let output = processed_path(&input);

        let err = grayscale_file(&input, &output, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
        assert!(!output.exists());
    }

    #[test]
    fn test_cancelled_transform_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("temp_receipt.png");
        write_rgb(&input, ImageFormat::Png);
        let output = processed_path(&input);

        let err = grayscale_file(&input, &output, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, TransformError::Cancelled));
        assert!(!output.exists());
    }

    #[test]
    fn test_output_format_fallback() {
        assert_eq!(output_format(Some(ImageFormat::Gif)), ImageFormat::Png);
        assert_eq!(output_format(Some(ImageFormat::WebP)), ImageFormat::Png);
        assert_eq!(output_format(None), ImageFormat::Png);
        assert_eq!(output_format(Some(ImageFormat::Bmp)), ImageFormat::Bmp);
    }

    #[test]
    fn test_processed_path_sits_beside_raw() {
        let raw = Path::new("/tmp/uploads/user_7/0123_receipt.png");
        assert_eq!(
            processed_path(raw),
            PathBuf::from("/tmp/uploads/user_7/processed_0123_receipt.png")
        );
    }

    #[test]
    fn test_cancel_on_drop_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        drop(CancelOnDrop(Arc::clone(&flag)));
        assert!(flag.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_async_wrapper() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("temp_receipt.png");
        write_rgb(&input, ImageFormat::Png);
        let output = processed_path(&input);

        grayscale(input, output.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(output.exists());
    }
}
