//! QR challenge rendering: PNG artifact and terminal output.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use qrcode::render::unicode::Dense1x2;
use qrcode::{Color, QrCode};
use tracing::{debug, warn};

/// Quiet zone around the symbol, in modules.
const QUIET_ZONE: u32 = 4;
/// Target edge length of the PNG, in pixels.
const TARGET_SIZE: u32 = 256;

/// PNG file holding the current login challenge.
#[derive(Debug, Clone)]
pub struct QrArtifact {
    path: PathBuf,
}

impl QrArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renders `code` and replaces the artifact.
    pub async fn write(&self, code: &str) -> std::io::Result<()> {
        let png = render_png(code)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, png).await?;
        debug!(path = %self.path.display(), "QR artifact written");
        Ok(())
    }

    /// Deletes the artifact. A missing file is not an error.
    pub async fn remove(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "QR artifact removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove QR artifact: {e}"),
        }
    }

    /// Current PNG bytes, `None` when no challenge is on disk.
    pub async fn read(&self) -> Option<Vec<u8>> {
        tokio::fs::read(&self.path).await.ok()
    }
}

/// Encodes `code` as a grayscale PNG with a quiet zone.
pub fn render_png(code: &str) -> std::io::Result<Vec<u8>> {
    let qr = QrCode::new(code.as_bytes()).map_err(|e| std::io::Error::other(e.to_string()))?;
    let modules = qr.width() as u32;
    let colors = qr.to_colors();
    let total = modules + 2 * QUIET_ZONE;
    let scale = (TARGET_SIZE / total).max(1);
    let edge = total * scale;

    let img = GrayImage::from_fn(edge, edge, |x, y| {
        let mx = (x / scale) as i64 - QUIET_ZONE as i64;
        let my = (y / scale) as i64 - QUIET_ZONE as i64;
        let inside = (0..modules as i64).contains(&mx) && (0..modules as i64).contains(&my);
        let dark = inside && colors[(my as usize) * modules as usize + mx as usize] == Color::Dark;
        Luma([if dark { 0 } else { 255 }])
    });

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(png)
}

/// Half-block terminal rendering of `code`, `None` if it cannot be encoded.
pub fn render_terminal(code: &str) -> Option<String> {
    let qr = QrCode::new(code.as_bytes()).ok()?;
    Some(
        qr.render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .quiet_zone(true)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[test]
    fn render_png_produces_square_image() {
        let png = render_png("2@abcdef,ghijkl,mnop").expect("render");
        assert!(png.starts_with(PNG_MAGIC));
        let img = image::load_from_memory(&png).expect("decode");
        assert_eq!(img.width(), img.height());
        assert!(img.width() >= 200 && img.width() <= TARGET_SIZE);
    }

    #[test]
    fn quiet_zone_is_white() {
        let png = render_png("hello").expect("render");
        let img = image::load_from_memory(&png).expect("decode").to_luma8();
        assert_eq!(img.get_pixel(0, 0), &Luma([255]));
        let last = img.width() - 1;
        assert_eq!(img.get_pixel(last, last), &Luma([255]));
    }

    #[test]
    fn render_terminal_emits_block_rows() {
        let text = render_terminal("hello").expect("render");
        assert!(text.lines().count() > 5);
        assert!(text.contains('█') || text.contains('▀') || text.contains('▄'));
    }

    #[tokio::test]
    async fn artifact_write_read_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = QrArtifact::new(dir.path().join("qr").join("login.png"));
        assert!(artifact.read().await.is_none());

        artifact.write("code-1").await.expect("write");
        let first = artifact.read().await.expect("png present");
        assert!(first.starts_with(PNG_MAGIC));

        artifact.write("code-2-is-longer").await.expect("overwrite");
        assert_ne!(artifact.read().await.expect("png present"), first);

        artifact.remove().await;
        assert!(artifact.read().await.is_none());
        artifact.remove().await;
    }
}
