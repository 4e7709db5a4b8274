//! PDF page → fixed-size thumbnail rendering.

use std::env;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use thiserror::Error;

use crate::config::ThumbOptions;
use crate::services::aspect::Aspect;

/// Thumbnail dimensions per aspect. Unknown aspects get the 16:9 fallback
/// (320x180 with the default options); the exact value matters less than its
/// stability across runs.
pub fn thumb_size(aspect: Aspect, options: &ThumbOptions) -> (u32, u32) {
    match aspect {
        Aspect::FourThree => (options.width, options.height_4_3),
        Aspect::SixteenNine | Aspect::Unknown => (options.width, options.height_16_9),
    }
}

#[derive(Debug, Error)]
pub enum ThumbRenderError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),
    #[error("failed to load PDF {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: PdfiumError,
    },
    #[error("failed to render page {page_index} of {path}: {source}")]
    Render {
        path: PathBuf,
        page_index: u16,
        #[source]
        source: PdfiumError,
    },
    #[error("failed to write thumbnail {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("io error writing thumbnail: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendered thumbnail {path} is empty")]
    EmptyOutput { path: PathBuf },
}

/// Seam for rasterization so pipeline tests run without a Pdfium binary.
#[async_trait]
pub trait ThumbRender: Send + Sync {
    async fn render(
        &self,
        pdf_path: &Path,
        page_index: u16,
        out_path: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ThumbRenderError>;
}

#[derive(Default)]
pub struct PdfiumThumbRenderer;

#[async_trait]
impl ThumbRender for PdfiumThumbRenderer {
    async fn render(
        &self,
        pdf_path: &Path,
        page_index: u16,
        out_path: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), ThumbRenderError> {
        let pdf_path = pdf_path.to_path_buf();
        let out_path = out_path.to_path_buf();
        // Pdfium is synchronous and CPU-bound; keep it off the runtime.
        tokio::task::spawn_blocking(move || {
            render_pdf_page_to_thumb(&pdf_path, page_index, &out_path, width, height)
        })
        .await
        .map_err(|join| ThumbRenderError::Io(std::io::Error::other(join)))?
    }
}

/// Rasterize one PDF page (0-based) into a JPEG of exactly (width, height).
pub fn render_pdf_page_to_thumb(
    pdf_path: &Path,
    page_index: u16,
    out_path: &Path,
    width: u32,
    height: u32,
) -> Result<(), ThumbRenderError> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pdfium = load_pdfium()?;
    let document =
        pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|source| ThumbRenderError::Document {
                path: pdf_path.to_path_buf(),
                source,
            })?;
    let page = document
        .pages()
        .get(page_index)
        .map_err(|source| ThumbRenderError::Render {
            path: pdf_path.to_path_buf(),
            page_index,
            source,
        })?;

    let config = PdfRenderConfig::new()
        .set_target_width(width as i32)
        .set_target_height(height as i32);
    let bitmap = page
        .render_with_config(&config)
        .map_err(|source| ThumbRenderError::Render {
            path: pdf_path.to_path_buf(),
            page_index,
            source,
        })?;
    let rgb = bitmap.as_image().into_rgb8();
    rgb.save(out_path)
        .map_err(|source| ThumbRenderError::Write {
            path: out_path.to_path_buf(),
            source,
        })?;

    let len = std::fs::metadata(out_path)?.len();
    if len == 0 {
        return Err(ThumbRenderError::EmptyOutput {
            path: out_path.to_path_buf(),
        });
    }
    Ok(())
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Some(raw) = env::var_os("PDFIUM_LIBRARY_PATH") {
        let path = PathBuf::from(raw);
        let lib_path = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&path)
        } else {
            path
        };
        return Pdfium::bind_to_library(lib_path).map(Pdfium::new);
    }
    match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")) {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(primary_err) => match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(_) => Err(primary_err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_thumb_options() -> ThumbOptions {
        ThumbOptions::default()
    }

    #[test]
    fn four_three_renders_at_320x240() {
        let opts = default_thumb_options();
        assert_eq!(thumb_size(Aspect::FourThree, &opts), (320, 240));
    }

    #[test]
    fn sixteen_nine_renders_at_320x180() {
        let opts = default_thumb_options();
        assert_eq!(thumb_size(Aspect::SixteenNine, &opts), (320, 180));
    }

    #[test]
    fn unknown_aspect_size_is_fixed_across_calls() {
        let opts = default_thumb_options();
        let first = thumb_size(Aspect::Unknown, &opts);
        let second = thumb_size(Aspect::Unknown, &opts);
        assert_eq!(first, second, "unknown size must be stable");
        assert_eq!(first, (320, 180));
    }
}
