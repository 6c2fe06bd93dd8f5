//! Small stateless helpers the HTTP read surface leans on: on-the-fly image
//! resizing via the `image` crate and gzip negotiation via `flate2`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::errors::{Result, StoreError};

/// Resizes `data` (already decoded into a known format via `ext`, e.g.
/// `"jpg"`, `"png"`, `"gif"`) to fit within `width`x`height`, returning the
/// (possibly unchanged) bytes plus the resulting dimensions. Matches the
/// original's behavior: a zero dimension means "unconstrained", and an image
/// already within bounds is returned unchanged.
pub fn resize(ext: &str, data: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, u32, u32)> {
    let format = match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "png" => ImageFormat::Png,
        "jpg" | "jpeg" => ImageFormat::Jpeg,
        "gif" => ImageFormat::Gif,
        _ => return Ok((data.to_vec(), 0, 0)),
    };

    let img = match image::load_from_memory_with_format(data, format) {
        Ok(img) => img,
        Err(_) => return Ok((data.to_vec(), 0, 0)),
    };
    let (src_w, src_h) = (img.width(), img.height());

    if width == 0 && height == 0 {
        return Ok((data.to_vec(), src_w, src_h));
    }

    let needs_resize = (src_w > width && width != 0) || (src_h > height && height != 0);
    if !needs_resize {
        return Ok((data.to_vec(), src_w, src_h));
    }

    let resized: DynamicImage = if width == height && src_w != src_h {
        img.resize_to_fill(width, height, FilterType::Lanczos3)
    } else {
        img.resize(width, height, FilterType::Lanczos3)
    };
    let (out_w, out_h) = (resized.width(), resized.height());

    let mut buf = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut buf), format)
        .map_err(|e| StoreError::Corrupt(format!("image encode failed: {e}")))?;
    Ok((buf, out_w, out_h))
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Whether the client's `Accept-Encoding` header names `gzip` as acceptable.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    accept_encoding
        .map(|v| v.split(',').any(|part| part.trim().starts_with("gzip")))
        .unwrap_or(false)
}

/// Whether a needle whose bytes are gzip-compressed on disk should be sent
/// as-is (vs. decompressed), based on the requested extension: a literal
/// `.gz` request always wants the compressed bytes untouched.
pub fn should_gzip(ext: Option<&str>, _mime: Option<&str>) -> bool {
    ext != Some(".gz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips() {
        let data = b"hello hello hello hello hello".to_vec();
        let compressed = gzip(&data).unwrap();
        assert!(compressed.len() < data.len());
        let back = gunzip(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn accepts_gzip_parses_header() {
        assert!(accepts_gzip(Some("gzip, deflate")));
        assert!(!accepts_gzip(Some("deflate")));
        assert!(!accepts_gzip(None));
    }

    #[test]
    fn resize_passes_through_unknown_extension() {
        let data = b"not an image".to_vec();
        let (out, w, h) = resize(".bin", &data, 100, 100).unwrap();
        assert_eq!(out, data);
        assert_eq!((w, h), (0, 0));
    }

    #[test]
    fn should_gzip_is_false_only_for_literal_gz_extension() {
        assert!(!should_gzip(Some(".gz"), None));
        assert!(should_gzip(Some(".html"), None));
        assert!(should_gzip(None, None));
    }
}
