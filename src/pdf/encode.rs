//! Sample-level codecs for image streams: inflate and predictor reversal on
//! the way in, flate2/oxipng/jpeg-encoder on the way out.

use crate::constants::{LIBDEFLATER_MAX_LEVEL, OXIPNG_PRESET, ZOPFLI_ITERATIONS};
use crate::pdf::graph::DecodeParms;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, ImageFormat};
use oxipng::{BitDepth, ColorType, Deflaters, Options, RawImage};
use std::io::{self, Read, Write};
use std::num::NonZeroU8;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(decoded)
}

pub fn deflate_best(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Reverse a `/Predictor` so `data` holds plain samples again.
pub fn undo_predictor(data: Vec<u8>, parms: &DecodeParms) -> Result<Vec<u8>, String> {
    match parms.predictor {
        1 => Ok(data),
        2 => undo_tiff_predictor(data, parms),
        10..=15 => undo_png_predictor(&data, parms),
        other => Err(format!("unsupported predictor {}", other)),
    }
}

fn layout(parms: &DecodeParms) -> Result<(usize, usize), String> {
    let colors = usize::try_from(parms.colors).map_err(|_| "bad /Colors".to_string())?;
    let bpc = usize::try_from(parms.bits_per_component).map_err(|_| "bad /BitsPerComponent".to_string())?;
    let columns = usize::try_from(parms.columns).map_err(|_| "bad /Columns".to_string())?;
    if colors == 0 || columns == 0 || !matches!(bpc, 1 | 2 | 4 | 8 | 16) {
        return Err("invalid predictor parameters".to_string());
    }
    let bits_per_pixel = colors.checked_mul(bpc).ok_or("bad /Colors".to_string())?;
    let row_bits = bits_per_pixel
        .checked_mul(columns)
        .ok_or_else(|| "predictor row length overflows".to_string())?;
    Ok((bits_per_pixel.div_ceil(8).max(1), row_bits.div_ceil(8)))
}

fn undo_tiff_predictor(mut data: Vec<u8>, parms: &DecodeParms) -> Result<Vec<u8>, String> {
    if parms.bits_per_component != 8 {
        return Err("TIFF predictor only handled for 8-bit samples".to_string());
    }
    let (bpp, row_len) = layout(parms)?;
    for row in data.chunks_mut(row_len) {
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
    }
    Ok(data)
}

fn undo_png_predictor(data: &[u8], parms: &DecodeParms) -> Result<Vec<u8>, String> {
    let (bpp, row_len) = layout(parms)?;
    let stride = row_len + 1;
    if stride > data.len() {
        return Err("predictor rows longer than the stream".to_string());
    }
    let mut out = Vec::with_capacity(data.len() / stride * row_len);
    let mut prev = vec![0u8; row_len];

    for chunk in data.chunks(stride) {
        if chunk.len() < stride {
            // Trailing padding from some writers.
            break;
        }
        let filter = chunk[0];
        let mut row = chunk[1..].to_vec();
        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            let predicted = match filter {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                other => return Err(format!("invalid PNG row filter {}", other)),
            };
            row[i] = row[i].wrapping_add(predicted);
        }
        out.extend_from_slice(&row);
        prev = row;
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// An encoded sample plane ready to become a `/FlateDecode` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPlane {
    pub data: Vec<u8>,
    /// `(colors, columns)` when the data carries PNG row filters (`/Predictor 15`).
    pub png_rows: Option<(u8, u32)>,
}

/// Losslessly encode one plane of 8-bit-or-less samples, keeping the smaller
/// of a plain flate2 stream and an oxipng-optimised IDAT stream.
pub fn encode_plane(
    samples: &[u8],
    width: u32,
    height: u32,
    channels: u8,
    bits_per_component: u8,
    zopfli: bool,
) -> Result<EncodedPlane, String> {
    let mut best = EncodedPlane {
        data: deflate_best(samples).map_err(|e| e.to_string())?,
        png_rows: None,
    };

    if bits_per_component == 8 && matches!(channels, 1 | 3) {
        if let Some(idat) = png_idat(samples, width, height, channels, zopfli) {
            if idat.len() < best.data.len() {
                best = EncodedPlane {
                    data: idat,
                    png_rows: Some((channels, width)),
                };
            }
        }
    }
    Ok(best)
}

fn oxipng_options(zopfli: bool) -> Options {
    let mut options = Options::from_preset(OXIPNG_PRESET);
    options.force = true;
    // The PDF keeps describing the samples with its own /ColorSpace and /BitsPerComponent.
    options.bit_depth_reduction = false;
    options.color_type_reduction = false;
    options.palette_reduction = false;
    options.grayscale_reduction = false;
    options.deflate = if zopfli {
        Deflaters::Zopfli {
            iterations: NonZeroU8::new(ZOPFLI_ITERATIONS).unwrap_or(NonZeroU8::MIN),
        }
    } else {
        Deflaters::Libdeflater {
            compression: LIBDEFLATER_MAX_LEVEL,
        }
    };
    options
}

fn png_idat(samples: &[u8], width: u32, height: u32, channels: u8, zopfli: bool) -> Option<Vec<u8>> {
    let color_type = match channels {
        1 => ColorType::Grayscale {
            transparent_shade: None,
        },
        3 => ColorType::RGB {
            transparent_color: None,
        },
        _ => return None,
    };
    let raw = RawImage::new(width, height, color_type, BitDepth::Eight, samples.to_vec()).ok()?;
    let png = raw.create_optimized_png(&oxipng_options(zopfli)).ok()?;
    extract_idat(&png, width, height, channels)
}

/// Concatenated IDAT payload of a non-interlaced 8-bit gray or RGB PNG.
pub fn extract_idat(png: &[u8], width: u32, height: u32, channels: u8) -> Option<Vec<u8>> {
    let mut rest = png.strip_prefix(PNG_SIGNATURE)?;
    let mut idat = Vec::new();
    let mut header_ok = false;

    while rest.len() >= 12 {
        let len = u32::from_be_bytes(rest[0..4].try_into().ok()?) as usize;
        let kind = &rest[4..8];
        let body = rest.get(8..8 + len)?;
        match kind {
            b"IHDR" => {
                if body.len() != 13 {
                    return None;
                }
                let w = u32::from_be_bytes(body[0..4].try_into().ok()?);
                let h = u32::from_be_bytes(body[4..8].try_into().ok()?);
                let expected_color = if channels == 1 { 0 } else { 2 };
                header_ok = w == width
                    && h == height
                    && body[8] == 8
                    && body[9] == expected_color
                    && body[12] == 0;
                if !header_ok {
                    return None;
                }
            }
            b"IDAT" => idat.extend_from_slice(body),
            b"IEND" => break,
            _ => {}
        }
        rest = rest.get(12 + len..)?;
    }
    (header_ok && !idat.is_empty()).then_some(idat)
}

/// Decoded JPEG samples, alpha already flattened away.
#[derive(Debug, Clone)]
pub struct DecodedJpeg {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

pub fn decode_jpeg(data: &[u8]) -> Result<DecodedJpeg, String> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| format!("failed to decode JPEG: {}", e))?;
    let (width, height) = (img.width(), img.height());

    let color = img.color();
    let (pixels, channels) = if color.has_alpha() {
        (flatten_over_white(&img), 3)
    } else if color.has_color() {
        (img.to_rgb8().into_raw(), 3)
    } else {
        (img.to_luma8().into_raw(), 1)
    };
    Ok(DecodedJpeg {
        pixels,
        width,
        height,
        channels,
    })
}

fn flatten_over_white(img: &DynamicImage) -> Vec<u8> {
    let rgba = img.to_rgba8();
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.pixels() {
        let alpha = px.0[3] as u16;
        for c in &px.0[..3] {
            rgb.push(((*c as u16 * alpha + 255 * (255 - alpha)) / 255) as u8);
        }
    }
    rgb
}

pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, channels: u8, quality: u8) -> Result<Vec<u8>, String> {
    let color_type = match channels {
        1 => jpeg_encoder::ColorType::Luma,
        3 => jpeg_encoder::ColorType::Rgb,
        other => return Err(format!("cannot JPEG-encode {} channels", other)),
    };
    let w = u16::try_from(width).map_err(|_| "image too wide for JPEG".to_string())?;
    let h = u16::try_from(height).map_err(|_| "image too tall for JPEG".to_string())?;

    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
    encoder.set_progressive(true);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(pixels, w, h, color_type)
        .map_err(|e| format!("failed to encode JPEG: {}", e))?;
    Ok(jpeg_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parms(predictor: i64, colors: i64, columns: i64) -> DecodeParms {
        DecodeParms {
            predictor,
            colors,
            bits_per_component: 8,
            columns,
        }
    }

    fn gradient(width: u32, height: u32, channels: u8) -> Vec<u8> {
        (0..width * height * channels as u32)
            .map(|i| ((i / channels as u32) % width * 7 % 256) as u8)
            .collect()
    }

    #[test]
    fn test_inflate_deflate() {
        let data = b"stream data stream data stream data".repeat(10);
        let packed = deflate_best(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
        assert!(inflate(b"not zlib").is_err());
    }

    #[test]
    fn test_undo_png_predictor_all_filters() {
        // Two pixels per row, one byte each; rows use filters 0..=4.
        let encoded = vec![
            0, 10, 20, // none
            1, 5, 3, // sub: 5, 8
            2, 1, 1, // up: 6, 9
            3, 4, 4, // average: 4 + 6/2 = 7, 4 + (7 + 9)/2 = 12
            4, 1, 1, // paeth: 1 + 7 = 8, 1 + paeth(8, 12, 7) = 13
        ];
        let decoded = undo_predictor(encoded, &parms(15, 1, 2)).unwrap();
        assert_eq!(decoded, vec![10, 20, 5, 8, 6, 9, 7, 12, 8, 13]);
    }

    #[test]
    fn test_undo_predictor_rejects_bad_filter() {
        assert!(undo_predictor(vec![9, 1, 2], &parms(15, 1, 2)).is_err());
        assert!(undo_predictor(vec![1, 2, 3], &parms(3, 1, 3)).is_err());
    }

    #[test]
    fn test_undo_predictor_rejects_oversized_rows() {
        let huge = parms(15, 1, 1 << 61);
        assert!(undo_predictor(vec![0; 64], &huge).is_err());
        assert!(undo_predictor(vec![0; 64], &parms(2, 1, 1 << 61)).is_err());
        assert!(undo_predictor(vec![0, 1], &parms(15, 1, 1 << 20)).is_err());
    }

    #[test]
    fn test_undo_tiff_predictor() {
        let decoded = undo_predictor(vec![1, 1, 1, 5, 5, 5], &parms(2, 1, 3)).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 5, 10, 15]);
    }

    #[test]
    fn test_encode_plane_is_lossless() {
        let samples = gradient(32, 16, 3);
        let plane = encode_plane(&samples, 32, 16, 3, 8, false).unwrap();

        let inflated = inflate(&plane.data).unwrap();
        let restored = match plane.png_rows {
            Some((colors, columns)) => {
                undo_predictor(inflated, &parms(15, colors as i64, columns as i64)).unwrap()
            }
            None => inflated,
        };
        assert_eq!(restored, samples);
    }

    #[test]
    fn test_png_idat_round_trip() {
        let samples = gradient(20, 10, 1);
        let idat = png_idat(&samples, 20, 10, 1, false).unwrap();
        let restored = undo_predictor(inflate(&idat).unwrap(), &parms(15, 1, 20)).unwrap();
        assert_eq!(restored, samples);
    }

    #[test]
    fn test_extract_idat_rejects_garbage() {
        assert!(extract_idat(b"GIF89a", 1, 1, 1).is_none());
        assert!(extract_idat(PNG_SIGNATURE, 1, 1, 1).is_none());
    }

    #[test]
    fn test_jpeg_round_trip_dimensions() {
        let pixels = gradient(16, 8, 3);
        let jpeg = encode_jpeg(&pixels, 16, 8, 3, 80).unwrap();
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height, decoded.channels), (16, 8, 3));

        let gray = encode_jpeg(&gradient(8, 8, 1), 8, 8, 1, 80).unwrap();
        assert_eq!(decode_jpeg(&gray).unwrap().channels, 1);
        assert!(encode_jpeg(&[0; 16], 2, 2, 4, 80).is_err());
    }
}
