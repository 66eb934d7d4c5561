//! Frame encoders.
//!
//! Turns a raw sensor frame into the configured on-disk format. PNG goes
//! through the `image` crate; FITS is written directly as a single primary
//! HDU, which is all this data needs: a card header in 2880-byte blocks
//! followed by the pixel planes, padded to the same block size.
//!
//! Color FITS data is stored channel-first (NAXIS3 planes), the convention
//! astronomy tooling expects.

use std::io::Cursor;

use image::{ImageBuffer, ImageFormat, Luma, Rgb};

use crate::camera::Frame;
use crate::config::ImageType;
use crate::error::{AppResult, CaptureError};
use crate::metadata::CaptureProvenance;

/// FITS logical record size.
const FITS_BLOCK: usize = 2880;
/// Bytes per header card.
const CARD_LEN: usize = 80;

/// Encode a frame into the format named by its provenance.
pub fn encode(frame: &Frame, provenance: &CaptureProvenance) -> AppResult<Vec<u8>> {
    match provenance.format {
        ImageType::Png => encode_png(frame),
        ImageType::Fits => encode_fits(frame, provenance),
    }
}

/// Encode to PNG (RGB or grayscale, 8-bit).
pub fn encode_png(frame: &Frame) -> AppResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    match frame.channels {
        3 => {
            let buffer: ImageBuffer<Rgb<u8>, _> =
                ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                    .ok_or_else(|| {
                        CaptureError::Encode("frame buffer does not match geometry".to_string())
                    })?;
            buffer
                .write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| CaptureError::Encode(e.to_string()))?;
        }
        1 => {
            let buffer: ImageBuffer<Luma<u8>, _> =
                ImageBuffer::from_raw(frame.width, frame.height, frame.data.clone())
                    .ok_or_else(|| {
                        CaptureError::Encode("frame buffer does not match geometry".to_string())
                    })?;
            buffer
                .write_to(&mut cursor, ImageFormat::Png)
                .map_err(|e| CaptureError::Encode(e.to_string()))?;
        }
        n => {
            return Err(CaptureError::Encode(format!(
                "unsupported channel count: {n}"
            )))
        }
    }
    Ok(cursor.into_inner())
}

/// Encode to a FITS primary HDU with provenance header cards.
pub fn encode_fits(frame: &Frame, provenance: &CaptureProvenance) -> AppResult<Vec<u8>> {
    if !frame.is_well_formed() {
        return Err(CaptureError::Encode(
            "frame buffer does not match geometry".to_string(),
        ));
    }

    let mut header = Vec::new();
    push_card(&mut header, card_logical("SIMPLE", true));
    push_card(&mut header, card_int("BITPIX", 8));
    if frame.channels > 1 {
        push_card(&mut header, card_int("NAXIS", 3));
        push_card(&mut header, card_int("NAXIS1", i64::from(frame.width)));
        push_card(&mut header, card_int("NAXIS2", i64::from(frame.height)));
        push_card(&mut header, card_int("NAXIS3", i64::from(frame.channels)));
    } else {
        push_card(&mut header, card_int("NAXIS", 2));
        push_card(&mut header, card_int("NAXIS1", i64::from(frame.width)));
        push_card(&mut header, card_int("NAXIS2", i64::from(frame.height)));
    }
    push_card(&mut header, card_str("DATE-OBS", &provenance.captured_local));
    push_card(&mut header, card_str("INSTRUME", &provenance.camera_model));
    push_card(
        &mut header,
        card_real("EXPTIME", f64::from(provenance.exposure_us) / 1_000_000.0),
    );
    push_card(&mut header, card_int("GAIN", i64::from(provenance.gain)));
    push_card(&mut header, card_str("IMAGETYP", "LIGHT"));
    push_card(&mut header, card_str("OBJECT", "SUN"));
    push_card(&mut header, card_str("TIMESYS", &provenance.timezone));
    push_card(
        &mut header,
        card_str(
            "SWCREATE",
            &format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        ),
    );
    push_card(&mut header, end_card());
    pad_to_block(&mut header, b' ');

    let mut out = header;
    append_planes(&mut out, frame);
    pad_to_block(&mut out, 0);
    Ok(out)
}

/// Interleaved rows -> channel-first planes.
fn append_planes(out: &mut Vec<u8>, frame: &Frame) {
    let (w, h, c) = (
        frame.width as usize,
        frame.height as usize,
        frame.channels as usize,
    );
    out.reserve(w * h * c);
    for channel in 0..c {
        for y in 0..h {
            for x in 0..w {
                out.push(frame.data[(y * w + x) * c + channel]);
            }
        }
    }
}

fn pad_to_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % FITS_BLOCK;
    if rem != 0 {
        buf.resize(buf.len() + (FITS_BLOCK - rem), fill);
    }
}

fn push_card(buf: &mut Vec<u8>, card: String) {
    let mut bytes = card.into_bytes();
    bytes.truncate(CARD_LEN);
    bytes.resize(CARD_LEN, b' ');
    buf.extend_from_slice(&bytes);
}

fn card_logical(keyword: &str, value: bool) -> String {
    format!("{keyword:<8}= {:>20}", if value { "T" } else { "F" })
}

fn card_int(keyword: &str, value: i64) -> String {
    format!("{keyword:<8}= {value:>20}")
}

fn card_real(keyword: &str, value: f64) -> String {
    format!("{keyword:<8}= {value:>20.6}")
}

fn card_str(keyword: &str, value: &str) -> String {
    // String values are quoted, opening quote at column 11; single quotes
    // inside the value are doubled per the FITS convention.
    let escaped = value.replace('\'', "''");
    format!("{keyword:<8}= '{escaped:<8}'")
}

fn end_card() -> String {
    "END".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn frame(width: u32, height: u32, channels: u8) -> Frame {
        let n = width as usize * height as usize * channels as usize;
        Frame {
            width,
            height,
            channels,
            data: (0..n).map(|i| (i % 251) as u8).collect(),
            captured_at: Utc::now(),
        }
    }

    fn provenance(format: ImageType) -> CaptureProvenance {
        CaptureProvenance {
            captured_utc: Utc.with_ymd_and_hms(2025, 6, 21, 3, 0, 0).unwrap(),
            captured_local: "2025-06-21T12:00:00+09:00".to_string(),
            timezone: "Asia/Tokyo".to_string(),
            exposure_us: 1000,
            gain: 0,
            wb_r: 52,
            wb_b: 95,
            format,
            camera_model: "SimCam-1600".to_string(),
            camera_serial: "SIM0001".to_string(),
            width: 16,
            height: 8,
        }
    }

    #[test]
    fn test_png_roundtrip_geometry() {
        let f = frame(16, 8, 3);
        let bytes = encode_png(&f).unwrap();

        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_fits_block_alignment() {
        let f = frame(16, 8, 3);
        let bytes = encode_fits(&f, &provenance(ImageType::Fits)).unwrap();

        assert_eq!(bytes.len() % FITS_BLOCK, 0);
        // Header fits one block here; data follows in the next.
        assert_eq!(&bytes[..6], b"SIMPLE");
    }

    #[test]
    fn test_fits_header_cards_present() {
        let f = frame(16, 8, 3);
        let bytes = encode_fits(&f, &provenance(ImageType::Fits)).unwrap();
        let header = String::from_utf8_lossy(&bytes[..FITS_BLOCK]).to_string();

        for keyword in [
            "SIMPLE", "BITPIX", "NAXIS3", "DATE-OBS", "INSTRUME", "EXPTIME", "GAIN", "IMAGETYP",
            "OBJECT", "TIMESYS", "SWCREATE", "END",
        ] {
            assert!(header.contains(keyword), "missing card: {keyword}");
        }
        assert!(header.contains("'LIGHT"));
        assert!(header.contains("'SUN"));
    }

    #[test]
    fn test_fits_channel_first_planes() {
        // 1x1 RGB frame: the three data bytes must land in channel order.
        let f = Frame {
            width: 1,
            height: 1,
            channels: 3,
            data: vec![10, 20, 30],
            captured_at: Utc::now(),
        };
        let bytes = encode_fits(&f, &provenance(ImageType::Fits)).unwrap();
        assert_eq!(&bytes[FITS_BLOCK..FITS_BLOCK + 3], &[10, 20, 30]);
    }

    #[test]
    fn test_grayscale_fits_is_two_axis() {
        let f = frame(8, 8, 1);
        let bytes = encode_fits(&f, &provenance(ImageType::Fits)).unwrap();
        let header = String::from_utf8_lossy(&bytes[..FITS_BLOCK]).to_string();
        assert!(header.contains("NAXIS   =                    2"));
        assert!(!header.contains("NAXIS3"));
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let mut f = frame(16, 8, 3);
        f.data.pop();
        assert!(encode_fits(&f, &provenance(ImageType::Fits)).is_err());
        assert!(encode_png(&f).is_err());
    }
}
