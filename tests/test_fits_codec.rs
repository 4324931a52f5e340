use astrocal::io::fits::{self, FrameCodec};
use astrocal::{CalError, Engine, EngineConfig, Header};
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use std::io::Write;

/// Fixed-format header card padded to 80 columns
fn card(key: &str, value: &str) -> String {
    format!("{:<80}", format!("{:<8}= {:>20}", key, value))
}

fn raw_header(cards: &[String]) -> Vec<u8> {
    let mut text: String = cards.concat();
    text.push_str(&format!("{:<80}", "END"));
    let mut bytes = text.into_bytes();
    let padded = bytes.len().div_ceil(2880) * 2880;
    bytes.resize(padded, b' ');
    bytes
}

#[test]
fn test_float_frame_keeps_pixels_and_cards() {
    let image = Array2::from_shape_fn((5, 7), |(i, j)| (i as f32) * 1.5 - (j as f32) * 0.25);
    let mut header = Header::for_image(7, 5);
    header.set_str("OBJECT", "M31 field", Some("target"));
    header.set_float("EXPTIME", 300.0, Some("exposure time (s)"));
    header.set_str("INSTRUME", "WFC3", None);
    header.add_history("flat from 2024-01-02");

    let bytes = fits::encode(&image, &header).unwrap();
    assert_eq!(bytes.len() % 2880, 0);

    let (decoded, decoded_header) = fits::decode(&bytes).unwrap();
    assert_eq!(decoded, image);
    assert_eq!(decoded_header.get_str("OBJECT"), Some("M31 field"));
    assert_eq!(decoded_header.exposure_time(), Some(300.0));
    assert_eq!(decoded_header.instrument(), Some("WFC3"));
    assert_eq!(decoded_header.history(), vec!["flat from 2024-01-02"]);
}

#[test]
fn test_integer_frame_applies_scaling() {
    let image = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f32 * 1000.0);
    let mut header = Header::for_image(4, 4);
    header.set_int("BITPIX", 16, None);
    header.set_float("BZERO", 32768.0, None);
    header.set_float("BSCALE", 1.0, None);

    let (decoded, decoded_header) = fits::decode(&fits::encode(&image, &header).unwrap()).unwrap();
    assert_eq!(decoded_header.get_i64("BITPIX"), Some(16));
    assert_eq!(decoded, image);
}

#[test]
fn test_gzip_frames_decode_through_engine() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let image = Array2::from_elem((3, 3), 42.0f32);
    let plain = engine.encode_frame(&image, &Header::for_image(3, 3)).unwrap();

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&plain).unwrap();
    let compressed = gz.finish().unwrap();

    let (decoded, _) = engine.decode_frame(&compressed).unwrap();
    assert_eq!(decoded, image);
}

#[test]
fn test_oversized_frame_rejected_before_payload() {
    // No payload follows the header; the size check must fire first
    let bytes = raw_header(&[
        card("SIMPLE", "T"),
        card("BITPIX", "-32"),
        card("NAXIS", "2"),
        card("NAXIS1", "40000"),
        card("NAXIS2", "40000"),
    ]);
    let result = FrameCodec::with_max_image_bytes(524_288_000).decode(&bytes);
    assert!(matches!(result, Err(CalError::ImageTooLarge { .. })));
}

#[test]
fn test_truncated_payload_is_dimension_mismatch() {
    let bytes = raw_header(&[
        card("SIMPLE", "T"),
        card("BITPIX", "16"),
        card("NAXIS", "2"),
        card("NAXIS1", "10"),
        card("NAXIS2", "10"),
    ]);
    assert!(matches!(fits::decode(&bytes), Err(CalError::DimensionMismatch(_))));
}

#[test]
fn test_malformed_containers() {
    assert!(matches!(fits::decode(b"SIMPLE"), Err(CalError::MalformedContainer(_))));

    let not_fits = vec![b'x'; 2880];
    assert!(matches!(fits::decode(&not_fits), Err(CalError::MalformedContainer(_))));

    let cube = raw_header(&[
        card("SIMPLE", "T"),
        card("BITPIX", "8"),
        card("NAXIS", "3"),
        card("NAXIS1", "2"),
        card("NAXIS2", "2"),
        card("NAXIS3", "2"),
    ]);
    assert!(matches!(fits::decode(&cube), Err(CalError::MalformedContainer(_))));
}

#[test]
fn test_unsupported_bitpix() {
    let bytes = raw_header(&[
        card("SIMPLE", "T"),
        card("BITPIX", "24"),
        card("NAXIS", "2"),
        card("NAXIS1", "1"),
        card("NAXIS2", "1"),
    ]);
    assert!(matches!(fits::decode(&bytes), Err(CalError::UnsupportedBitpix(_))));
}

#[test]
fn test_encode_rejects_inconsistent_header() {
    let image = Array2::zeros((3, 4));
    let header = Header::for_image(5, 3);
    assert!(matches!(
        fits::encode(&image, &header),
        Err(CalError::DimensionMismatch(_))
    ));
}
