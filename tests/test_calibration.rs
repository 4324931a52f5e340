use approx::assert_abs_diff_eq;
use astrocal::core::pipeline::StepSpec;
use astrocal::{
    CalibrationFrame, Engine, EngineConfig, FrameImage, Header, ProcessingContext, RunOptions, StepType,
};
use ndarray::Array2;

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("Failed to create engine")
}

fn ramp(height: usize, width: usize) -> FrameImage {
    Array2::from_shape_fn((height, width), |(i, j)| 500.0 + (i * width + j) as f32)
}

fn run(
    engine: &Engine,
    image: FrameImage,
    header: Header,
    spec: &StepSpec,
    calib: Option<&CalibrationFrame>,
) -> (FrameImage, astrocal::StepOutcome) {
    let ctx = ProcessingContext::test("calibration-tests");
    let (image, _, outcome) = engine
        .run_step(&ctx, image, header, spec, calib, &RunOptions::default())
        .expect("Step failed");
    (image, outcome)
}

#[test]
fn test_bias_scalar_from_overscan() {
    let engine = engine();
    let image = Array2::from_shape_fn((8, 8), |(i, _)| if i < 4 { 50.0 } else { 1050.0 });
    let spec = StepSpec::new(StepType::BiasSubtraction, "default");

    let (out, outcome) = run(&engine, image, Header::for_image(8, 8), &spec, None);

    assert_abs_diff_eq!(outcome.metric_f64("bias_level").unwrap(), 50.0, epsilon = 1e-6);
    for ((i, _), &v) in out.indexed_iter() {
        if i < 4 {
            assert_eq!(v, 0.0);
        } else {
            assert_abs_diff_eq!(v, 1000.0, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_bias_zero_correction_is_noop() {
    let engine = engine();
    let bias = CalibrationFrame::from_image(Array2::from_elem((6, 6), 20.0));
    let zero = CalibrationFrame::from_image(Array2::zeros((6, 6)));
    let spec = StepSpec::new(StepType::BiasSubtraction, "default");

    let (once, _) = run(&engine, ramp(6, 6), Header::for_image(6, 6), &spec, Some(&bias));
    let (twice, _) = run(&engine, once.clone(), Header::for_image(6, 6), &spec, Some(&zero));
    assert_eq!(once, twice);
}

#[test]
fn test_dark_auto_scale_by_exposure() {
    let engine = engine();
    let mut header = Header::for_image(10, 10);
    header.set_float("EXPTIME", 120.0, None);
    let mut dark = CalibrationFrame::from_image(Array2::from_elem((10, 10), 10.0));
    dark.header.set_float("EXPTIME", 60.0, None);

    let spec = StepSpec::new(StepType::DarkSubtraction, "default").with_param("auto_scale", true);
    let image = ramp(10, 10);
    let (out, outcome) = run(&engine, image.clone(), header, &spec, Some(&dark));

    assert_abs_diff_eq!(outcome.metric_f64("scale_factor").unwrap(), 2.0, epsilon = 1e-12);
    for (o, i) in out.iter().zip(image.iter()) {
        assert_eq!(*o, *i - 20.0);
    }
}

#[test]
fn test_dark_of_zeros_is_identity() {
    let engine = engine();
    let dark = CalibrationFrame::from_image(Array2::zeros((5, 7)));
    let spec = StepSpec::new(StepType::DarkSubtraction, "default");
    let image = ramp(5, 7);
    let (out, _) = run(&engine, image.clone(), Header::for_image(7, 5), &spec, Some(&dark));
    assert_eq!(out, image);
}

#[test]
fn test_dark_without_exposure_time_fails() {
    let engine = engine();
    let dark = CalibrationFrame::from_image(Array2::from_elem((4, 4), 1.0));
    let spec = StepSpec::new(StepType::DarkSubtraction, "scaled-dark");
    let ctx = ProcessingContext::test("calibration-tests");
    let result = engine.run_step(
        &ctx,
        ramp(4, 4),
        Header::for_image(4, 4),
        &spec,
        Some(&dark),
        &RunOptions::default(),
    );
    assert!(matches!(result, Err(astrocal::CalError::MissingExposureTime(_))));
}

/// 121 pixels: 60 spread below 1.0, one at 1.0 and 60 at 1.2
fn flat_with_mode_above_median() -> FrameImage {
    let mut values: Vec<f32> = (0..60).map(|k| 0.70 + 0.005 * k as f32).collect();
    values.push(1.0);
    values.extend(std::iter::repeat(1.2f32).take(60));
    Array2::from_shape_vec((11, 11), values).unwrap()
}

#[test]
fn test_flat_normalized_by_mode() {
    let engine = engine();
    let flat = CalibrationFrame::from_image(flat_with_mode_above_median());
    let spec = StepSpec::new(StepType::FlatCorrection, "default");

    let (_, outcome) = run(
        &engine,
        Array2::from_elem((11, 11), 1000.0),
        Header::for_image(11, 11),
        &spec,
        Some(&flat),
    );

    assert_eq!(outcome.metric_text("normalization"), Some("mode"));
    assert_abs_diff_eq!(outcome.metric_f64("value").unwrap(), 1.2, epsilon = 1e-6);
    assert_abs_diff_eq!(outcome.metric_f64("flat_median").unwrap(), 1.0, epsilon = 1e-6);
}

#[test]
fn test_flat_of_ones_is_identity() {
    let engine = engine();
    let flat = CalibrationFrame::from_image(Array2::ones((6, 9)));
    let spec = StepSpec::new(StepType::FlatCorrection, "default");
    let image = ramp(6, 9);

    let (out, _) = run(&engine, image.clone(), Header::for_image(9, 6), &spec, Some(&flat));
    for (o, i) in out.iter().zip(image.iter()) {
        assert!(((o - i) / i).abs() <= 1e-6);
    }
}

#[test]
fn test_flat_bad_pixel_takes_mean() {
    let engine = engine();
    let mut flat = Array2::ones((5, 5));
    flat[[2, 3]] = 0.0;
    flat[[4, 0]] = -1.0;
    let flat = CalibrationFrame::from_image(flat);
    let spec = StepSpec::new(StepType::FlatCorrection, "default").with_param("post_smooth", false);

    let mut image = Array2::from_elem((5, 5), 200.0);
    image[[0, 0]] = 223.0;
    let (out, outcome) = run(&engine, image, Header::for_image(5, 5), &spec, Some(&flat));

    let mean = (200.0f32 * 22.0 + 223.0) / 23.0;
    assert_abs_diff_eq!(out[[2, 3]], mean, epsilon = 1e-3);
    assert_abs_diff_eq!(out[[4, 0]], mean, epsilon = 1e-3);
    assert_eq!(outcome.metric_f64("bad_pixels"), Some(2.0));
}

#[test]
fn test_single_pixel_frame_through_every_step() {
    let engine = engine();
    let one = |v: f32| Array2::from_elem((1, 1), v);
    let mut header = Header::for_image(1, 1);
    header.set_float("EXPTIME", 10.0, None);

    let (out, _) = run(
        &engine,
        one(40.0),
        header.clone(),
        &StepSpec::new(StepType::BiasSubtraction, "default"),
        None,
    );
    assert_eq!(out[[0, 0]], 0.0);

    let (out, _) = run(
        &engine,
        one(40.0),
        header.clone(),
        &StepSpec::new(StepType::DarkSubtraction, "default"),
        Some(&CalibrationFrame::from_image(one(4.0))),
    );
    assert_eq!(out[[0, 0]], 36.0);

    let (out, _) = run(
        &engine,
        one(40.0),
        header.clone(),
        &StepSpec::new(StepType::FlatCorrection, "default"),
        Some(&CalibrationFrame::from_image(one(2.0))),
    );
    assert_abs_diff_eq!(out[[0, 0]], 40.0, epsilon = 1e-4);

    let (out, outcome) = run(
        &engine,
        one(40.0),
        header,
        &StepSpec::new(StepType::CosmicRayRemoval, "lacosmic"),
        None,
    );
    assert_eq!(out[[0, 0]], 40.0);
    assert_eq!(outcome.metric_f64("cosmic_rays_detected"), Some(0.0));
}

#[test]
fn test_calibration_dimension_mismatch() {
    let engine = engine();
    let flat = CalibrationFrame::from_image(Array2::ones((4, 5)));
    let ctx = ProcessingContext::test("calibration-tests");
    let result = engine.run_step(
        &ctx,
        ramp(5, 4),
        Header::for_image(4, 5),
        &StepSpec::new(StepType::FlatCorrection, "default"),
        Some(&flat),
        &RunOptions::default(),
    );
    assert!(matches!(
        result,
        Err(astrocal::CalError::CalibrationDimensionMismatch { .. })
    ));
}

fn all_finite(image: &FrameImage) -> bool {
    image.iter().all(|v| v.is_finite())
}

#[test]
fn test_non_finite_science_pixels_are_repaired() {
    let engine = engine();
    let mut image = ramp(6, 6);
    image[[2, 2]] = f32::NAN;
    image[[4, 1]] = f32::INFINITY;
    let bias = CalibrationFrame::from_image(Array2::from_elem((6, 6), 10.0));
    let dark = CalibrationFrame::from_image(Array2::from_elem((6, 6), 2.0));
    let flat = CalibrationFrame::from_image(Array2::ones((6, 6)));

    for (step, calib) in [
        (StepType::BiasSubtraction, &bias),
        (StepType::DarkSubtraction, &dark),
        (StepType::FlatCorrection, &flat),
    ] {
        let spec = StepSpec::new(step, "default");
        let (out, outcome) = run(&engine, image.clone(), Header::for_image(6, 6), &spec, Some(calib));
        assert!(all_finite(&out), "{}", step);
        assert!(
            outcome
                .warnings
                .iter()
                .any(|w| w.contains("2 non-finite input pixels replaced")),
            "{}: {:?}",
            step,
            outcome.warnings
        );
    }
}

#[test]
fn test_non_finite_master_pixels_are_repaired() {
    let engine = engine();
    let mut bias = Array2::from_elem((6, 6), 10.0f32);
    bias[[1, 1]] = f32::NAN;
    let mut dark = Array2::from_elem((6, 6), 2.0f32);
    dark[[3, 4]] = f32::INFINITY;
    let mut flat = Array2::ones((6, 6));
    flat[[0, 5]] = f32::NEG_INFINITY;

    for (step, master) in [
        (StepType::BiasSubtraction, bias),
        (StepType::DarkSubtraction, dark),
        (StepType::FlatCorrection, flat),
    ] {
        let calib = CalibrationFrame::from_image(master);
        let spec = StepSpec::new(step, "default");
        let (out, outcome) = run(&engine, ramp(6, 6), Header::for_image(6, 6), &spec, Some(&calib));
        assert!(all_finite(&out), "{}", step);
        assert!(outcome
            .warnings
            .iter()
            .any(|w| w.contains("1 non-finite calibration pixels replaced")));
    }
}

#[test]
fn test_adaptive_dark_with_infinite_master_stays_finite() {
    let engine = engine();
    let mut dark = Array2::from_elem((16, 16), 2.0f32);
    dark[[8, 8]] = f32::INFINITY;
    let calib = CalibrationFrame::from_image(dark);
    let spec = StepSpec::new(StepType::DarkSubtraction, "adaptive-dark");
    let (out, _) = run(&engine, ramp(16, 16), Header::for_image(16, 16), &spec, Some(&calib));
    assert!(all_finite(&out));
}

#[test]
fn test_subnormal_flat_pixel_does_not_overflow() {
    let engine = engine();
    let mut flat = Array2::ones((5, 5));
    flat[[2, 2]] = 1e-38;
    let calib = CalibrationFrame::from_image(flat);
    let spec = StepSpec::new(StepType::FlatCorrection, "default");
    let (out, outcome) = run(
        &engine,
        Array2::from_elem((5, 5), 100.0),
        Header::for_image(5, 5),
        &spec,
        Some(&calib),
    );
    assert!(all_finite(&out));
    assert!(outcome.metric_f64("bad_pixels").unwrap() >= 1.0);
}

#[test]
fn test_overflowing_output_is_rejected() {
    let engine = engine();
    let dark = CalibrationFrame::from_image(Array2::from_elem((4, 4), 3.0e38));
    let ctx = ProcessingContext::test("calibration-tests");
    let result = engine.run_step(
        &ctx,
        Array2::from_elem((4, 4), -3.0e38),
        Header::for_image(4, 4),
        &StepSpec::new(StepType::DarkSubtraction, "default"),
        Some(&dark),
        &RunOptions::default(),
    );
    assert!(matches!(result, Err(astrocal::CalError::NumericDegenerate(_))));
}
