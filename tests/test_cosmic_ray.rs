use astrocal::core::cosmic_ray::{CosmicRayRemover, MedianFilterParams, MedianFilterRemover, StarMaskParams};
use astrocal::core::pipeline::StepSpec;
use astrocal::core::steps::Checkpoint;
use astrocal::{Engine, EngineConfig, FrameImage, Header, ProcessingContext, RunOptions, StepType};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const STAR: (usize, usize) = (20, 20);
const HIT: (usize, usize) = (10, 10);

/// 32x32 background of 100 with sigma 2 noise, one hit and one sigma = 1 px star of peak 500
fn field(seed: u64) -> FrameImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 2.0).unwrap();
    let mut image = Array2::from_shape_fn((32, 32), |_| 100.0 + noise.sample(&mut rng));
    for ((i, j), v) in image.indexed_iter_mut() {
        let d2 = (i as f32 - STAR.0 as f32).powi(2) + (j as f32 - STAR.1 as f32).powi(2);
        if d2 <= 16.0 {
            *v += 400.0 * (-d2 / 2.0).exp();
        }
    }
    image[[HIT.0, HIT.1]] = 10000.0;
    image
}

/// Pixels within the FWHM (2.355 px) of the star
fn star_core() -> Vec<(usize, usize)> {
    let (r, c) = STAR;
    vec![(r, c), (r - 1, c), (r + 1, c), (r, c - 1), (r, c + 1)]
}

#[test]
fn test_hit_removed_and_star_preserved() {
    for seed in [7u64, 42, 1234] {
        let image = field(seed);
        let result = CosmicRayRemover::new()
            .remove(image.clone(), &Checkpoint::default())
            .unwrap();

        assert!(result.flagged.contains(&HIT), "seed {}", seed);
        let repaired = result.image[[HIT.0, HIT.1]];
        assert!((90.0..=110.0).contains(&repaired), "seed {}: {}", seed, repaired);

        for p in star_core() {
            assert_eq!(result.image[[p.0, p.1]], image[[p.0, p.1]], "seed {} star pixel {:?}", seed, p);
        }
    }
}

#[test]
fn test_unflagged_pixels_are_untouched() {
    let image = field(99);
    let result = CosmicRayRemover::new()
        .with_star_mask(StarMaskParams::default())
        .remove(image.clone(), &Checkpoint::default())
        .unwrap();

    for ((i, j), &v) in result.image.indexed_iter() {
        if !result.flagged.contains(&(i, j)) {
            assert_eq!(v, image[[i, j]]);
        }
    }
    assert!(result.masked_pixels > 0);
    assert!(!result.flagged.iter().any(|p| star_core().contains(p)));
}

#[test]
fn test_median_filter_removes_hit() {
    let image = field(5);
    let result = MedianFilterRemover::new(MedianFilterParams::default())
        .remove(image, &Checkpoint::default())
        .unwrap();
    assert!(result.flagged.contains(&HIT));
    assert!((90.0..=110.0).contains(&result.image[[HIT.0, HIT.1]]));
}

#[test]
fn test_zero_iterations_through_engine() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let image = field(11);
    let spec = StepSpec::new(StepType::CosmicRayRemoval, "lacosmic").with_param("max_iter", 0i64);
    let ctx = ProcessingContext::test("cr");
    let (out, _, outcome) = engine
        .run_step(&ctx, image.clone(), Header::for_image(32, 32), &spec, None, &RunOptions::default())
        .unwrap();
    assert_eq!(out, image);
    assert_eq!(outcome.metric_f64("cosmic_rays_detected"), Some(0.0));
}

#[test]
fn test_enhanced_variant_reports_mask() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let spec = StepSpec::new(StepType::CosmicRayRemoval, "lacosmic-v2");
    let ctx = ProcessingContext::test("cr");
    let (out, _, outcome) = engine
        .run_step(&ctx, field(3), Header::for_image(32, 32), &spec, None, &RunOptions::default())
        .unwrap();
    assert!(outcome.metric_f64("masked_pixels").unwrap() > 0.0);
    assert!(outcome.metric_f64("cosmic_rays_detected").unwrap() >= 1.0);
    assert!((90.0..=110.0).contains(&out[[HIT.0, HIT.1]]));
}

#[test]
fn test_neural_variant_is_unsupported() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let spec = StepSpec::new(StepType::CosmicRayRemoval, "neural-cr");
    let ctx = ProcessingContext::test("cr");
    let result = engine.run_step(&ctx, field(1), Header::for_image(32, 32), &spec, None, &RunOptions::default());
    assert!(matches!(result, Err(astrocal::CalError::AlgorithmUnsupported(_))));
}
