//! Zernike model rendering and reconstruction properties on real maps.
use wavefront_rs::examples::convexplano_lens;
use wavefront_rs::{Field, GridPattern, MapOptions, ZernikeOptions};

fn rendered_map_options(max_j: usize) -> MapOptions {
    MapOptions {
        render_from_zernike: true,
        zernike: ZernikeOptions {
            max_j: Some(max_j),
            ..ZernikeOptions::default()
        },
        ..MapOptions::default()
    }
}

#[test]
fn rendered_map_equals_model_evaluation() {
    let calc = convexplano_lens::calculator();
    let field = Field::Angle { x: 0.0, y: 1.0 };

    let map = calc
        .generate_wavefront_map(&field, 32, GridPattern::Circular, rendered_map_options(15))
        .unwrap();

    assert!(map.metadata.rendered_from_zernike);
    let fit = map.zernike.as_ref().unwrap();

    let g = map.grid_size;
    for iy in 0..g {
        for ix in 0..g {
            let px = map.pupil_x[[iy, ix]];
            let py = map.pupil_y[[iy, ix]];
            let rho = (px * px + py * py).sqrt();
            let value = map.opd_um[[iy, ix]];

            if !map.valid_mask[[iy, ix]] || rho > map.metadata.display_trim {
                // Rendering preserves physical vignetting and the display
                // trim as NaN cells.
                assert!(value.is_nan());
            } else {
                let expected = fit.evaluate(px, py);
                assert!(
                    (value - expected).abs() < 1e-12,
                    "cell ({ix}, {iy}): {value} vs {expected}"
                );
            }
        }
    }
}

#[test]
fn reconstruction_error_is_bounded_by_residual() {
    let calc = convexplano_lens::calculator();
    let field = Field::on_axis();

    let map = calc
        .generate_wavefront_map(
            &field,
            24,
            GridPattern::Circular,
            MapOptions {
                zernike: ZernikeOptions {
                    max_j: Some(12),
                    ..ZernikeOptions::default()
                },
                ..MapOptions::default()
            },
        )
        .unwrap();

    let fit = map.zernike.as_ref().unwrap();
    assert!(!fit.skipped);

    // RMS of (centered OPD - model) over the valid samples is bounded by
    // the reported residual.
    let mut samples = Vec::new();
    let g = map.grid_size;
    for iy in 0..g {
        for ix in 0..g {
            if map.valid_mask[[iy, ix]] {
                samples.push((
                    map.pupil_x[[iy, ix]],
                    map.pupil_y[[iy, ix]],
                    map.opd_um[[iy, ix]],
                ));
            }
        }
    }
    if let Some(center) = map.exact_center_opd_um {
        samples.push((0.0, 0.0, center));
    }

    let mean = samples.iter().map(|(_, _, w)| w).sum::<f64>() / samples.len() as f64;
    let mut ss = 0.0;
    for (x, y, w) in samples.iter() {
        let err = (w - mean) - fit.evaluate(*x, *y);
        ss += err * err;
    }
    let rms = (ss / samples.len() as f64).sqrt();

    assert!(
        rms <= fit.residual_rms + 1e-9,
        "rms = {rms}, residual = {}",
        fit.residual_rms
    );
}

#[test]
fn tilted_stop_preserves_spherical_aberration() {
    use wavefront_rs::examples::tilted_stop;

    let straight = tilted_stop::calculator(0.0);
    let tilted = tilted_stop::calculator(10.0);
    let options = |max_j| MapOptions {
        zernike: ZernikeOptions {
            max_j: Some(max_j),
            ..ZernikeOptions::default()
        },
        ..MapOptions::default()
    };

    let map_straight = straight
        .generate_wavefront_map(&Field::on_axis(), 24, GridPattern::Circular, options(12))
        .unwrap();
    let map_tilted = tilted
        .generate_wavefront_map(&Field::on_axis(), 24, GridPattern::Circular, options(12))
        .unwrap();

    // Both pupils are fully reachable.
    let valid = |m: &wavefront_rs::WavefrontMap| m.valid_mask.iter().filter(|v| **v).count();
    assert_eq!(valid(&map_straight), valid(&map_tilted));

    // Stop-local residual measurement makes the tilt transparent to the
    // rotationally symmetric aberrations: the tilted stop adds a linear
    // carrier but leaves spherical aberration intact.
    let c12_straight = map_straight.zernike.as_ref().unwrap().coefficients[12];
    let c12_tilted = map_tilted.zernike.as_ref().unwrap().coefficients[12];
    assert!(
        (c12_straight - c12_tilted).abs() < 0.01,
        "c12 straight = {c12_straight}, tilted = {c12_tilted}"
    );
}
