//! End-to-end wavefront analysis of the stopped-down convexplano singlet.
use wavefront_rs::examples::convexplano_lens;
use wavefront_rs::{Field, GridPattern, MapOptions, OpdMode, ZernikeOptions};

#[test]
fn on_axis_map_is_fully_valid_and_small() {
    let calc = convexplano_lens::calculator();
    let map = calc
        .generate_wavefront_map(
            &Field::on_axis(),
            16,
            GridPattern::Circular,
            MapOptions::default(),
        )
        .unwrap();

    let g = map.grid_size;
    let mut in_circle = 0;
    let mut valid = 0;
    for iy in 0..g {
        for ix in 0..g {
            let px = map.pupil_x[[iy, ix]];
            let py = map.pupil_y[[iy, ix]];
            if (px * px + py * py).sqrt() <= 1.0 {
                in_circle += 1;
                if map.valid_mask[[iy, ix]] {
                    valid += 1;
                    assert!(map.opd_um[[iy, ix]].is_finite());
                }
            } else {
                assert!(map.opd_um[[iy, ix]].is_nan());
            }
        }
    }
    assert_eq!(valid, in_circle, "every in-circle sample should be valid");
    assert!(map.metadata.invalid_histogram.is_empty());
    assert!(!map.metadata.restarted);

    // The f/16.7 singlet is nearly diffraction limited: the wavefront
    // stays well under half a wave peak-to-peak from its mean.
    let peak = map
        .opd_um
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    assert!(
        peak < 0.5 * convexplano_lens::WAVELENGTH,
        "peak |OPD| = {peak} um"
    );
}

#[test]
fn spherical_aberration_dominates_higher_orders() {
    let calc = convexplano_lens::calculator();
    let options = MapOptions {
        zernike: ZernikeOptions {
            max_j: Some(15),
            ..ZernikeOptions::default()
        },
        ..MapOptions::default()
    };
    let map = calc
        .generate_wavefront_map(&Field::on_axis(), 32, GridPattern::Circular, options)
        .unwrap();

    let fit = map.zernike.as_ref().unwrap();
    assert!(!fit.skipped);
    assert!(fit.max_j >= 12, "max_j = {}", fit.max_j);

    // On axis the only surviving high-order term is primary spherical
    // aberration (j = 12).
    let c12 = fit.coefficients[12].abs();
    assert!(c12 > 0.0);
    for j in 5..=fit.max_j {
        if j == 12 {
            continue;
        }
        assert!(
            c12 >= fit.coefficients[j].abs(),
            "c12 = {c12}, |c{j}| = {}",
            fit.coefficients[j].abs()
        );
    }
}

#[test]
fn center_opd_is_exactly_zero() {
    let calc = convexplano_lens::calculator();
    let field = Field::Angle { x: 0.0, y: 2.0 };

    calc.set_reference_ray(&field).unwrap();
    let opd = calc.calculate_opd(0.0, 0.0, &field, OpdMode::Simple);

    assert_eq!(opd, 0.0);
}

#[test]
fn samples_outside_unit_pupil_are_nan() {
    let calc = convexplano_lens::calculator();
    let field = Field::on_axis();

    assert!(calc.calculate_opd(1.1, 0.0, &field, OpdMode::Simple).is_nan());
    assert!(calc.calculate_opd(0.8, 0.8, &field, OpdMode::Simple).is_nan());
    assert!(
        calc.calculate_opd(f64::NAN, 0.0, &field, OpdMode::Simple)
            .is_nan()
    );
}

#[test]
fn identical_requests_yield_bit_identical_maps() {
    let calc = convexplano_lens::calculator();
    let field = Field::Angle { x: 0.0, y: 3.0 };

    let first = calc
        .generate_wavefront_map(&field, 8, GridPattern::Circular, MapOptions::default())
        .unwrap();
    let second = calc
        .generate_wavefront_map(&field, 8, GridPattern::Circular, MapOptions::default())
        .unwrap();

    for (a, b) in first.opd_um.iter().zip(second.opd_um.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
    let fit_a = first.zernike.as_ref().unwrap();
    let fit_b = second.zernike.as_ref().unwrap();
    for (a, b) in fit_a.coefficients.iter().zip(fit_b.coefficients.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn finite_conjugate_map_is_valid() {
    use wavefront_rs::examples::biconvex_finite;

    let calc = biconvex_finite::calculator();
    let field = Field::Height { x: 0.0, y: 0.5 };
    let map = calc
        .generate_wavefront_map(&field, 16, GridPattern::Circular, MapOptions::default())
        .unwrap();

    let valid = map.valid_mask.iter().filter(|v| **v).count();
    assert!(valid > 150, "valid = {valid}");
    assert!(map.report.primary.rms.is_finite());
    assert!(!map.report.zernike_skipped);
}
