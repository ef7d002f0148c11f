//! Cooperative cancellation of wavefront-map calculations.
use wavefront_rs::examples::convexplano_lens;
use wavefront_rs::{CancelToken, Cancelled, Field, GridPattern, MapOptions};

#[test]
fn pre_tripped_token_cancels_immediately() {
    let calc = convexplano_lens::calculator();
    let token = CancelToken::new();
    token.cancel("user closed the window");

    let options = MapOptions {
        cancel: Some(token),
        ..MapOptions::default()
    };
    let err = calc
        .generate_wavefront_map(&Field::on_axis(), 64, GridPattern::Circular, options)
        .unwrap_err();

    let cancelled = err.downcast_ref::<Cancelled>().expect("must be Cancelled");
    assert_eq!(cancelled.reason, "user closed the window");
}

#[test]
fn mid_map_cancel_returns_no_partial_map() {
    let calc = convexplano_lens::calculator();
    let token = CancelToken::new();

    // Trip the token from the progress callback once sampling has started;
    // the next checkpoint must observe it.
    let trip = token.clone();
    let options = MapOptions {
        cancel: Some(token),
        progress: Some(Box::new(move |p| {
            if matches!(p.phase, wavefront_rs::MapPhase::Sampling) && p.completed > 0 {
                trip.cancel("stop it");
            }
        })),
        ..MapOptions::default()
    };

    let err = calc
        .generate_wavefront_map(&Field::on_axis(), 64, GridPattern::Circular, options)
        .unwrap_err();

    assert!(err.downcast_ref::<Cancelled>().is_some());
}

#[test]
fn calculator_remains_usable_after_cancellation() {
    let calc = convexplano_lens::calculator();
    let token = CancelToken::new();
    token.cancel("first try aborted");

    let options = MapOptions {
        cancel: Some(token),
        ..MapOptions::default()
    };
    assert!(
        calc.generate_wavefront_map(&Field::on_axis(), 16, GridPattern::Circular, options)
            .is_err()
    );

    // A fresh call without the token completes normally.
    let map = calc
        .generate_wavefront_map(
            &Field::on_axis(),
            16,
            GridPattern::Circular,
            MapOptions::default(),
        )
        .unwrap();
    assert!(map.report.primary.rms.is_finite());
}
