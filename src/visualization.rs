use anyhow::{ensure, Result};
use plotters::prelude::*;
use tracing::info;

use crate::pinn::HistoryPoint;

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1e-12);
    (lo - pad, hi + pad)
}

/// Predicted against ground-truth pressure along the radius.
pub fn draw_pressure_comparison(
    r: &[f64],
    predicted: &[f64],
    target: &[f64],
    output_path: &str,
) -> Result<()> {
    ensure!(
        r.len() == predicted.len() && r.len() == target.len(),
        "radius, prediction and target lengths differ ({}, {}, {})",
        r.len(),
        predicted.len(),
        target.len()
    );

    let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let (x_lo, x_hi) = bounds(r.iter().copied());
    let (y_lo, y_hi) = bounds(predicted.iter().chain(target).copied());
    let mut chart = ChartBuilder::on(&root)
        .caption("Prediction vs Ground Truth", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)?;

    chart
        .configure_mesh()
        .x_desc("R (m)")
        .y_desc("P (Pa)")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            r.iter().copied().zip(predicted.iter().copied()),
            &BLUE,
        ))?
        .label("Pred")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .draw_series(LineSeries::new(
            r.iter().copied().zip(target.iter().copied()),
            &RED,
        ))?
        .label("Ground Truth")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    info!("Visualization saved to {}", output_path);
    Ok(())
}

/// Data, residual and validation losses on a log scale.
pub fn draw_loss_history(history: &[HistoryPoint], output_path: &str) -> Result<()> {
    ensure!(!history.is_empty(), "no loss history to draw");

    let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let positive = |v: f64| v.is_finite() && v > 0.0;
    let all = history
        .iter()
        .flat_map(|p| [Some(p.data), Some(p.residual), p.val])
        .flatten()
        .filter(|&v| positive(v));
    let (lo, hi) = all.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let (lo, hi) = if lo.is_finite() { (lo * 0.5, hi * 2.0) } else { (1e-6, 1.0) };
    let last_epoch = history.last().map_or(1, |p| p.epoch.max(1));

    let mut chart = ChartBuilder::on(&root)
        .caption("Training Losses", ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(0..last_epoch, (lo..hi).log_scale())?;

    chart
        .configure_mesh()
        .x_desc("Epoch")
        .y_desc("Loss")
        .draw()?;

    let series: [(&str, RGBColor, fn(&HistoryPoint) -> Option<f64>); 3] = [
        ("Data", BLUE, |p: &HistoryPoint| Some(p.data)),
        ("Residual", RED, |p: &HistoryPoint| Some(p.residual)),
        ("Validation", GREEN, |p: &HistoryPoint| p.val),
    ];
    for (label, color, pick) in series {
        let points: Vec<(usize, f64)> = history
            .iter()
            .filter_map(|p| pick(p).filter(|&v| positive(v)).map(|v| (p.epoch, v)))
            .collect();
        chart
            .draw_series(LineSeries::new(points, &color))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    info!("Loss history saved to {}", output_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_pad_the_finite_range() {
        let (lo, hi) = bounds([1.0, f64::NAN, 3.0].into_iter());
        assert!(lo < 1.0 && hi > 3.0);
        assert_eq!(bounds(std::iter::empty()), (0.0, 1.0));
    }

    #[test]
    fn mismatched_series_are_rejected_before_drawing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.png");
        let err = draw_pressure_comparison(&[0.1, 0.2], &[1.0], &[1.0, 2.0], path.to_str().unwrap());
        assert!(err.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn empty_history_is_rejected() {
        assert!(draw_loss_history(&[], "unused.png").is_err());
    }
}
