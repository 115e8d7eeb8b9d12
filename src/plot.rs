use anyhow::{anyhow, bail, Result};
use plotters::prelude::*;
use std::path::Path;

const WIDTH: u32 = 960;
const HEIGHT: u32 = 540;

/// Draws average reward per iteration as an SVG line chart.
pub fn render_returns(returns: &[f32], task_id: &str, path: &Path) -> Result<()> {
    if returns.is_empty() {
        bail!("no iterations to plot");
    }

    let (y_min, y_max) = value_range(returns);
    let x_max = (returns.len().max(2) - 1) as f32;

    let root = SVGBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| anyhow!("failed to draw plot background: {e}"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("GRPO on {task_id}"), ("sans-serif", 24))
        .margin(16)
        .x_label_area_size(40)
        .y_label_area_size(56)
        .build_cartesian_2d(0f32..x_max, y_min..y_max)
        .map_err(|e| anyhow!("failed to build chart: {e}"))?;

    chart
        .configure_mesh()
        .x_desc("Episodes")
        .y_desc("Returns")
        .draw()
        .map_err(|e| anyhow!("failed to draw chart mesh: {e}"))?;

    chart
        .draw_series(LineSeries::new(
            returns.iter().enumerate().map(|(i, r)| (i as f32, *r)),
            &BLUE,
        ))
        .map_err(|e| anyhow!("failed to draw reward curve: {e}"))?;

    root.present()
        .map_err(|e| anyhow!("failed to write plot to {}: {e}", path.display()))?;

    Ok(())
}

fn value_range(values: &[f32]) -> (f32, f32) {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(1.0);
    (lo - pad, hi + pad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_svg_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("returns.svg");

        render_returns(&[12.0, 30.5, 80.0, 495.5], "CartPole-v1", &path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("GRPO on CartPole-v1"));
    }

    #[test]
    fn empty_curve_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(render_returns(&[], "CartPole-v1", &dir.path().join("x.svg")).is_err());
    }

    #[test]
    fn range_pads_flat_and_non_finite_series() {
        assert_eq!(value_range(&[5.0, 5.0]), (4.0, 6.0));
        assert_eq!(value_range(&[f32::NAN]), (0.0, 1.0));
    }
}
