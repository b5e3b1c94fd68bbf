use std::path::Path;

use anyhow::{anyhow, Result};
use plotters::prelude::*;

use crate::utils::tables::{CoverageInterval, ReferenceRow, TranscriptRow};

const PANEL_WIDTH: u32 = 1200;
const PANEL_HEIGHT: u32 = 420;

/// Assigns each `(start, end)` interval to the first lane where it does not overlap.
/// Input order is kept; returns the lane per interval.
pub fn pack_lanes(intervals: &[(u64, u64)]) -> Vec<usize> {
    let mut lane_ends: Vec<u64> = Vec::new();
    let mut order: Vec<usize> = (0..intervals.len()).collect();
    order.sort_by_key(|&i| intervals[i]);
    let mut lanes = vec![0; intervals.len()];
    for i in order {
        let (start, end) = intervals[i];
        match lane_ends.iter().position(|&last| last < start) {
            Some(lane) => {
                lane_ends[lane] = end;
                lanes[i] = lane;
            }
            None => {
                lane_ends.push(end);
                lanes[i] = lane_ends.len() - 1;
            }
        }
    }
    lanes
}

/// Genomic span covered by anything on the contig, never empty.
fn contig_span(contig: &str, coverage: &[CoverageInterval], reference: &[ReferenceRow], assembled: &[TranscriptRow]) -> (f64, f64) {
    let bounds = coverage
        .iter()
        .filter(|c| c.chr == contig)
        .map(|c| (c.start, c.end))
        .chain(reference.iter().filter(|r| r.chr == contig).map(|r| (r.start, r.end)))
        .chain(assembled.iter().filter(|t| t.chr == contig).map(|t| (t.start, t.end)));
    let (lo, hi) = bounds.fold((u64::MAX, 0u64), |(lo, hi), (s, e)| (lo.min(s), hi.max(e)));
    if lo >= hi {
        (0.0, 1.0)
    } else {
        (lo as f64, hi as f64)
    }
}

fn strand_color(strand: char) -> RGBColor {
    match strand {
        '+' => RGBColor(31, 119, 180),
        '-' => RGBColor(214, 39, 40),
        _ => RGBColor(127, 127, 127),
    }
}

fn draw_features<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    title: &str,
    span: (f64, f64),
    features: &[(u64, u64, char, String)],
) -> Result<()>
where
    DB::ErrorType: 'static,
{
    let intervals: Vec<(u64, u64)> = features.iter().map(|f| (f.0, f.1)).collect();
    let lanes = pack_lanes(&intervals);
    let lane_count = lanes.iter().max().map(|m| m + 1).unwrap_or(1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 14))
        .margin(5)
        .x_label_area_size(20)
        .y_label_area_size(50)
        .build_cartesian_2d(span.0..span.1, 0f64..lane_count)
        .map_err(|e| anyhow!("{}: {}", title, e))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .disable_y_axis()
        .draw()
        .map_err(|e| anyhow!("{}: {}", title, e))?;

    chart
        .draw_series(features.iter().zip(lanes.iter()).map(|((start, end, strand, _), &lane)| {
            let y = lane as f64;
            Rectangle::new([(*start as f64, y + 0.2), (*end as f64, y + 0.7)], strand_color(*strand).filled())
        }))
        .map_err(|e| anyhow!("{}: {}", title, e))?;
    chart
        .draw_series(features.iter().zip(lanes.iter()).map(|((start, _, _, label), &lane)| {
            Text::new(label.clone(), (*start as f64, lane as f64 + 0.95), ("sans-serif", 10).into_font().color(&BLACK))
        }))
        .map_err(|e| anyhow!("{}: {}", title, e))?;
    Ok(())
}

/// Renders coverage, reference transcripts and assembled transcripts for every xeno contig
/// into one SVG. Each contig gets a panel of three stacked tracks.
pub fn plot_xeno_comparison(
    coverage: &[CoverageInterval],
    reference: &[ReferenceRow],
    assembled: &[TranscriptRow],
    contigs: &[String],
    sample: &str,
    output_path: &Path,
) -> Result<()> {
    if contigs.is_empty() {
        return Err(anyhow!("No contigs to plot for {}", sample));
    }

    let root = SVGBackend::new(output_path, (PANEL_WIDTH, PANEL_HEIGHT * contigs.len() as u32)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((contigs.len(), 1));

    for (contig, panel) in contigs.iter().zip(panels.iter()) {
        let span = contig_span(contig, coverage, reference, assembled);
        let tracks = panel.split_evenly((3, 1));

        let points: Vec<(f64, f64)> = coverage
            .iter()
            .filter(|c| &c.chr == contig)
            .flat_map(|c| [(c.start as f64, c.depth), (c.end as f64, c.depth)])
            .collect();
        let max_depth = points.iter().map(|p| p.1).fold(0.0f64, f64::max).max(1.0);

        let mut chart = ChartBuilder::on(&tracks[0])
            .caption(format!("{} {} coverage", sample, contig), ("sans-serif", 16))
            .margin(5)
            .x_label_area_size(20)
            .y_label_area_size(50)
            .build_cartesian_2d(span.0..span.1, 0f64..max_depth * 1.05)?;
        chart.configure_mesh().disable_x_mesh().y_desc("depth").draw()?;
        chart.draw_series(LineSeries::new(points, &BLUE))?;

        let reference_features: Vec<(u64, u64, char, String)> = reference
            .iter()
            .filter(|r| &r.chr == contig)
            .map(|r| (r.start, r.end, r.strand, r.gene_name.clone().unwrap_or_else(|| ".".to_string())))
            .collect();
        draw_features(&tracks[1], "reference transcripts", span, &reference_features)?;

        let assembled_features: Vec<(u64, u64, char, String)> = assembled
            .iter()
            .filter(|t| &t.chr == contig)
            .map(|t| {
                let label = match t.fpkm {
                    Some(fpkm) => format!("{} ({:.1} FPKM)", t.label(), fpkm),
                    None => t.label().to_string(),
                };
                (t.start, t.end, t.strand, label)
            })
            .collect();
        draw_features(&tracks[2], "assembled transcripts", span, &assembled_features)?;
    }

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pack_lanes() {
        let lanes = pack_lanes(&[(100, 500), (200, 300), (600, 700), (250, 650)]);
        assert_eq!(lanes, vec![0, 1, 0, 2]);
        assert!(pack_lanes(&[]).is_empty());
    }

    #[test]
    fn test_plot_xeno_comparison_writes_svg() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("S1_xeno_plot.svg");
        let coverage = vec![
            CoverageInterval { chr: "chrX_donor".into(), start: 0, end: 1, depth: 0.0 },
            CoverageInterval { chr: "chrX_donor".into(), start: 1, end: 2, depth: 5.0 },
        ];
        let reference = vec![ReferenceRow {
            chr: "chrX_donor".into(),
            start: 1,
            end: 2,
            strand: '+',
            exons: 1,
            gene_name: Some("GENE1".into()),
        }];
        let contigs = vec!["chrX_donor".to_string(), "chrY_donor".to_string()];
        plot_xeno_comparison(&coverage, &reference, &[], &contigs, "S1", &out)?;
        let svg = std::fs::read_to_string(&out)?;
        assert!(svg.contains("<svg"));
        assert!(svg.contains("GENE1"));
        Ok(())
    }

    #[test]
    fn test_contig_span_without_data() {
        assert_eq!(contig_span("chrZ", &[], &[], &[]), (0.0, 1.0));
    }
}
