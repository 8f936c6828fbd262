use crate::config::{PlotSettings, Scale};
use crate::error::BenchError;
use log::{info, warn};
use plotters::coord::ranged1d::{AsRangedCoord, ValueFormatter};
use plotters::prelude::*;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use textplots::{Chart, Plot, Shape};

const TERMINAL_WIDTH: u32 = 140;
const TERMINAL_HEIGHT: u32 = 60;

const PNG_WIDTH: u32 = 1024;
const PNG_HEIGHT: u32 = 768;

/// Two columns of a result file, ready to draw
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub x_label: String,
    pub y_label: String,
    pub points: Vec<(f64, f64)>,
}

/// Renders one column of a result file against another
///
/// The chart is printed to the terminal and saved as a PNG next to the
/// result file.
#[derive(Debug, Clone)]
pub struct Plotter {
    settings: PlotSettings,
}

impl Plotter {
    pub fn new(settings: PlotSettings) -> Self {
        Self { settings }
    }

    /// Read the configured columns
    ///
    /// Points that cannot be shown on a log axis are dropped.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Series, BenchError> {
        let path = path.as_ref();
        let (x_col, y_col) = (self.settings.x_column, self.settings.y_column);
        let mut reader = csv::Reader::from_path(path)?;

        let headers = reader.headers()?.clone();
        let column_name = |col: usize| {
            headers.get(col).map(str::to_string).ok_or_else(|| {
                BenchError::Plot(format!(
                    "{} has {} column(s), no column {col}",
                    path.display(),
                    headers.len()
                ))
            })
        };
        let x_label = label(&self.settings.x_label, column_name(x_col)?);
        let y_label = label(&self.settings.y_label, column_name(y_col)?);

        let mut points = Vec::new();
        let mut dropped = 0usize;
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let value = |col: usize| -> Result<f64, BenchError> {
                let raw = record.get(col).unwrap_or("");
                raw.trim().parse::<f64>().map_err(|_| {
                    BenchError::Plot(format!(
                        "Row {} column {col}: '{raw}' is not a number",
                        line + 1
                    ))
                })
            };

            let (x, y) = (value(x_col)?, value(y_col)?);
            if drawable(x, self.settings.x_scale) && drawable(y, self.settings.y_scale) {
                points.push((x, y));
            } else {
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!("Dropped {dropped} point(s) that cannot be drawn on the chosen axes");
        }
        if points.is_empty() {
            return Err(BenchError::Plot(format!(
                "No data to plot in {}",
                path.display()
            )));
        }

        Ok(Series {
            x_label,
            y_label,
            points,
        })
    }

    /// Plot the result file and save `<stem>.png` beside it
    pub fn plot_2d<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, BenchError> {
        let path = path.as_ref();
        let series = self.load(path)?;
        let title = if self.settings.title.is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            self.settings.title.clone()
        };

        self.print_chart(&series, &title);

        let png = path.with_extension("png");
        self.render_png(&series, &title, &png)?;
        info!("Plot saved to {}", png.display());
        Ok(png)
    }

    /// textplots has no log axes, so log-scaled values are drawn as log10
    fn print_chart(&self, series: &Series, title: &str) {
        let (x_scale, y_scale) = (self.settings.x_scale, self.settings.y_scale);
        let frame: Vec<(f32, f32)> = series
            .points
            .iter()
            .map(|&(x, y)| (terminal_value(x, x_scale) as f32, terminal_value(y, y_scale) as f32))
            .collect();
        let x_range = padded(frame.iter().map(|p| f64::from(p.0)));
        let y_range = padded(frame.iter().map(|p| f64::from(p.1)));

        println!("{title}");
        println!(
            "X-axis: {} | Y-axis: {}",
            terminal_label(&series.x_label, x_scale),
            terminal_label(&series.y_label, y_scale)
        );
        println!("{}", "─".repeat(TERMINAL_WIDTH as usize));

        Chart::new_with_y_range(
            TERMINAL_WIDTH,
            TERMINAL_HEIGHT,
            x_range.start as f32,
            x_range.end as f32,
            y_range.start as f32,
            y_range.end as f32,
        )
        .lineplot(&Shape::Lines(&frame))
        .nice();
    }

    fn render_png(&self, series: &Series, title: &str, png: &Path) -> Result<(), BenchError> {
        let x = axis_range(series.points.iter().map(|p| p.0), self.settings.x_scale);
        let y = axis_range(series.points.iter().map(|p| p.1), self.settings.y_scale);

        match (self.settings.x_scale, self.settings.y_scale) {
            (Scale::Linear, Scale::Linear) => draw_png(png, series, title, x, y),
            (Scale::Log, Scale::Linear) => draw_png(png, series, title, x.log_scale(), y),
            (Scale::Linear, Scale::Log) => draw_png(png, series, title, x, y.log_scale()),
            (Scale::Log, Scale::Log) => {
                draw_png(png, series, title, x.log_scale(), y.log_scale())
            }
        }
    }
}

fn draw_png<X, Y>(path: &Path, series: &Series, title: &str, x: X, y: Y) -> Result<(), BenchError>
where
    X: AsRangedCoord<Value = f64>,
    Y: AsRangedCoord<Value = f64>,
    X::CoordDescType: ValueFormatter<f64>,
    Y::CoordDescType: ValueFormatter<f64>,
{
    let root = BitMapBackend::new(path, (PNG_WIDTH, PNG_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(x, y)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc(series.x_label.as_str())
        .y_desc(series.y_label.as_str())
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(LineSeries::new(series.points.iter().copied(), &BLUE))
        .map_err(plot_error)?;
    chart
        .draw_series(
            series
                .points
                .iter()
                .map(|&point| Circle::new(point, 3, RED.filled())),
        )
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    Ok(())
}

fn plot_error<E: fmt::Display>(e: E) -> BenchError {
    BenchError::Plot(e.to_string())
}

fn label(configured: &str, header: String) -> String {
    if configured.is_empty() {
        header
    } else {
        configured.to_string()
    }
}

fn drawable(value: f64, scale: Scale) -> bool {
    match scale {
        Scale::Linear => value.is_finite(),
        Scale::Log => value.is_finite() && value > 0.0,
    }
}

fn terminal_value(value: f64, scale: Scale) -> f64 {
    match scale {
        Scale::Linear => value,
        Scale::Log => value.log10(),
    }
}

fn terminal_label(label: &str, scale: Scale) -> String {
    match scale {
        Scale::Linear => label.to_string(),
        Scale::Log => format!("log10({label})"),
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Linear range with a 5% margin, widened when all values coincide
fn padded(values: impl Iterator<Item = f64>) -> Range<f64> {
    let (min, max) = bounds(values);
    if max > min {
        let pad = (max - min) * 0.05;
        (min - pad)..(max + pad)
    } else {
        let pad = if min == 0.0 { 0.5 } else { min.abs() * 0.1 };
        (min - pad)..(max + pad)
    }
}

/// Axis range for the PNG; log axes stay strictly positive
fn axis_range(values: impl Iterator<Item = f64>, scale: Scale) -> Range<f64> {
    match scale {
        Scale::Linear => padded(values),
        Scale::Log => {
            let (min, max) = bounds(values);
            if max > min {
                min..max
            } else {
                (min / 2.0)..(max * 2.0)
            }
        }
    }
}
