//! Visual snapshots of the mixup pipeline and slice dumps of predictions
//!
//! Arrays are written as `.npy` through candle, composites as PNG through
//! the `image` crate with a JSON sidecar naming each grid cell. Everything goes through a [`VisualSink`] so runners
//! can be driven without touching the filesystem.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use image::{imageops, Rgb, RgbImage};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Fixed colours for class ids 0 to 4
const PALETTE: [[u8; 3]; 5] = [
    [68, 1, 84],
    [59, 82, 139],
    [33, 145, 140],
    [94, 201, 98],
    [253, 231, 37],
];

/// How a 2-D panel is coloured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelStyle {
    /// Class ids on the fixed 0 to 4 palette
    Segmentation,
    /// Min-max normalised intensities
    Grayscale,
}

impl PanelStyle {
    /// Style used for a snapshot label
    pub fn for_label(label: &str) -> Self {
        if label == "GT" || label.ends_with("_pred") {
            Self::Segmentation
        } else {
            Self::Grayscale
        }
    }
}

/// A labelled 2-D array
#[derive(Debug, Clone)]
pub struct Panel {
    /// Panel name
    pub label: String,
    /// `[H, W]` values
    pub data: Tensor,
    /// Colouring
    pub style: PanelStyle,
}

/// Panels laid out on a square grid
#[derive(Debug, Clone, Default)]
pub struct Figure {
    /// Panels in reading order
    pub panels: Vec<Panel>,
}

impl Figure {
    /// Side of the square grid, `floor(sqrt(n)) + 1`
    pub fn grid_size(&self) -> usize {
        (self.panels.len() as f64).sqrt() as usize + 1
    }

    /// Where each panel lands on the rendered grid, in reading order
    pub fn layout(&self) -> Result<Vec<PanelPlacement>> {
        let dims = self
            .panels
            .iter()
            .map(|panel| Ok(panel.data.dims2()?))
            .collect::<Result<Vec<(usize, usize)>>>()?;
        let tile_h = dims.iter().map(|(h, _)| *h as u32).max().unwrap_or(1);
        let tile_w = dims.iter().map(|(_, w)| *w as u32).max().unwrap_or(1);
        let fs = self.grid_size() as u32;

        Ok(self
            .panels
            .iter()
            .enumerate()
            .map(|(idx, panel)| {
                let idx = idx as u32;
                PanelPlacement {
                    label: panel.label.clone(),
                    row: idx / fs,
                    col: idx % fs,
                    x: (idx % fs) * tile_w,
                    y: (idx / fs) * tile_h,
                }
            })
            .collect())
    }

    /// Render every panel into one image
    pub fn render(&self) -> Result<RgbImage> {
        let tiles = self
            .panels
            .iter()
            .map(|panel| render_panel(&panel.data, panel.style))
            .collect::<Result<Vec<_>>>()?;

        let tile_w = tiles.iter().map(|t| t.width()).max().unwrap_or(1);
        let tile_h = tiles.iter().map(|t| t.height()).max().unwrap_or(1);
        let fs = self.grid_size() as u32;
        let mut canvas = RgbImage::from_pixel(fs * tile_w, fs * tile_h, Rgb([255, 255, 255]));

        for (tile, place) in tiles.iter().zip(self.layout()?) {
            imageops::replace(&mut canvas, tile, place.x as i64, place.y as i64);
        }
        Ok(canvas)
    }
}

/// Grid cell and pixel offset of one panel in a rendered [`Figure`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelPlacement {
    /// Panel name
    pub label: String,
    /// Grid row
    pub row: u32,
    /// Grid column
    pub col: u32,
    /// Left edge in pixels
    pub x: u32,
    /// Top edge in pixels
    pub y: u32,
}

/// Colour one `[H, W]` tensor
pub fn render_panel(data: &Tensor, style: PanelStyle) -> Result<RgbImage> {
    let rows: Vec<Vec<f32>> = data.to_dtype(DType::F32)?.to_vec2()?;
    let height = rows.len() as u32;
    let width = rows.first().map(|r| r.len()).unwrap_or(0) as u32;
    if height == 0 || width == 0 {
        return Err(Error::batch("cannot render an empty panel"));
    }

    let (lo, hi) = rows
        .iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = if hi > lo { hi - lo } else { 1.0 };

    let mut img = RgbImage::new(width, height);
    for (y, row) in rows.iter().enumerate() {
        for (x, value) in row.iter().enumerate() {
            let pixel = match style {
                PanelStyle::Segmentation => {
                    let class = value.round().clamp(0.0, 4.0) as usize;
                    Rgb(PALETTE[class])
                }
                PanelStyle::Grayscale => {
                    let level = if value.is_finite() && hi > lo {
                        ((value - lo) / range * 255.0).round() as u8
                    } else {
                        0
                    };
                    Rgb([level, level, level])
                }
            };
            img.put_pixel(x as u32, y as u32, pixel);
        }
    }
    Ok(img)
}

/// Destination of visual side effects
pub trait VisualSink {
    /// Persist a raw array
    fn save_array(&mut self, path: &Path, array: &Tensor) -> Result<()>;

    /// Persist a rendered figure
    fn save_figure(&mut self, path: &Path, figure: &Figure) -> Result<()>;

    /// Persist a single 2-D image
    fn save_image(&mut self, path: &Path, image: &Tensor, style: PanelStyle) -> Result<()>;
}

/// Writes `.npy` arrays and PNG images to disk
#[derive(Debug, Clone, Copy, Default)]
pub struct FileVisualSink;

impl FileVisualSink {
    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl VisualSink for FileVisualSink {
    fn save_array(&mut self, path: &Path, array: &Tensor) -> Result<()> {
        Self::ensure_parent(path)?;
        array.to_dtype(DType::F32)?.write_npy(path)?;
        Ok(())
    }

    fn save_figure(&mut self, path: &Path, figure: &Figure) -> Result<()> {
        Self::ensure_parent(path)?;
        figure.render()?.save(path)?;

        // Panel titles live next to the PNG
        let layout = figure.layout()?;
        std::fs::write(path.with_extension("json"), serde_json::to_vec_pretty(&layout)?)?;
        debug!(
            "Saved figure {} with panels [{}]",
            path.display(),
            layout.iter().map(|p| p.label.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    fn save_image(&mut self, path: &Path, image: &Tensor, style: PanelStyle) -> Result<()> {
        Self::ensure_parent(path)?;
        render_panel(image, style)?.save(path)?;
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl VisualSink for NullSink {
    fn save_array(&mut self, _path: &Path, _array: &Tensor) -> Result<()> {
        Ok(())
    }

    fn save_figure(&mut self, _path: &Path, _figure: &Figure) -> Result<()> {
        Ok(())
    }

    fn save_image(&mut self, _path: &Path, _image: &Tensor, _style: PanelStyle) -> Result<()> {
        Ok(())
    }
}

/// Ordered first-sample panels captured during one mixup iteration
#[derive(Debug, Clone, Default)]
pub struct VisualSnapshot {
    panels: Vec<(String, Tensor)>,
}

impl VisualSnapshot {
    /// Add a `[H, W]` panel, detached from any graph
    pub fn push(&mut self, label: &str, data: &Tensor) {
        self.panels.push((label.to_string(), data.detach()));
    }

    /// Panel labels in insertion order
    pub fn labels(&self) -> Vec<&str> {
        self.panels.iter().map(|(label, _)| label.as_str()).collect()
    }

    /// Number of panels
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    /// Whether no panel was captured
    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    /// Figure with each panel styled by its label
    pub fn to_figure(&self) -> Figure {
        Figure {
            panels: self
                .panels
                .iter()
                .map(|(label, data)| Panel {
                    label: label.clone(),
                    data: data.clone(),
                    style: PanelStyle::for_label(label),
                })
                .collect(),
        }
    }
}

/// Save every panel under `visual_dir/<iteration>/<label>.npy` and the
/// composite as `visual_dir/<iteration>.png`
pub fn dump_snapshot(
    sink: &mut dyn VisualSink,
    visual_dir: &Path,
    iteration: usize,
    snapshot: &VisualSnapshot,
) -> Result<PathBuf> {
    let iteration_dir = visual_dir.join(iteration.to_string());
    for (label, data) in &snapshot.panels {
        sink.save_array(&iteration_dir.join(format!("{label}.npy")), data)?;
    }

    let figure_path = visual_dir.join(format!("{iteration}.png"));
    sink.save_figure(&figure_path, &snapshot.to_figure())?;
    debug!("Dumped {} panels for iteration {}", snapshot.len(), iteration);
    Ok(figure_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn snapshot(n: usize) -> VisualSnapshot {
        let mut snapshot = VisualSnapshot::default();
        for i in 0..n {
            let data = Tensor::full(i as f32, (3, 4), &Device::Cpu).unwrap();
            let label = if i == 0 { "GT".to_string() } else { format!("panel{i}") };
            snapshot.push(&label, &data);
        }
        snapshot
    }

    #[test]
    fn test_grid_size() {
        assert_eq!(snapshot(10).to_figure().grid_size(), 4);
        assert_eq!(snapshot(3).to_figure().grid_size(), 2);
        assert_eq!(snapshot(4).to_figure().grid_size(), 3);
    }

    #[test]
    fn test_panel_styles() {
        assert_eq!(PanelStyle::for_label("GT"), PanelStyle::Segmentation);
        assert_eq!(PanelStyle::for_label("mixed_pred"), PanelStyle::Segmentation);
        assert_eq!(PanelStyle::for_label("combined-UG"), PanelStyle::Grayscale);
    }

    #[test]
    fn test_render_palette_and_grayscale() {
        let data = Tensor::new(&[[0f32, 4.0], [9.0, 1.0]], &Device::Cpu).unwrap();
        let seg = render_panel(&data, PanelStyle::Segmentation).unwrap();
        assert_eq!(seg.get_pixel(1, 0), &Rgb(PALETTE[4]));
        assert_eq!(seg.get_pixel(0, 1), &Rgb(PALETTE[4]));

        let gray = render_panel(&data, PanelStyle::Grayscale).unwrap();
        assert_eq!(gray.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(gray.get_pixel(0, 1), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_dump_snapshot_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileVisualSink;
        let figure = dump_snapshot(&mut sink, dir.path(), 200, &snapshot(3)).unwrap();

        assert!(figure.exists());
        assert!(dir.path().join("200").join("GT.npy").exists());
        assert!(dir.path().join("200").join("panel2.npy").exists());

        let rendered = image::open(&figure).unwrap();
        assert_eq!((rendered.width(), rendered.height()), (8, 6));

        let sidecar = std::fs::read_to_string(dir.path().join("200.json")).unwrap();
        let layout: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
        let labels: Vec<&str> = layout
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["GT", "panel1", "panel2"]);
        assert_eq!(layout[2]["row"], 1);
        assert_eq!(layout[2]["col"], 0);
        assert_eq!(layout[2]["y"], 3);
    }

    #[test]
    fn test_layout_follows_reading_order() {
        let layout = snapshot(5).to_figure().layout().unwrap();
        // 5 panels on a 3x3 grid of 4x3 tiles
        let cells: Vec<(u32, u32, u32, u32)> = layout.iter().map(|p| (p.row, p.col, p.x, p.y)).collect();
        assert_eq!(cells, vec![(0, 0, 0, 0), (0, 1, 4, 0), (0, 2, 8, 0), (1, 0, 0, 3), (1, 1, 4, 3)]);
        assert_eq!(layout[0].label, "GT");
    }
}
