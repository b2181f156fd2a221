//! Painting a [`Heatmap`] with the egui painter, and a standalone viewer
//! window for results files.

use eframe::egui;
use egui::{Align2, Color32, FontId, Pos2, Rect, Sense, Vec2};

use crate::data::heatmap::Heatmap;

const TICK_FONT: f32 = 11.0;
const LEFT_MARGIN: f32 = 60.0;
const BOTTOM_MARGIN: f32 = 36.0;

/// Draw `heatmap` filling the available space.
pub fn show(ui: &mut egui::Ui, heatmap: &Heatmap) {
    let Some(data) = heatmap.data() else {
        ui.label("Waiting for data…");
        return;
    };
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return;
    }

    let size = ui.available_size().max(Vec2::new(200.0, 150.0));
    let (rect, response) = ui.allocate_exact_size(size, Sense::hover());
    let painter = ui.painter_at(rect);
    let text_color = ui.visuals().text_color();

    let grid = Rect::from_min_max(
        Pos2::new(rect.left() + LEFT_MARGIN, rect.top()),
        Pos2::new(rect.right(), rect.bottom() - BOTTOM_MARGIN),
    );
    let cell = Vec2::new(grid.width() / cols as f32, grid.height() / rows as f32);

    for row in 0..rows {
        for col in 0..cols {
            let min = grid.min + Vec2::new(col as f32 * cell.x, row as f32 * cell.y);
            let color = heatmap
                .cell_color(row, col)
                .map_or(Color32::GRAY, |[r, g, b]| Color32::from_rgb(r, g, b));
            painter.rect_filled(Rect::from_min_size(min, cell), 0.0, color);
        }
    }

    let font = FontId::proportional(TICK_FONT);
    for (col, tick) in heatmap.x_ticks().iter().enumerate().filter(|(_, t)| !t.is_empty()) {
        let pos = Pos2::new(grid.left() + (col as f32 + 0.5) * cell.x, grid.bottom() + 2.0);
        painter.text(pos, Align2::CENTER_TOP, tick, font.clone(), text_color);
    }
    for (row, tick) in heatmap.y_ticks().iter().enumerate().filter(|(_, t)| !t.is_empty()) {
        let pos = Pos2::new(grid.left() - 4.0, grid.top() + (row as f32 + 0.5) * cell.y);
        painter.text(pos, Align2::RIGHT_CENTER, tick, font.clone(), text_color);
    }
    painter.text(
        Pos2::new(grid.center().x, rect.bottom()),
        Align2::CENTER_BOTTOM,
        heatmap.x_label(),
        font.clone(),
        text_color,
    );
    painter.text(
        Pos2::new(rect.left(), grid.top()),
        Align2::LEFT_TOP,
        heatmap.y_label(),
        font,
        text_color,
    );

    if let Some(pointer) = response.hover_pos().filter(|p| grid.contains(*p)) {
        let col = (((pointer.x - grid.left()) / cell.x) as usize).min(cols - 1);
        let row = (((pointer.y - grid.top()) / cell.y) as usize).min(rows - 1);
        response.on_hover_text(format!("{}", data[[row, col]]));
    }
}

/// Window showing a single heatmap.
pub struct HeatmapViewer {
    title: String,
    heatmap: Heatmap,
}

impl HeatmapViewer {
    /// Viewer for `heatmap` under `title`.
    pub fn new(title: impl Into<String>, heatmap: Heatmap) -> Self {
        Self {
            title: title.into(),
            heatmap,
        }
    }

    /// Open the window and block until it is closed.
    pub fn run(self) -> eframe::Result<()> {
        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default().with_inner_size([800.0, 600.0]),
            ..Default::default()
        };
        let title = self.title.clone();
        eframe::run_native(&title, options, Box::new(|_cc| Ok(Box::new(self))))
    }
}

impl eframe::App for HeatmapViewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading(&self.title);
            show(ui, &self.heatmap);
        });
    }
}
