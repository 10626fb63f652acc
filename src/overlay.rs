// Overlay rendering: draw-command plans for detected faces and an RGBA rasterizer

use crate::models::{BoundingBox, FaceDetection, FacingMode, Point};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

/// Expressions below this probability are left out of a face's label
pub const LABEL_MIN_PROBABILITY: f32 = 0.1;

const BOX_COLOR: Rgba<u8> = Rgba([0, 140, 255, 255]);
const LANDMARK_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const LABEL_COLOR: Rgba<u8> = Rgba([255, 255, 255, 220]);
const LABEL_BAR_HEIGHT: u32 = 4;

/// One step of a canvas drawing, in the order it must be applied
#[derive(Clone, Debug, PartialEq)]
pub enum DrawCommand {
    ResizeCanvas { width: u32, height: u32 },
    Clear,
    Save,
    Scale { x: f32, y: f32 },
    Translate { x: f32, y: f32 },
    StrokeRect(BoundingBox),
    Landmarks(Vec<Point>),
    Label(ExpressionLabel),
    Restore,
}

/// Text drawn under a face box, e.g. "happy (0.87)"
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionLabel {
    pub x: f32,
    pub y: f32,
    pub lines: Vec<(String, f32)>,
}

impl ExpressionLabel {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|(label, p)| format!("{label} ({p:.2})"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A complete overlay for one processed frame
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayPlan {
    pub width: u32,
    pub height: u32,
    pub mirrored: bool,
    pub commands: Vec<DrawCommand>,
}

/// Builds the draw commands for one frame's detections.
///
/// The canvas is always resized to the frame and cleared first. Front-facing
/// plans mirror the context horizontally so boxes line up with the mirrored
/// video.
pub fn render(
    width: u32,
    height: u32,
    detections: &[FaceDetection],
    facing: FacingMode,
) -> OverlayPlan {
    let mirrored = facing.is_mirrored();
    let mut commands = Vec::with_capacity(5 + detections.len() * 3);

    commands.push(DrawCommand::ResizeCanvas { width, height });
    commands.push(DrawCommand::Clear);
    commands.push(DrawCommand::Save);
    if mirrored {
        commands.push(DrawCommand::Scale { x: -1.0, y: 1.0 });
        commands.push(DrawCommand::Translate {
            x: -(width as f32),
            y: 0.0,
        });
    }

    for detection in detections {
        commands.push(DrawCommand::StrokeRect(detection.bbox));
        if !detection.landmarks.is_empty() {
            commands.push(DrawCommand::Landmarks(detection.landmarks.clone()));
        }
        commands.push(DrawCommand::Label(label_for(detection)));
    }

    commands.push(DrawCommand::Restore);

    OverlayPlan {
        width,
        height,
        mirrored,
        commands,
    }
}

fn label_for(detection: &FaceDetection) -> ExpressionLabel {
    let mut lines: Vec<(String, f32)> = detection
        .expressions
        .iter()
        .filter(|(_, p)| *p >= LABEL_MIN_PROBABILITY)
        .map(|(emotion, p)| (emotion.key().to_string(), p))
        .collect();
    lines.sort_by(|a, b| b.1.total_cmp(&a.1));

    ExpressionLabel {
        x: detection.bbox.x,
        y: detection.bbox.y + detection.bbox.height,
        lines,
    }
}

/// Axis-aligned canvas transform: `x' = sx * x + tx`, `y' = sy * y + ty`
#[derive(Clone, Copy, Debug, PartialEq)]
struct Transform {
    sx: f32,
    tx: f32,
    sy: f32,
    ty: f32,
}

impl Transform {
    const IDENTITY: Transform = Transform {
        sx: 1.0,
        tx: 0.0,
        sy: 1.0,
        ty: 0.0,
    };

    fn scale(&mut self, x: f32, y: f32) {
        self.sx *= x;
        self.sy *= y;
    }

    fn translate(&mut self, x: f32, y: f32) {
        self.tx += self.sx * x;
        self.ty += self.sy * y;
    }

    fn point(&self, x: f32, y: f32) -> (f32, f32) {
        (self.sx * x + self.tx, self.sy * y + self.ty)
    }

    fn rect(&self, bbox: &BoundingBox) -> BoundingBox {
        let (x1, y1) = self.point(bbox.x, bbox.y);
        let (x2, y2) = self.point(bbox.x + bbox.width, bbox.y + bbox.height);
        BoundingBox::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }
}

/// Rasterizes a plan onto `canvas`.
///
/// `ResizeCanvas` replaces the canvas when the dimensions differ, so nothing
/// drawn at a previous resolution survives. Label text is reduced to a
/// confidence bar; glyph rendering is left to the display surface.
pub fn paint(plan: &OverlayPlan, canvas: &mut RgbaImage) {
    let mut transform = Transform::IDENTITY;
    let mut saved: Vec<Transform> = Vec::new();

    for command in &plan.commands {
        match command {
            DrawCommand::ResizeCanvas { width, height } => {
                if canvas.dimensions() != (*width, *height) {
                    *canvas = RgbaImage::new(*width, *height);
                }
            }
            DrawCommand::Clear => {
                for pixel in canvas.pixels_mut() {
                    *pixel = Rgba([0, 0, 0, 0]);
                }
            }
            DrawCommand::Save => saved.push(transform),
            DrawCommand::Restore => {
                transform = saved.pop().unwrap_or(Transform::IDENTITY);
            }
            DrawCommand::Scale { x, y } => transform.scale(*x, *y),
            DrawCommand::Translate { x, y } => transform.translate(*x, *y),
            DrawCommand::StrokeRect(bbox) => {
                if let Some(rect) = to_pixel_rect(&transform.rect(bbox), canvas) {
                    draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
                }
            }
            DrawCommand::Landmarks(points) => {
                let (w, h) = canvas.dimensions();
                for point in points {
                    let (x, y) = transform.point(point.x, point.y);
                    let cx = clamp_to_i32(x, w);
                    let cy = clamp_to_i32(y, h);
                    draw_filled_circle_mut(canvas, (cx, cy), 1, LANDMARK_COLOR);
                }
            }
            DrawCommand::Label(label) => paint_label(label, &transform, canvas),
        }
    }
}

fn paint_label(label: &ExpressionLabel, transform: &Transform, canvas: &mut RgbaImage) {
    let Some((_, top_probability)) = label.lines.first() else {
        return;
    };
    let (x, y) = transform.point(label.x, label.y);
    let width = (top_probability * 40.0).max(1.0);
    // mirrored labels extend leftwards from the anchor
    let x = if transform.sx < 0.0 { x - width } else { x };
    let bar = BoundingBox::new(x, y + 2.0, width, LABEL_BAR_HEIGHT as f32);
    if let Some(rect) = to_pixel_rect(&bar, canvas) {
        draw_filled_rect_mut(canvas, rect, LABEL_COLOR);
    }
}

/// Clips a float box to the canvas; `None` when nothing remains visible
fn to_pixel_rect(bbox: &BoundingBox, canvas: &RgbaImage) -> Option<Rect> {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let x1 = bbox.x.max(0.0);
    let y1 = bbox.y.max(0.0);
    let x2 = (bbox.x + bbox.width).min(w as f32);
    let y2 = (bbox.y + bbox.height).min(h as f32);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let width = (x2 - x1).round().max(1.0) as u32;
    let height = (y2 - y1).round().max(1.0) as u32;
    Some(Rect::at(x1.round() as i32, y1.round() as i32).of_size(width, height))
}

#[inline]
fn clamp_to_i32(value: f32, max_extent: u32) -> i32 {
    if max_extent == 0 {
        return 0;
    }
    let max = (max_extent - 1) as f32;
    value.clamp(0.0, max).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Emotion, ExpressionVector};

    fn face(x: f32, y: f32, w: f32, h: f32) -> FaceDetection {
        FaceDetection::new(
            BoundingBox::new(x, y, w, h),
            ExpressionVector::new()
                .with(Emotion::Happy, 0.7)
                .with(Emotion::Sad, 0.2)
                .with(Emotion::Angry, 0.05),
        )
        .with_landmarks(vec![Point::new(x + 2.0, y + 2.0)])
    }

    #[test]
    fn front_facing_plan_is_mirrored_after_resize_and_clear() {
        let plan = render(64, 48, &[face(2.0, 2.0, 10.0, 10.0)], FacingMode::Front);
        assert!(plan.mirrored);
        assert_eq!(
            &plan.commands[..5],
            &[
                DrawCommand::ResizeCanvas {
                    width: 64,
                    height: 48
                },
                DrawCommand::Clear,
                DrawCommand::Save,
                DrawCommand::Scale { x: -1.0, y: 1.0 },
                DrawCommand::Translate { x: -64.0, y: 0.0 },
            ]
        );
        assert_eq!(plan.commands.last(), Some(&DrawCommand::Restore));
    }

    #[test]
    fn back_facing_plan_has_no_transform() {
        let plan = render(64, 48, &[face(2.0, 2.0, 10.0, 10.0)], FacingMode::Back);
        assert!(!plan.mirrored);
        assert!(!plan
            .commands
            .iter()
            .any(|c| matches!(c, DrawCommand::Scale { .. } | DrawCommand::Translate { .. })));
    }

    #[test]
    fn labels_skip_low_probabilities_and_sort_descending() {
        let plan = render(64, 48, &[face(2.0, 2.0, 10.0, 10.0)], FacingMode::Back);
        let label = plan
            .commands
            .iter()
            .find_map(|c| match c {
                DrawCommand::Label(label) => Some(label.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(label.text(), "happy (0.70)\nsad (0.20)");
        assert_eq!((label.x, label.y), (2.0, 12.0));
    }

    #[test]
    fn mirrored_paint_flips_boxes_horizontally() {
        let plan = render(20, 10, &[face(0.0, 0.0, 5.0, 5.0)], FacingMode::Front);
        let mut canvas = RgbaImage::new(20, 10);
        paint(&plan, &mut canvas);
        // box spans x in [15, 20) once mirrored
        assert_eq!(canvas.get_pixel(19, 0), &BOX_COLOR);
        assert_eq!(canvas.get_pixel(0, 0)[3], 0);

        let plan = render(20, 10, &[face(0.0, 0.0, 5.0, 5.0)], FacingMode::Back);
        paint(&plan, &mut canvas);
        assert_eq!(canvas.get_pixel(0, 0), &BOX_COLOR);
        assert_eq!(canvas.get_pixel(19, 0)[3], 0);
    }

    #[test]
    fn resize_drops_overlays_from_previous_resolution() {
        let mut canvas = RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255]));
        let plan = render(16, 12, &[], FacingMode::Back);
        paint(&plan, &mut canvas);
        assert_eq!(canvas.dimensions(), (16, 12));
        assert!(canvas.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn clear_wipes_same_size_canvas() {
        let mut canvas = RgbaImage::from_pixel(16, 12, Rgba([255, 0, 0, 255]));
        paint(&render(16, 12, &[], FacingMode::Front), &mut canvas);
        assert!(canvas.pixels().all(|p| p[3] == 0));
    }
}
