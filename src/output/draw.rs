// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/draw.rs - 叠加层绘制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::output::{ObjectGraphic, OverlaySnapshot};

// 置信度条高度（像素）
const CONFIDENCE_BAR_HEIGHT: u32 = 6;

/// 把叠加层绘制到一张与画面（按旋转校正后）同尺寸的空白画布上
pub fn render_snapshot(snapshot: &OverlaySnapshot) -> RgbImage {
  let (width, height) = snapshot.frame.upright_size();
  let mut canvas = RgbImage::new(width.max(1), height.max(1));
  for graphic in &snapshot.graphics {
    draw_graphic(&mut canvas, graphic);
  }
  canvas
}

/// 绘制边界框，并在框上方画一条长度与置信度成比例的色条
pub fn draw_graphic(image: &mut RgbImage, graphic: &ObjectGraphic) {
  let (w, h) = (image.width() as f32, image.height() as f32);
  let bbox = &graphic.object.bounding_box;

  let x_min = bbox.left.floor().clamp(0.0, w - 1.0) as i32;
  let y_min = bbox.top.floor().clamp(0.0, h - 1.0) as i32;
  let x_max = bbox.right.ceil().clamp(0.0, w - 1.0) as i32;
  let y_max = bbox.bottom.ceil().clamp(0.0, h - 1.0) as i32;

  if x_min >= x_max || y_min >= y_max {
    return;
  }

  let color = Rgb(graphic.color);
  let box_width = (x_max - x_min) as u32;
  let box_height = (y_max - y_min) as u32;
  draw_hollow_rect_mut(image, Rect::at(x_min, y_min).of_size(box_width, box_height), color);

  // 第二层边框加粗
  if box_width > 2 && box_height > 2 {
    let inner = Rect::at(x_min + 1, y_min + 1).of_size(box_width - 2, box_height - 2);
    draw_hollow_rect_mut(image, inner, color);
  }

  let confidence = graphic
    .object
    .top_label()
    .map(|label| label.confidence)
    .unwrap_or(0.0);
  let bar_width = (box_width as f32 * confidence).round() as u32;
  if bar_width == 0 {
    return;
  }
  let bar_y = (y_min - CONFIDENCE_BAR_HEIGHT as i32).max(0);
  draw_filled_rect_mut(
    image,
    Rect::at(x_min, bar_y).of_size(bar_width, CONFIDENCE_BAR_HEIGHT),
    color,
  );
}
