// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};

use crate::model::{
  DEFAULT_CONFIDENCE_THRESHOLD, DetectItem, DetectResult, PixelBox, WithLabel,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 255, 0]; // 绿色

pub struct Draw<'a> {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: FontRef<'a>,
  label_color: [u8; 3],
  score_threshold: f32,
}

impl<'a> Default for Draw<'a> {
  fn default() -> Self {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf"); // default font
    let font = FontRef::try_from_slice(font_data).expect("无法加载嵌入的字体文件");

    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      label_color: LABEL_COLOR,
      score_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      font,
    }
  }
}

impl<'a> Draw<'a> {
  pub fn with_score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  // 在图像上绘制一个矩形边框与标签，bbox 为原图像素坐标
  fn draw_bbox_with_label<T: WithLabel>(
    &self,
    image: &mut RgbImage,
    bbox: &PixelBox,
    kind: &T,
    score: f32,
    color: [u8; 3],
    font: &FontRef,
  ) {
    let (w, h) = (image.width() as i32, image.height() as i32);

    // Clamp to image bounds
    let x_min = bbox.x_min.clamp(0, w - 1);
    let y_min = bbox.y_min.clamp(0, h - 1);
    let x_max = bbox.x_max.clamp(0, w - 1);
    let y_max = bbox.y_max.clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（加粗为2像素）
    for thickness in 0..2 {
      let x_min_t = (x_min + thickness).min(w - 1);
      let y_min_t = (y_min + thickness).min(h - 1);
      let x_max_t = (x_max - thickness).max(0);
      let y_max_t = (y_max - thickness).max(0);

      // Top and bottom edges
      for x in x_min_t..=x_max_t {
        let top = image.get_pixel_mut(x as u32, y_min_t as u32);
        *top = Rgb(color);
        let bottom = image.get_pixel_mut(x as u32, y_max_t as u32);
        *bottom = Rgb(color);
      }

      // Left and right edges
      for y in y_min_t..=y_max_t {
        let left = image.get_pixel_mut(x_min_t as u32, y as u32);
        *left = Rgb(color);
        let right = image.get_pixel_mut(x_max_t as u32, y as u32);
        *right = Rgb(color);
      }
    }

    // 标签文本置于边框左上角上方
    let label = format!("{}: {:.2}", kind.to_label_str(), score);

    let scale = PxScale::from(self.font_size);
    let text_color = Rgb([255u8, 255u8, 255u8]); // 白色文本

    // 估算文本大小（粗略估计）
    let text_width = (label.len() as f32 * self.label_char_width) as i32;
    let text_height = self.label_text_height;

    let label_x = x_min.max(0);
    let label_y = (y_min - text_height).max(0);

    // 确保标签不超出图像边界
    let max_width = (w - label_x).max(0);
    let label_width = text_width.min(max_width) as u32;
    let label_height = text_height.min(h - label_y) as u32;

    // 仅在标签有空间时绘制
    if label_width > 0 && label_height > 0 {
      let rect = imageproc::rect::Rect::at(label_x, label_y).of_size(label_width, label_height);
      draw_filled_rect_mut(image, rect, Rgb(color));

      draw_text_mut(
        image,
        text_color,
        label_x,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        &label,
      );
    }
  }
}

pub trait DrawDetectionOnImage<T: WithLabel> {
  fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult<T>);
}

impl<T: WithLabel> DrawDetectionOnImage<T> for Draw<'_> {
  fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult<T>) {
    // 绘制得分超过阈值的检测框和标签
    for DetectItem { kind, score, bbox } in result.items.iter() {
      if !(*score > self.score_threshold) {
        continue;
      }
      self.draw_bbox_with_label(image, bbox, kind, *score, self.label_color, &self.font);
    }
  }
}
