// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 归一化 NHWC 帧定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{RgbImage, imageops};

use crate::input::AsNhwcTensor;

const RGB_CHANNELS: usize = 3;
const PIXEL_SCALE: f32 = 255.0;

/// 预处理后的模型输入帧。
///
/// 张量为含 batch 轴的 [1, H, W, 3] NHWC 布局，f32 取值范围 [0, 1]；
/// 同时保留原始分辨率的图像，供渲染阶段使用。
#[derive(Debug, Clone)]
pub struct Rgb32fNhwcFrame {
  tensor: Box<[f32]>,
  width: u32,
  height: u32,
  original: RgbImage,
}

impl Rgb32fNhwcFrame {
  /// 由解码后的图像构造输入帧。
  ///
  /// 图像被直接拉伸到 width x height（不保持宽高比），
  /// 逐像素除以 255 后按 NHWC 排列。
  pub fn from_image(image: RgbImage, width: u32, height: u32) -> Self {
    let resized = imageops::resize(&image, width, height, imageops::FilterType::Triangle);

    let tensor: Vec<f32> = resized
      .into_raw()
      .into_iter()
      .map(|v| v as f32 / PIXEL_SCALE)
      .collect();

    Self {
      tensor: tensor.into_boxed_slice(),
      width,
      height,
      original: image,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 原始分辨率图像
  pub fn original(&self) -> &RgbImage {
    &self.original
  }

  pub fn original_width(&self) -> u32 {
    self.original.width()
  }

  pub fn original_height(&self) -> u32 {
    self.original.height()
  }
}

impl AsNhwcTensor for Rgb32fNhwcFrame {
  fn as_nhwc(&self) -> &[f32] {
    &self.tensor
  }
}
