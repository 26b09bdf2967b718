// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像文件
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

use std::path::Path;

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Rgb32fNhwcFrame,
  model::{DetectResult, WithLabel},
  output::{
    Render,
    draw::{Draw, DrawDetectionOnImage},
  },
};

/// 将标注后的原图写入文件的输出端
pub struct SaveImageFileOutput<'a> {
  path: String,
  draw: Draw<'a>,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl<'a> FromUrlWithScheme for SaveImageFileOutput<'a> {
  const SCHEME: &'static str = "image";
}

impl<'a> FromUrl for SaveImageFileOutput<'a> {
  type Error = SaveImageFileError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: url.path().to_string(),
      draw: Draw::default(),
    })
  }
}

impl<'a> SaveImageFileOutput<'a> {
  pub fn with_score_threshold(mut self, threshold: f32) -> Self {
    self.draw = self.draw.with_score_threshold(threshold);
    self
  }

  fn save_image(&self, image: image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = Path::new(&self.path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveImageFileError::IoError)?;
    }

    image
      .save(&self.path)
      .map_err(SaveImageFileError::ImageError)?;

    warn!("保存图像到文件: {}", self.path);

    Ok(())
  }
}

impl<'a, T: WithLabel> Render<Rgb32fNhwcFrame, DetectResult<T>> for SaveImageFileOutput<'a> {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &Rgb32fNhwcFrame,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    // 在原始分辨率图像的副本上绘制
    let mut image = frame.original().clone();
    self.draw.draw_detections_on_image(&mut image, result);
    self.save_image(image)
  }
}
