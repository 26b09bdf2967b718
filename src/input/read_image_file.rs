// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Rgb32fNhwcFrame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageLoadError(image::ImageError),
}

impl From<std::io::Error> for ImageFileInputError {
  fn from(err: std::io::Error) -> Self {
    ImageFileInputError::IoError(err)
  }
}

impl From<image::ImageError> for ImageFileInputError {
  fn from(err: image::ImageError) -> Self {
    ImageFileInputError::ImageLoadError(err)
  }
}

/// 单张图像文件输入源。
///
/// 构造时立即完成解码，坏路径或坏文件在任何后续阶段执行前报错。
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(
        url.scheme().to_string(),
      ));
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    debug!(
      "图像文件解码完成: {} ({}x{})",
      path,
      image.width(),
      image.height()
    );

    Ok(ImageFileInput { image: Some(image) })
  }
}

impl ImageFileInput {
  /// 转为按模型输入尺寸预处理的单帧迭代器
  pub fn into_frames(self, width: u32, height: u32) -> ImageFileFrames {
    ImageFileFrames {
      image: self.image,
      width,
      height,
    }
  }
}

pub struct ImageFileFrames {
  image: Option<RgbImage>,
  width: u32,
  height: u32,
}

impl Iterator for ImageFileFrames {
  type Item = Rgb32fNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let (width, height) = (self.width, self.height);
    self
      .image
      .take()
      .map(|image| Rgb32fNhwcFrame::from_image(image, width, height))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  fn temp_png(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("qianli-input-{}.png", name));
    let image = RgbImage::from_pixel(6, 4, image::Rgb([10, 20, 30]));
    image.save(&path).expect("写入测试图像失败");
    path
  }

  #[test]
  fn decodes_one_frame_then_stops() {
    let path = temp_png("one-frame");
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();

    let input = ImageFileInput::from_url(&url).unwrap();
    let mut frames = input.into_frames(4, 4);

    let frame = frames.next().expect("应产出一帧");
    assert_eq!(frame.width(), 4);
    assert_eq!(frame.height(), 4);
    assert_eq!(frame.original_width(), 6);
    assert_eq!(frame.original_height(), 4);
    assert!(frames.next().is_none());

    let _ = std::fs::remove_file(path);
  }

  #[test]
  fn rejects_wrong_scheme() {
    let url = Url::parse("file:///tmp/whatever.png").unwrap();
    match ImageFileInput::from_url(&url) {
      Err(ImageFileInputError::SchemeMismatch(scheme)) => assert_eq!(scheme, "file"),
      other => panic!("期望方案不匹配错误, 实际: {:?}", other.err()),
    }
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let url = Url::parse("image:///no/such/dir/qianli-missing.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }

  #[test]
  fn garbage_file_is_a_decode_error() {
    let path = std::env::temp_dir().join("qianli-input-garbage.png");
    std::fs::write(&path, b"definitely not a png").unwrap();
    let url = Url::parse(&format!("image://{}", path.display())).unwrap();

    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::ImageLoadError(_))
    ));

    let _ = std::fs::remove_file(path);
  }
}
