// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/simple_oneshot.rs - 单次图像推理程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use qianli::{
  FromUrl,
  input::ImageFileInput,
  model::{ClassId, DEFAULT_CONFIDENCE_THRESHOLD, Yolov5Builder},
  output::SaveImageFileOutput,
  task::{OneShotTask, Task},
};
use tracing::info;

/// Qianli 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// TFLite 模型文件路径 (yolov5:///path/to/model.tflite)
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像 (image:///path/to/input.jpg)
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出图像 (image:///path/to/output.png)
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 模型输入宽度
  #[arg(long, default_value = "640", value_name = "WIDTH")]
  pub width: u32,
  /// 模型输入高度
  #[arg(long, default_value = "640", value_name = "HEIGHT")]
  pub height: u32,
  /// 置信度阈值 (0.0 - 1.0)，解码与渲染共用
  #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD, value_name = "THRESHOLD")]
  pub confidence: f32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入图像: {}", args.input);
  info!("输出图像: {}", args.output);
  info!("模型输入尺寸: {}x{}", args.width, args.height);
  info!("置信度阈值: {}", args.confidence);

  let input = ImageFileInput::from_url(&args.input)?;
  let model = Yolov5Builder::from_url(&args.model)?
    .input_size(args.width, args.height)
    .confidence_threshold(args.confidence)
    .build::<ClassId>()?;
  let output = SaveImageFileOutput::from_url(&args.output)?.with_score_threshold(args.confidence);

  OneShotTask.run_task(input.into_frames(args.width, args.height), model, output)?;

  info!("任务完成");

  Ok(())
}
