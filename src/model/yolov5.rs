// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 模型定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tflite::ops::builtin::BuiltinOpResolver;
use tflite::{FlatBufferModel, Interpreter, InterpreterBuilder};
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl,
  frame::Rgb32fNhwcFrame,
  input::AsNhwcTensor,
  model::{DEFAULT_CONFIDENCE_THRESHOLD, DetectItem, DetectResult, Model, PixelBox, WithLabel},
};

const YOLOV5_NUM_INPUTS: usize = 1;
const YOLOV5_DEFAULT_INPUT_W: u32 = 640;
const YOLOV5_DEFAULT_INPUT_H: u32 = 640;

// 每条检测的属性排布: [x_center, y_center, w, h, objectness, class_0..class_{K-1}]
const OBJECTNESS_OFFSET: usize = 4;
const CLASS_SCORE_OFFSET: usize = 5;

pub struct Yolov5<'a, T> {
  interpreter: Interpreter<'a, BuiltinOpResolver>,
  input_width: u32,
  input_height: u32,
  confidence_threshold: f32,
  _label: std::marker::PhantomData<T>,
}

#[derive(Error, Debug)]
pub enum Yolov5Error {
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("输入形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch { expected: String, actual: String },
  #[error("解释器错误: {0}")]
  Interpreter(String),
  #[error("输出解码错误: {0}")]
  Decode(String),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
}

pub struct Yolov5Builder {
  model_path: String,
  input_width: u32,
  input_height: u32,
  confidence_threshold: f32,
}

const YOLOV5_SCHEME: &str = "yolov5";

impl FromUrl for Yolov5Builder {
  type Error = Yolov5Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != YOLOV5_SCHEME {
      return Err(Yolov5Error::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        YOLOV5_SCHEME
      )));
    }

    Ok(Yolov5Builder {
      model_path: url.path().to_string(),
      input_width: YOLOV5_DEFAULT_INPUT_W,
      input_height: YOLOV5_DEFAULT_INPUT_H,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
    })
  }
}

impl Yolov5Builder {
  pub fn input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn build<'a, T: WithLabel>(self) -> Result<Yolov5<'a, T>, Yolov5Error> {
    info!("加载模型文件: {}", self.model_path);
    let model = FlatBufferModel::build_from_file(&self.model_path)
      .map_err(|e| Yolov5Error::ModelLoad(format!("{}: {}", self.model_path, e)))?;

    info!("创建 TFLite 解释器");
    let resolver = BuiltinOpResolver::default();
    let builder = InterpreterBuilder::new(model, resolver)
      .map_err(|e| Yolov5Error::ModelInvalid(format!("无法创建解释器: {}", e)))?;
    let mut interpreter = builder
      .build()
      .map_err(|e| Yolov5Error::ModelInvalid(format!("无法构建解释器: {}", e)))?;
    interpreter
      .allocate_tensors()
      .map_err(|e| Yolov5Error::ModelInvalid(format!("无法分配张量: {}", e)))?;

    let num_inputs = interpreter.inputs().len();
    if num_inputs != YOLOV5_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLOV5_NUM_INPUTS, num_inputs
      );
      return Err(Yolov5Error::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLOV5_NUM_INPUTS, num_inputs
      )));
    }

    let num_outputs = interpreter.outputs().len();
    if num_outputs == 0 {
      error!("模型没有输出张量");
      return Err(Yolov5Error::ModelInvalid("模型没有输出张量".to_string()));
    }

    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    // 模型声明的输入形状必须与配置一致: [1, H, W, 3]
    let input_details = interpreter
      .get_input_details()
      .map_err(|e| Yolov5Error::Interpreter(e.to_string()))?;
    let dims = &input_details[0].dims;
    let matches = dims.len() == 4
      && dims[0] as usize == 1
      && dims[1] as usize == self.input_height as usize
      && dims[2] as usize == self.input_width as usize
      && dims[3] as usize == 3;
    if !matches {
      error!(
        "输入形状不匹配: 期望 [1, {}, {}, 3], 实际 {:?}",
        self.input_height, self.input_width, dims
      );
      return Err(Yolov5Error::ShapeMismatch {
        expected: format!("[1, {}, {}, 3]", self.input_height, self.input_width),
        actual: format!("{:?}", dims),
      });
    }

    debug!("模型声明的输入形状: {:?}", dims);
    info!(
      "模型加载完成, 输入尺寸 {}x{}",
      self.input_width, self.input_height
    );

    Ok(Yolov5 {
      interpreter,
      input_width: self.input_width,
      input_height: self.input_height,
      confidence_threshold: self.confidence_threshold,
      _label: std::marker::PhantomData,
    })
  }
}

impl<'a, T: WithLabel> Model for Yolov5<'a, T> {
  type Input = Rgb32fNhwcFrame;
  type Output = DetectResult<T>;
  type Error = Yolov5Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    if input.width() != self.input_width || input.height() != self.input_height {
      return Err(Yolov5Error::ShapeMismatch {
        expected: format!("{}x{}", self.input_width, self.input_height),
        actual: format!("{}x{}", input.width(), input.height()),
      });
    }

    debug!("设置模型输入");
    let inputs = self.interpreter.inputs().to_vec();
    let data = input.as_nhwc();
    {
      let tensor: &mut [f32] = self
        .interpreter
        .tensor_data_mut(inputs[0])
        .map_err(|e| Yolov5Error::Interpreter(e.to_string()))?;
      if tensor.len() != data.len() {
        return Err(Yolov5Error::ShapeMismatch {
          expected: format!("{} 个 f32", tensor.len()),
          actual: format!("{} 个 f32", data.len()),
        });
      }
      tensor.copy_from_slice(data);
    }

    debug!("执行模型推理");
    self
      .interpreter
      .invoke()
      .map_err(|e| Yolov5Error::Interpreter(e.to_string()))?;

    debug!("获取模型输出");
    let outputs = self.interpreter.outputs().to_vec();
    let output_details = self
      .interpreter
      .get_output_details()
      .map_err(|e| Yolov5Error::Interpreter(e.to_string()))?;
    let dims = &output_details[0].dims;
    if dims.len() != 3 || dims[0] as usize != 1 {
      return Err(Yolov5Error::Decode(format!(
        "预期输出形状为 [1, 属性数, 检测数], 实际 {:?}",
        dims
      )));
    }
    let num_attrs = dims[1] as usize;
    let num_detections = dims[2] as usize;

    let raw: &[f32] = self
      .interpreter
      .tensor_data(outputs[0])
      .map_err(|e| Yolov5Error::Interpreter(e.to_string()))?;

    decode_raw_output(
      raw,
      num_attrs,
      num_detections,
      input.original_width(),
      input.original_height(),
      self.confidence_threshold,
    )
  }
}

/// 解码 YOLO 原始输出张量。
///
/// 张量按属性主序排布：检测 i 的属性 a 位于 data[a * num_detections + i]。
/// 仅当 objectness 大于阈值时产出一条检测；得分取各类别分数的最大值本身，
/// 不与 objectness 相乘。边界框换算到原图像素坐标并整数截断。
/// 不做非极大值抑制，重叠的检测框原样输出。
pub fn decode_raw_output<T: WithLabel>(
  data: &[f32],
  num_attrs: usize,
  num_detections: usize,
  img_width: u32,
  img_height: u32,
  confidence_threshold: f32,
) -> Result<DetectResult<T>, Yolov5Error> {
  if num_attrs < CLASS_SCORE_OFFSET + 1 {
    return Err(Yolov5Error::Decode(format!(
      "每条检测至少需要 {} 个属性, 实际 {}",
      CLASS_SCORE_OFFSET + 1,
      num_attrs
    )));
  }
  if data.len() < num_attrs * num_detections {
    return Err(Yolov5Error::Decode(format!(
      "输出张量长度不足: 期望至少 {}, 实际 {}",
      num_attrs * num_detections,
      data.len()
    )));
  }

  let num_classes = num_attrs - CLASS_SCORE_OFFSET;
  let img_w = img_width as f32;
  let img_h = img_height as f32;

  let mut items = Vec::new();

  for i in 0..num_detections {
    let attr = |a: usize| data[a * num_detections + i];

    // objectness 不大于阈值（含 NaN）的行不产出检测
    let objectness = attr(OBJECTNESS_OFFSET);
    if !(objectness > confidence_threshold) {
      continue;
    }

    let x_center = attr(0);
    let y_center = attr(1);
    let w = attr(2);
    let h = attr(3);

    let x_min = ((x_center - w / 2.0) * img_w) as i32;
    let y_min = ((y_center - h / 2.0) * img_h) as i32;
    let x_max = ((x_center + w / 2.0) * img_w) as i32;
    let y_max = ((y_center + h / 2.0) * img_h) as i32;

    let (score, class_id) = {
      let mut best_score = f32::MIN;
      let mut best_class = 0usize;
      for c in 0..num_classes {
        let s = attr(CLASS_SCORE_OFFSET + c);
        if s > best_score {
          best_score = s;
          best_class = c;
        }
      }
      (best_score, best_class as u32)
    };

    items.push(DetectItem {
      kind: T::from_label_id(class_id),
      score,
      bbox: PixelBox {
        y_min,
        x_min,
        y_max,
        x_max,
      },
    });
  }

  debug!("检测到 {} 个物体", items.len());
  debug!("检测结果: {:?}", items);

  Ok(DetectResult {
    items: items.into_boxed_slice(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ClassId;

  // 将行主序的检测行转置为属性主序的张量数据
  fn tensor_from_rows(rows: &[Vec<f32>]) -> (Vec<f32>, usize, usize) {
    let num_detections = rows.len();
    let num_attrs = rows.first().map(|row| row.len()).unwrap_or(0);
    let mut data = vec![0.0; num_attrs * num_detections];
    for (i, row) in rows.iter().enumerate() {
      assert_eq!(row.len(), num_attrs);
      for (a, &value) in row.iter().enumerate() {
        data[a * num_detections + i] = value;
      }
    }
    (data, num_attrs, num_detections)
  }

  fn decode(
    rows: &[Vec<f32>],
    img_width: u32,
    img_height: u32,
    threshold: f32,
  ) -> DetectResult<ClassId> {
    let (data, num_attrs, num_detections) = tensor_from_rows(rows);
    decode_raw_output(&data, num_attrs, num_detections, img_width, img_height, threshold).unwrap()
  }

  #[test]
  fn threshold_gates_on_objectness() {
    let rows = vec![
      vec![0.5, 0.5, 0.2, 0.2, 0.005, 0.9],
      vec![0.5, 0.5, 0.2, 0.2, 0.011, 0.9],
      vec![0.5, 0.5, 0.2, 0.2, 0.01, 0.9],
    ];
    let result = decode(&rows, 100, 100, 0.01);
    // 只有 objectness 严格大于阈值的行产出检测, 等于阈值的不算
    assert_eq!(result.items.len(), 1);
  }

  #[test]
  fn coordinates_truncate_toward_zero() {
    let rows = vec![vec![0.5, 0.5, 0.2, 0.2, 0.9, 1.0]];
    let result = decode(&rows, 100, 100, 0.01);

    let bbox = result.items[0].bbox;
    assert_eq!(bbox.x_min, 40);
    assert_eq!(bbox.x_max, 60);
    assert_eq!(bbox.y_min, 40);
    assert_eq!(bbox.y_max, 60);
  }

  #[test]
  fn argmax_picks_best_class_score() {
    let rows = vec![vec![0.5, 0.5, 0.2, 0.2, 0.3, 0.1, 0.9, 0.3]];
    let result = decode(&rows, 100, 100, 0.01);

    let item = &result.items[0];
    assert_eq!(item.kind.0, 1);
    // 得分是类别分数本身, 不乘 objectness
    assert!((item.score - 0.9).abs() < 1e-6);
  }

  #[test]
  fn overlapping_detections_are_not_suppressed() {
    let rows = vec![
      vec![0.5, 0.5, 0.4, 0.4, 0.9, 0.8],
      vec![0.52, 0.5, 0.4, 0.4, 0.85, 0.7],
    ];
    let result = decode(&rows, 100, 100, 0.01);
    assert_eq!(result.items.len(), 2);
    assert!((result.items[0].score - 0.8).abs() < 1e-6);
    assert!((result.items[1].score - 0.7).abs() < 1e-6);
  }

  #[test]
  fn order_follows_detection_index() {
    let rows = vec![
      vec![0.5, 0.5, 0.2, 0.2, 0.9, 0.2, 0.1],
      vec![0.5, 0.5, 0.2, 0.2, 0.0, 0.9, 0.9],
      vec![0.5, 0.5, 0.2, 0.2, 0.9, 0.1, 0.8],
      vec![0.5, 0.5, 0.2, 0.2, 0.9, 0.5, 0.2],
    ];
    let result = decode(&rows, 100, 100, 0.01);

    let ids: Vec<u32> = result.items.iter().map(|item| item.kind.0).collect();
    let scores: Vec<f32> = result.items.iter().map(|item| item.score).collect();
    assert_eq!(ids, vec![0, 1, 0]);
    assert_eq!(scores, vec![0.2, 0.8, 0.5]);
  }

  #[test]
  fn all_below_threshold_yields_empty_result() {
    let rows = vec![
      vec![0.5, 0.5, 0.2, 0.2, 0.0, 0.9],
      vec![0.5, 0.5, 0.2, 0.2, 0.01, 0.9],
    ];
    let result = decode(&rows, 100, 100, 0.01);
    assert!(result.items.is_empty());
  }

  #[test]
  fn nan_objectness_is_skipped() {
    let rows = vec![vec![0.5, 0.5, 0.2, 0.2, f32::NAN, 0.9]];
    let result = decode(&rows, 100, 100, 0.01);
    assert!(result.items.is_empty());
  }

  #[test]
  fn end_to_end_single_detection() {
    let data = vec![0.5, 0.5, 0.4, 0.4, 0.9, 0.99];
    let result: DetectResult<ClassId> =
      decode_raw_output(&data, 6, 1, 200, 100, 0.01).unwrap();

    assert_eq!(result.items.len(), 1);
    let item = &result.items[0];
    assert_eq!(item.kind.0, 0);
    assert!((item.score - 0.99).abs() < 1e-6);
    assert_eq!(
      item.bbox,
      PixelBox {
        y_min: 30,
        x_min: 60,
        y_max: 70,
        x_max: 140,
      }
    );
  }

  #[test]
  fn too_few_attributes_is_an_error() {
    let data = vec![0.5, 0.5, 0.4, 0.4, 0.9];
    let result = decode_raw_output::<ClassId>(&data, 5, 1, 100, 100, 0.01);
    assert!(matches!(result, Err(Yolov5Error::Decode(_))));
  }

  #[test]
  fn short_tensor_is_an_error() {
    let data = vec![0.5, 0.5, 0.4];
    let result = decode_raw_output::<ClassId>(&data, 6, 1, 100, 100, 0.01);
    assert!(matches!(result, Err(Yolov5Error::Decode(_))));
  }
}
