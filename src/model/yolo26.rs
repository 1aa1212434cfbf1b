// 该文件是 Xunjian （巡检） 项目的一部分。
// src/model/yolo26.rs - RKNN YOLO26 检测后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use image::imageops::{self, FilterType};
use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  FromModelPath, FromModelPathWithExtension,
  input::{ImageError, InputImage},
  model::{
    ClassNames, DetectItem, DetectResult, InferParams, Model, postprocess::non_max_suppression,
  },
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_INPUT_W: u32 = 640;
const YOLO26_INPUT_H: u32 = 640;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] ImageError),
}

impl From<std::io::Error> for Yolo26Error {
  fn from(err: std::io::Error) -> Self {
    Yolo26Error::ModelLoadError(err)
  }
}

impl From<rknpu::Error> for Yolo26Error {
  fn from(err: rknpu::Error) -> Self {
    Yolo26Error::RknnError(err)
  }
}

impl Yolo26Error {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

/// 固定 640x640 NHWC 输入的 YOLO26 模型
///
/// 类别名称读取自模型旁的同名 `.txt` 文件，每行一个类别。
pub struct Yolo26 {
  context: Context,
  names: ClassNames,
}

impl FromModelPathWithExtension for Yolo26 {
  const EXTENSION: &'static str = "rknn";
}

impl FromModelPath for Yolo26 {
  type Error = Yolo26Error;

  fn from_model_path(path: &Path) -> Result<Self, Self::Error> {
    info!("加载模型文件: {}", path.display());
    let mode_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, InitFlags::default())?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      error!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      return Err(Yolo26Error::invalid(
        &format!(
          "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
          YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
        ),
        rknpu::Error::InvalidModel,
      ));
    }

    let names = read_label_file(&path.with_extension("txt"));
    info!("模型加载完成，类别数: {}", names.len());

    Ok(Yolo26 { context, names })
  }
}

fn read_label_file(path: &Path) -> ClassNames {
  match std::fs::read_to_string(path) {
    Ok(text) => text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .enumerate()
      .map(|(id, name)| (id as u32, name.to_string()))
      .collect(),
    Err(e) => {
      warn!("无法读取类别文件 {}: {}", path.display(), e);
      ClassNames::new()
    }
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，分类张量长度须为空间大小的整数倍
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  spatial: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  let reg_expected = 4 * spatial;
  let is_cls = |t: &[f32]| !t.is_empty() && t.len() % spatial == 0;
  if tensor1.len() == reg_expected && is_cls(tensor2) {
    Some((tensor1, tensor2))
  } else if tensor2.len() == reg_expected && is_cls(tensor1) {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl Model for Yolo26 {
  type Error = Yolo26Error;

  fn class_names(&self) -> &ClassNames {
    &self.names
  }

  fn infer(&mut self, input: &InputImage, params: &InferParams) -> Result<DetectResult, Self::Error> {
    if params.imgsz != YOLO26_INPUT_W {
      debug!("RKNN 模型输入尺寸固定为 {}, 忽略 imgsz={}", YOLO26_INPUT_W, params.imgsz);
    }
    let rgb = input.to_rgb()?;
    let (src_w, src_h) = rgb.dimensions();
    let resized = imageops::resize(&*rgb, YOLO26_INPUT_W, YOLO26_INPUT_H, FilterType::Triangle);

    debug!("设置模型输入");
    self.context.set_input(
      0,
      resized.as_raw(),
      rknpu::TensorFormat::NHWC,
      TensorType::UInt8,
    )?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let mut items = Vec::new();

    for (head_idx, (&(map_h, map_w), stride)) in
      YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
    {
      let spatial = map_h * map_w;
      let (tensor1, tensor2) = match (output.get_f32(head_idx * 2), output.get_f32(head_idx * 2 + 1)) {
        (Ok(t1), Ok(t2)) => (t1, t2),
        (Err(e), _) | (_, Err(e)) => {
          error!("获取检测头 {} 的输出失败: {}", head_idx, e);
          continue;
        }
      };

      // RKNN 输出顺序不固定，需要根据张量大小判断哪个是回归，哪个是分类
      let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, spatial) else {
        error!(
          "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}",
          head_idx,
          tensor1.len(),
          tensor2.len()
        );
        continue;
      };
      let class_num = cls.len() / spatial;

      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let (score, class_id) = {
            let mut max_logit = f32::MIN;
            let mut cls_idx = 0usize;
            for c in 0..class_num {
              let logit = cls[c * spatial + idx];
              if logit > max_logit {
                max_logit = logit;
                cls_idx = c;
              }
            }
            (sigmoid(max_logit), cls_idx as u32)
          };

          if score < params.confidence {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;
          let in_w = YOLO26_INPUT_W as f32;
          let in_h = YOLO26_INPUT_H as f32;

          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, in_w);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, in_h);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, in_w);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, in_h);

          items.push(DetectItem {
            class_id,
            score,
            bbox: [
              xmin / in_w * src_w as f32,
              ymin / in_h * src_h as f32,
              xmax / in_w * src_w as f32,
              ymax / in_h * src_h as f32,
            ],
          });
        }
      }
    }

    let items = non_max_suppression(items, params.iou);
    debug!("检测到 {} 个物体", items.len());
    Ok(DetectResult::from(items))
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
