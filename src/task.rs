// 该文件是 Xunjian （巡检） 项目的一部分。
// src/task.rs - 检测与训练任务
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

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{ConfigError, JobConfig, TrainJobConfig},
  detection::{Detection, normalize},
  input::{self, ImageError, ImageRef},
  model::{ClassNames, InferParams, Model},
  output::{InferenceSummary, TrainSummary},
  train::{TrainParams, Trainer},
};

const RULE_WIDTH: usize = 60;

/// 使整个任务失败的错误
#[derive(Error, Debug)]
pub enum JobError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("找不到模型文件: {}", .0.display())]
  ModelNotFound(PathBuf),
  #[error("找不到数据集文件: {}", .0.display())]
  DatasetNotFound(PathBuf),
  #[error("{0:#}")]
  Unexpected(anyhow::Error),
}

impl JobError {
  pub fn unexpected<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    JobError::Unexpected(anyhow::Error::new(err))
  }
}

/// 只影响单张图像的错误，记录后跳过该图像
#[derive(Error, Debug)]
pub enum ImageFailure {
  #[error(transparent)]
  Input(#[from] ImageError),
  #[error("推理失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 单张图像的处理结果
#[derive(Debug)]
pub struct ImageOutcome {
  pub index: usize,
  pub result: Result<Vec<Detection>, ImageFailure>,
}

pub trait Task<M>: Sized {
  type Output;
  type Error;
  fn run_task(self, backend: M) -> Result<Self::Output, Self::Error>;
}

/// 批量检测任务，构造成功即表示校验阶段已通过
#[derive(Debug, Clone)]
pub struct InferenceTask {
  config: JobConfig,
}

impl InferenceTask {
  pub fn from_value(value: Value) -> Result<Self, JobError> {
    Self::new(JobConfig::from_value(value)?)
  }

  pub fn new(config: JobConfig) -> Result<Self, JobError> {
    ensure_exists(&config.model, JobError::ModelNotFound)?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &JobConfig {
    &self.config
  }

  fn print_banner(&self) {
    let params = self.config.infer_params();
    println!("开始 YOLO 检测");
    println!("模型: {}", self.config.model.display());
    println!("图像数量: {}", self.config.images.len());
    println!(
      "置信度: {}, IoU: {}, 图像尺寸: {}",
      params.confidence, params.iou, params.imgsz
    );
    println!("{}", "-".repeat(RULE_WIDTH));
  }
}

impl<M> Task<&mut M> for InferenceTask
where
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = InferenceSummary;
  type Error = JobError;

  fn run_task(self, model: &mut M) -> Result<Self::Output, Self::Error> {
    self.print_banner();

    let params = self.config.infer_params();
    let class_names = model.class_names().clone();
    let total = self.config.images.len();

    let outcomes: Vec<ImageOutcome> = self
      .config
      .images
      .iter()
      .enumerate()
      .map(|(index, image)| ImageOutcome {
        index,
        result: detect_image(index, total, image, &mut *model, &params, &class_names),
      })
      .collect();

    let (detections, failed) =
      outcomes
        .into_iter()
        .fold((Vec::new(), 0usize), |(mut detections, failed), outcome| {
          match outcome.result {
            Ok(found) => {
              detections.extend(found);
              (detections, failed)
            }
            Err(err) => {
              debug!("第 {} 张图像已跳过: {}", outcome.index + 1, err);
              (detections, failed + 1)
            }
          }
        });

    println!();
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("检测完成: 共检测到 {} 个目标", detections.len());
    println!("{}", "=".repeat(RULE_WIDTH));
    info!(
      "检测完成: 图像 {} 张，失败 {} 张，目标 {} 个",
      total,
      failed,
      detections.len()
    );

    Ok(InferenceSummary {
      total_images: total,
      total_detections: detections.len(),
      detections,
      class_names,
    })
  }
}

fn detect_image<M>(
  index: usize,
  total: usize,
  image: &ImageRef,
  model: &mut M,
  params: &InferParams,
  class_names: &ClassNames,
) -> Result<Vec<Detection>, ImageFailure>
where
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  let result = resolve_and_infer(index, total, image, model, params, class_names);
  if let Err(err) = &result {
    println!("  处理第 {} 张图像时出错: {}", index + 1, err);
    warn!("第 {} 张图像处理失败: {:?}", index + 1, err);
  }
  result
}

fn resolve_and_infer<M>(
  index: usize,
  total: usize,
  image: &ImageRef,
  model: &mut M,
  params: &InferParams,
  class_names: &ClassNames,
) -> Result<Vec<Detection>, ImageFailure>
where
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
{
  let resolved = input::resolve(index, image)?;
  let inline = resolved.source.is_inline();
  let input = resolved.source.load()?;
  println!(
    "处理图像 {}/{}: {}{}",
    index + 1,
    total,
    resolved.filename,
    if inline { " (base64)" } else { "" }
  );

  let result = model
    .infer(&input, params)
    .map_err(|e| ImageFailure::Inference(Box::new(e)))?;

  if result.is_empty() {
    println!("  未发现目标");
  }

  let detections: Vec<Detection> = result
    .items
    .iter()
    .map(|item| normalize(item, &resolved.filename, class_names))
    .collect();
  for det in &detections {
    println!(
      "  检测到: {} ({}) - 置信度: {:.2}%",
      det.class_name,
      det.severity,
      det.confidence * 100.0
    );
  }

  Ok(detections)
}

/// 单次训练任务，构造成功即表示模型与数据集均存在
#[derive(Debug, Clone)]
pub struct TrainTask {
  config: TrainJobConfig,
  params: TrainParams,
}

impl TrainTask {
  pub fn from_value(value: Value) -> Result<Self, JobError> {
    Self::new(TrainJobConfig::from_value(value)?)
  }

  pub fn new(config: TrainJobConfig) -> Result<Self, JobError> {
    ensure_exists(&config.model, JobError::ModelNotFound)?;
    ensure_exists(&config.data, JobError::DatasetNotFound)?;
    Ok(Self {
      config,
      params: TrainParams::default(),
    })
  }

  pub fn config(&self) -> &TrainJobConfig {
    &self.config
  }

  pub fn params(&self) -> &TrainParams {
    &self.params
  }
}

impl<T> Task<&T> for TrainTask
where
  T: Trainer,
  T::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = TrainSummary;
  type Error = JobError;

  fn run_task(self, trainer: &T) -> Result<Self::Output, Self::Error> {
    let output_path = self.config.output_path();

    println!("开始 YOLO 训练");
    println!("模型: {}", self.config.model.display());
    println!("数据集: {}", self.config.data.display());
    println!(
      "轮数: {}, 批大小: {}, 图像尺寸: {}",
      self.config.epochs, self.config.batch, self.config.imgsz
    );
    println!("结果目录: {}", output_path);
    println!("{}", "-".repeat(RULE_WIDTH));

    // 只尝试一次，失败即整体失败
    trainer
      .train(&self.config, &self.params)
      .map_err(JobError::unexpected)?;

    println!();
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("训练完成");
    println!("权重保存在: {}", output_path);
    println!("{}", "=".repeat(RULE_WIDTH));

    Ok(TrainSummary {
      message: "训练完成".to_string(),
      output_path,
    })
  }
}

fn ensure_exists(path: &Path, err: fn(PathBuf) -> JobError) -> Result<(), JobError> {
  if path.exists() {
    Ok(())
  } else {
    Err(err(path.to_path_buf()))
  }
}

/// 完整的检测流程：校验配置，加载模型，逐张推理
///
/// 校验失败时不会调用 `load_model`；加载时可以参考推理参数（如导出模型所需的输入尺寸）。
pub fn run_inference<M, F, E>(value: Value, load_model: F) -> Result<InferenceSummary, JobError>
where
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
  F: FnOnce(&Path, &InferParams) -> Result<M, E>,
  E: std::error::Error + Send + Sync + 'static,
{
  let task = InferenceTask::from_value(value)?;
  let params = task.config().infer_params();
  let mut model = load_model(&task.config().model, &params).map_err(JobError::unexpected)?;
  task.run_task(&mut model)
}

/// 完整的训练流程：校验配置与路径后调用一次训练后端
pub fn run_training<T>(value: Value, trainer: &T) -> Result<TrainSummary, JobError>
where
  T: Trainer,
  T::Error: std::error::Error + Send + Sync + 'static,
{
  TrainTask::from_value(value)?.run_task(trainer)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn missing_model_file_is_not_found() {
    let err = InferenceTask::from_value(json!({
      "model": "/definitely/not/here/m.pt",
      "images": ["/no/such.jpg"]
    }))
    .unwrap_err();
    assert!(matches!(err, JobError::ModelNotFound(_)));
    assert!(err.to_string().contains("m.pt"));
  }

  #[test]
  fn config_error_message_is_transparent() {
    let err = InferenceTask::from_value(json!({"images": ["a.jpg"]})).unwrap_err();
    assert_eq!(err.to_string(), ConfigError::MissingModel.to_string());
  }

  #[test]
  fn unexpected_error_renders_chain() {
    let io = std::io::Error::other("磁盘已满");
    let err = JobError::unexpected(io);
    assert!(err.to_string().contains("磁盘已满"));
  }
}
