// 该文件是 Xunjian （巡检） 项目的一部分。
// src/config.rs - 任务配置读取与校验
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

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::input::ImageRef;
use crate::model::InferParams;

pub const DEFAULT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_IOU: f32 = 0.45;
pub const DEFAULT_IMGSZ: u32 = 640;
pub const DEFAULT_EPOCHS: u32 = 100;
pub const DEFAULT_BATCH: i32 = 16;
pub const DEFAULT_RUN_NAME: &str = "rust_detection";
pub const DEFAULT_PROJECT: &str = "./peso";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置不是合法的 JSON: {0}")]
  Parse(#[source] serde_json::Error),
  #[error("未指定模型 (model)")]
  MissingModel,
  #[error("未指定图像 (images)")]
  MissingImages,
  #[error("未指定数据集 YAML (data)")]
  MissingData,
  #[error("配置字段无效: {0}")]
  Invalid(#[source] serde_json::Error),
}

/// 读取唯一的 JSON 配置文档
///
/// 提供了命令行参数时直接解析该参数，否则读取标准输入直到结束。
pub fn read_config(arg: Option<&str>) -> Result<Value, ConfigError> {
  read_config_from(arg, std::io::stdin().lock())
}

pub fn read_config_from<R: Read>(arg: Option<&str>, mut reader: R) -> Result<Value, ConfigError> {
  let text = match arg {
    Some(text) => text.to_string(),
    None => {
      let mut text = String::new();
      reader.read_to_string(&mut text)?;
      text
    }
  };
  debug!("配置文本长度: {} 字节", text.len());
  serde_json::from_str(&text).map_err(ConfigError::Parse)
}

/// 检测任务配置
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
  pub model: PathBuf,
  pub images: Vec<ImageRef>,
  #[serde(default = "default_confidence")]
  pub confidence: f32,
  #[serde(default = "default_iou")]
  pub iou: f32,
  #[serde(default = "default_imgsz")]
  pub imgsz: u32,
}

impl JobConfig {
  /// 必填字段先于类型检查校验，缺失模型总是报告为缺失模型
  pub fn from_value(value: Value) -> Result<Self, ConfigError> {
    if !is_present(value.get("model")) {
      return Err(ConfigError::MissingModel);
    }
    if !is_present(value.get("images")) {
      return Err(ConfigError::MissingImages);
    }
    serde_json::from_value(value).map_err(ConfigError::Invalid)
  }

  pub fn infer_params(&self) -> InferParams {
    InferParams {
      confidence: self.confidence,
      iou: self.iou,
      imgsz: self.imgsz,
    }
  }
}

/// 训练批大小：整数为每批图像数（-1 为自动），0 到 1 之间的小数为显存占用比例
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BatchSize {
  Images(i32),
  Fraction(f64),
}

impl fmt::Display for BatchSize {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BatchSize::Images(n) => write!(f, "{}", n),
      BatchSize::Fraction(x) => write!(f, "{}", x),
    }
  }
}

/// 训练任务配置
#[derive(Debug, Clone, Deserialize)]
pub struct TrainJobConfig {
  pub model: PathBuf,
  pub data: PathBuf,
  #[serde(default = "default_epochs")]
  pub epochs: u32,
  #[serde(default = "default_imgsz")]
  pub imgsz: u32,
  #[serde(default = "default_batch")]
  pub batch: BatchSize,
  #[serde(default = "default_run_name")]
  pub name: String,
  #[serde(default = "default_project")]
  pub project: String,
}

impl TrainJobConfig {
  pub fn from_value(value: Value) -> Result<Self, ConfigError> {
    if !is_present(value.get("model")) {
      return Err(ConfigError::MissingModel);
    }
    if !is_present(value.get("data")) {
      return Err(ConfigError::MissingData);
    }
    serde_json::from_value(value).map_err(ConfigError::Invalid)
  }

  /// 权重输出目录，即 `{project}/{name}`
  pub fn output_path(&self) -> String {
    format!("{}/{}", self.project, self.name)
  }
}

// null、空字符串、空数组、空对象、false 与 0 都视为未提供
fn is_present(value: Option<&Value>) -> bool {
  match value {
    None | Some(Value::Null) => false,
    Some(Value::Bool(b)) => *b,
    Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
    Some(Value::String(s)) => !s.is_empty(),
    Some(Value::Array(a)) => !a.is_empty(),
    Some(Value::Object(o)) => !o.is_empty(),
  }
}

fn default_confidence() -> f32 {
  DEFAULT_CONFIDENCE
}

fn default_iou() -> f32 {
  DEFAULT_IOU
}

fn default_imgsz() -> u32 {
  DEFAULT_IMGSZ
}

fn default_epochs() -> u32 {
  DEFAULT_EPOCHS
}

fn default_batch() -> BatchSize {
  BatchSize::Images(DEFAULT_BATCH)
}

fn default_run_name() -> String {
  DEFAULT_RUN_NAME.to_string()
}

fn default_project() -> String {
  DEFAULT_PROJECT.to_string()
}
