// 该文件是 Xunjian （巡检） 项目的一部分。
// src/output.rs - 任务结果输出
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

use std::io::Write;

use serde::Serialize;

use crate::detection::Detection;
use crate::model::ClassNames;
use crate::task::JobError;

/// 宿主程序以此行分隔进度文本与结果 JSON
pub const RESULT_MARKER: &str = "__RESULT_JSON__";

#[derive(Debug, Clone, Serialize)]
pub struct InferenceSummary {
  pub detections: Vec<Detection>,
  pub total_images: usize,
  pub total_detections: usize,
  pub class_names: ClassNames,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
  pub message: String,
  pub output_path: String,
}

/// `{success: true, ...payload}` 或 `{success: false, error}`
#[derive(Debug, Clone, Serialize)]
pub struct Report<T> {
  pub success: bool,
  #[serde(flatten)]
  pub payload: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

pub type InferenceResult = Report<InferenceSummary>;
pub type TrainResult = Report<TrainSummary>;

impl<T: Serialize> Report<T> {
  pub fn success(payload: T) -> Self {
    Self {
      success: true,
      payload: Some(payload),
      error: None,
    }
  }

  pub fn failure(error: impl ToString) -> Self {
    Self {
      success: false,
      payload: None,
      error: Some(error.to_string()),
    }
  }

  pub fn exit_code(&self) -> i32 {
    if self.success { 0 } else { 1 }
  }

  /// 先输出空行和标记行，再输出单行 JSON
  pub fn emit<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
    writeln!(writer)?;
    writeln!(writer, "{}", RESULT_MARKER)?;
    serde_json::to_writer(&mut writer, self)?;
    writeln!(writer)?;
    writer.flush()
  }
}

impl<T: Serialize> From<Result<T, JobError>> for Report<T> {
  fn from(result: Result<T, JobError>) -> Self {
    match result {
      Ok(payload) => Report::success(payload),
      Err(err) => Report::failure(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{Value, json};

  fn emitted<T: Serialize>(report: &Report<T>) -> (String, Value) {
    let mut buf = Vec::new();
    report.emit(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    let (_, payload) = text.split_once(&format!("{}\n", RESULT_MARKER)).unwrap();
    let value = serde_json::from_str(payload.trim_end()).unwrap();
    (text, value)
  }

  #[test]
  fn success_flattens_payload() {
    let report = TrainResult::success(TrainSummary {
      message: "ok".to_string(),
      output_path: "./peso/rust_detection".to_string(),
    });
    let (text, value) = emitted(&report);
    assert!(text.starts_with("\n__RESULT_JSON__\n"));
    assert_eq!(text.lines().count(), 3);
    assert_eq!(
      value,
      json!({"success": true, "message": "ok", "output_path": "./peso/rust_detection"})
    );
    assert_eq!(report.exit_code(), 0);
  }

  #[test]
  fn failure_carries_only_error() {
    let report = InferenceResult::failure("找不到模型文件: m.pt");
    let (_, value) = emitted(&report);
    assert_eq!(value, json!({"success": false, "error": "找不到模型文件: m.pt"}));
    assert_eq!(report.exit_code(), 1);
  }

  #[test]
  fn class_names_use_string_keys() {
    let report = InferenceResult::success(InferenceSummary {
      detections: Vec::new(),
      total_images: 2,
      total_detections: 0,
      class_names: ClassNames::from([(0, "alto".to_string()), (10, "medio".to_string())]),
    });
    let (_, value) = emitted(&report);
    assert_eq!(value["class_names"], json!({"0": "alto", "10": "medio"}));
    assert_eq!(value["total_images"], 2);
    assert_eq!(value["detections"], json!([]));
  }
}
