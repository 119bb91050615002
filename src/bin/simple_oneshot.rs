// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use kanjian::{
  FromUrl,
  input::InputWrapper,
  model::{ModelEngine, ReplayModel},
  output::OutputWrapper,
  processor::{FrameOutcome, ObjectDetectorProcessor, VisionProcessor},
  task::{OneShotTask, Task},
};

/// Kanjian 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测结果回放文件，例如 replay:///path/to/detections.jsonl
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///path/to/photo.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出（log:// 或 folder:///path/to/dir）
  #[arg(long, value_name = "OUTPUT", default_value = "log://?always")]
  pub output: Url,
  /// 推理超时（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 5000)]
  pub timeout_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出: {}", args.output);

  let input = InputWrapper::from_url(&args.input)?;
  let model = ReplayModel::from_url(&args.model)?;
  let engine = ModelEngine::spawn(model, Duration::from_millis(args.timeout_ms))?;
  let output = Arc::new(OutputWrapper::from_url(&args.output)?);
  let processor = VisionProcessor::new(
    ObjectDetectorProcessor::new(engine),
    output.clone(),
    output.clone(),
  );

  let outcome = OneShotTask.run_task(input, &processor)?;
  processor.close();
  output.finish();

  match outcome {
    FrameOutcome::Delivered => info!("检测完成"),
    FrameOutcome::Failed(error) => warn!("检测失败: {}", error),
    FrameOutcome::Discarded => warn!("结果被丢弃"),
  }
  Ok(())
}
