// 该文件是 Kanjian （看见） 项目的一部分。
// src/bin/simple_camera.rs - 摄像头流式检测
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
use tracing::info;
use url::Url;

use kanjian::{
  FromUrl,
  input::{Backpressure, FrameSource, InputWrapper},
  model::{ModelEngine, ReplayModel},
  output::OutputWrapper,
  processor::{ObjectDetectorProcessor, VisionProcessor},
  task::{StreamTask, Task, install_interrupt_handler},
};

/// Kanjian 摄像头流式检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测结果回放文件，例如 replay:///path/to/detections.jsonl?latency_ms=40
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源（synthetic://camera、image:///path.png、v4l:///dev/video0）
  #[arg(long, value_name = "SOURCE", default_value = "synthetic://camera")]
  pub input: Url,
  /// 输出（log:// 或 folder:///path/to/dir）
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 背压策略：keep-latest、queue 或 queue:<depth>
  #[arg(long, value_name = "STRATEGY", default_value_t = Backpressure::KeepLatest)]
  pub backpressure: Backpressure,
  /// 队列深度，指定后使用 queue 策略
  #[arg(long, value_name = "DEPTH")]
  pub queue_depth: Option<usize>,
  /// 单次推理超时（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 2000)]
  pub timeout_ms: u64,
  /// 最大采样次数，0 表示无限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出: {}", args.output);

  let shutdown = install_interrupt_handler()?;

  let input = InputWrapper::from_url(&args.input)?;
  let format = input.format();
  info!(
    "输入格式: {}x{} @ {} fps, 缓冲池容量 {}",
    format.width,
    format.height,
    format.fps,
    input.pool().capacity()
  );

  let model = ReplayModel::from_url(&args.model)?;
  let engine = ModelEngine::spawn(model, Duration::from_millis(args.timeout_ms))?;
  let output = Arc::new(OutputWrapper::from_url(&args.output)?);
  let processor = VisionProcessor::new(
    ObjectDetectorProcessor::new(engine),
    output.clone(),
    output.clone(),
  );

  let backpressure = match args.queue_depth {
    Some(depth) => Backpressure::Queue {
      depth: depth.max(1),
    },
    None => args.backpressure,
  };

  let stats = StreamTask::default()
    .with_frame_number((args.frame_number > 0).then_some(args.frame_number))
    .with_backpressure(backpressure)
    .with_shutdown(shutdown)
    .run_task(input, &processor)?;

  processor.close();
  output.finish();

  let processed = processor.stats();
  info!(
    "结束: 采样 {} 次, 交付 {} 帧, 失败 {} 帧, 丢弃 {} 帧",
    stats.ticks, processed.delivered, processed.failed, stats.dropped
  );
  Ok(())
}
