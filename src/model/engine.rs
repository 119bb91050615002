// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/engine.rs - 工作线程推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::{
  frame::InputImage,
  model::{DetectedObject, Engine, EngineCompletion, InferenceError, Model, Resolver, completion},
};

type Reply = Resolver<Result<Vec<DetectedObject>, InferenceError>>;

/// 请求的完成权，由工作线程与超时监视线程争夺，先取走者负责交付
#[derive(Clone)]
struct Pending(Arc<Mutex<Option<Reply>>>);

impl Pending {
  fn new(reply: Reply) -> Self {
    Self(Arc::new(Mutex::new(Some(reply))))
  }

  fn take(&self) -> Option<Reply> {
    self.lock().take()
  }

  fn is_settled(&self) -> bool {
    self.lock().is_none()
  }

  fn lock(&self) -> MutexGuard<'_, Option<Reply>> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

struct Job {
  image: InputImage,
  enqueued: Instant,
  pending: Pending,
  // 工作线程处理完该请求后丢弃，通知监视线程提前结束等待
  _done: Sender<()>,
}

struct Watch {
  deadline: Instant,
  pending: Pending,
  done: Receiver<()>,
}

struct Channels {
  jobs: Sender<Job>,
  watches: Sender<Watch>,
}

/// 在独立工作线程上运行同步 [`Model`] 的引擎
///
/// - 从受理起（排队等待加上推理本身）超过 `timeout` 仍未完成的请求，
///   由监视线程以 [`InferenceError::Timeout`] 完成，之后到达的推理结果被忽略；
/// - 已超时的排队请求不再送入模型；
/// - [`Engine::close`] 之后仍在排队的请求被丢弃，完成通知以放弃结束。
pub struct ModelEngine {
  channels: Mutex<Option<Channels>>,
  closed: Arc<AtomicBool>,
  timeout: Duration,
}

impl ModelEngine {
  pub fn spawn<M: Model>(model: M, timeout: Duration) -> Result<Self, InferenceError> {
    let (jobs, job_rx) = crossbeam_channel::unbounded::<Job>();
    let (watches, watch_rx) = crossbeam_channel::unbounded::<Watch>();
    let closed = Arc::new(AtomicBool::new(false));
    let worker_closed = closed.clone();

    thread::Builder::new()
      .name("kanjian-watchdog".to_string())
      .spawn(move || watchdog_loop(watch_rx, timeout))
      .map_err(|e| InferenceError::EngineUnavailable(format!("无法启动超时监视线程: {}", e)))?;

    thread::Builder::new()
      .name("kanjian-engine".to_string())
      .spawn(move || worker_loop(model, job_rx, worker_closed, timeout))
      .map_err(|e| InferenceError::EngineUnavailable(format!("无法启动推理线程: {}", e)))?;

    info!("推理引擎已启动，超时时间: {:?}", timeout);
    Ok(Self {
      channels: Mutex::new(Some(Channels { jobs, watches })),
      closed,
      timeout,
    })
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

/// 请求按受理顺序到达，截止时间单调不减，逐个等待即可
fn watchdog_loop(watches: Receiver<Watch>, timeout: Duration) {
  for watch in watches {
    if let Err(RecvTimeoutError::Timeout) = watch.done.recv_deadline(watch.deadline) {
      if let Some(reply) = watch.pending.take() {
        warn!("推理请求超过 {:.2?} 未完成，按超时处理", timeout);
        reply.resolve(Err(InferenceError::Timeout(timeout)));
      }
    }
  }
  debug!("超时监视线程退出");
}

fn worker_loop<M: Model>(
  model: M,
  jobs: Receiver<Job>,
  closed: Arc<AtomicBool>,
  timeout: Duration,
) {
  for job in jobs {
    if closed.load(Ordering::Acquire) {
      debug!("引擎已关闭，丢弃排队中的请求");
      drop(job.pending.take());
      continue;
    }

    let waited = job.enqueued.elapsed();
    if waited > timeout {
      if let Some(reply) = job.pending.take() {
        warn!("请求排队 {:.2?} 超时，跳过推理", waited);
        reply.resolve(Err(InferenceError::Timeout(waited)));
      }
      continue;
    }
    if job.pending.is_settled() {
      debug!("请求已超时，跳过推理");
      continue;
    }

    let now = Instant::now();
    let result: Result<Vec<DetectedObject>, InferenceError> =
      model.infer(&job.image).map_err(Into::into);
    let elapsed = now.elapsed();
    debug!("推理完成，耗时: {:.2?}", elapsed);

    let Some(reply) = job.pending.take() else {
      debug!("推理结果晚于超时到达，已忽略");
      continue;
    };
    if job.enqueued.elapsed() > timeout {
      warn!("推理耗时 {:.2?} 超过限制 {:.2?}", elapsed, timeout);
      reply.resolve(Err(InferenceError::Timeout(elapsed)));
    } else {
      reply.resolve(result);
    }
  }
  debug!("推理线程退出");
}

impl Engine for ModelEngine {
  fn process(&self, image: InputImage) -> Result<EngineCompletion, InferenceError> {
    let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(channels) = channels.as_ref() else {
      return Err(InferenceError::EngineUnavailable("引擎已关闭".to_string()));
    };

    let (reply, completion) = completion::channel();
    let pending = Pending::new(reply);
    let (done, done_rx) = crossbeam_channel::bounded(0);
    let enqueued = Instant::now();

    channels
      .jobs
      .send(Job {
        image,
        enqueued,
        pending: pending.clone(),
        _done: done,
      })
      .map_err(|_| InferenceError::EngineUnavailable("推理线程已退出".to_string()))?;
    // 监视线程不在时请求只是失去超时保护，推理照常进行
    if channels
      .watches
      .send(Watch {
        deadline: enqueued + self.timeout,
        pending,
        done: done_rx,
      })
      .is_err()
    {
      warn!("超时监视线程已退出");
    }

    Ok(completion)
  }

  fn close(&self) -> Result<(), InferenceError> {
    let channels = self
      .channels
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if channels.is_some() {
      self.closed.store(true, Ordering::Release);
      info!("推理引擎已关闭");
    }
    Ok(())
  }
}

impl Drop for ModelEngine {
  fn drop(&mut self) {
    let _ = self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Rotation;
  use crate::model::{BoundingBox, Label};
  use std::sync::mpsc::{self, Receiver};

  struct FixedModel {
    delay: Duration,
  }

  impl Model for FixedModel {
    type Error = InferenceError;

    fn infer(&self, input: &InputImage) -> Result<Vec<DetectedObject>, Self::Error> {
      thread::sleep(self.delay);
      if input.is_empty() {
        return Err(InferenceError::MalformedInput("空图像".to_string()));
      }
      Ok(vec![DetectedObject::new(
        BoundingBox::new(0.0, 0.0, input.width() as f32, input.height() as f32),
        vec![Label::new("frame", 1.0, 0)],
      )])
    }
  }

  /// 阻塞在通道上的模型，便于构造“推理进行中”的状态
  struct GatedModel {
    entered: Mutex<mpsc::Sender<()>>,
    gate: Mutex<Receiver<()>>,
  }

  impl Model for GatedModel {
    type Error = InferenceError;

    fn infer(&self, _input: &InputImage) -> Result<Vec<DetectedObject>, Self::Error> {
      let _ = self.entered.lock().unwrap().send(());
      let _ = self.gate.lock().unwrap().recv();
      Ok(Vec::new())
    }
  }

  fn image() -> InputImage {
    InputImage::from_rgb(2, 2, vec![0; 12], Rotation::Deg0).unwrap()
  }

  #[test]
  fn runs_model_on_worker() {
    let engine = ModelEngine::spawn(
      FixedModel {
        delay: Duration::ZERO,
      },
      Duration::from_secs(1),
    )
    .unwrap();
    let objects = engine.process(image()).unwrap().wait().unwrap().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].bounding_box.right, 2.0);
  }

  #[test]
  fn slow_inference_times_out() {
    let engine = ModelEngine::spawn(
      FixedModel {
        delay: Duration::from_millis(50),
      },
      Duration::from_millis(5),
    )
    .unwrap();
    let result = engine.process(image()).unwrap().wait().unwrap();
    assert!(matches!(result, Err(InferenceError::Timeout(_))));
  }

  #[test]
  fn close_is_idempotent_and_rejects_new_work() {
    let engine = ModelEngine::spawn(
      FixedModel {
        delay: Duration::ZERO,
      },
      Duration::from_secs(1),
    )
    .unwrap();
    engine.close().unwrap();
    engine.close().unwrap();
    assert!(engine.is_closed());
    assert!(matches!(
      engine.process(image()),
      Err(InferenceError::EngineUnavailable(_))
    ));
  }

  #[test]
  fn queued_requests_are_abandoned_on_close() {
    let (open, gate) = mpsc::channel();
    let (entered_tx, entered) = mpsc::channel();
    let engine = ModelEngine::spawn(
      GatedModel {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(gate),
      },
      Duration::from_secs(5),
    )
    .unwrap();

    let running = engine.process(image()).unwrap();
    entered.recv().unwrap();
    let queued = engine.process(image()).unwrap();
    engine.close().unwrap();
    open.send(()).unwrap();

    assert!(running.wait().unwrap().is_ok());
    assert_eq!(queued.wait(), Err(crate::model::Abandoned));
  }

  #[test]
  fn hung_inference_settles_at_deadline() {
    let (open, gate) = mpsc::channel();
    let (entered_tx, entered) = mpsc::channel();
    let engine = ModelEngine::spawn(
      GatedModel {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(gate),
      },
      Duration::from_millis(20),
    )
    .unwrap();

    let pending = engine.process(image()).unwrap();
    entered.recv().unwrap();
    let result = pending
      .wait_timeout(Duration::from_secs(1))
      .ok()
      .expect("hung request was never settled");
    assert!(matches!(result, Ok(Err(InferenceError::Timeout(_)))));

    // 模型迟到的结果不会再次完成请求
    open.send(()).unwrap();
  }

  #[test]
  fn queued_request_times_out_without_inference() {
    let (open, gate) = mpsc::channel();
    let (entered_tx, entered) = mpsc::channel();
    let engine = ModelEngine::spawn(
      GatedModel {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(gate),
      },
      Duration::from_millis(50),
    )
    .unwrap();

    let running = engine.process(image()).unwrap();
    entered.recv().unwrap();
    let queued = engine.process(image()).unwrap();

    let result = queued.wait_timeout(Duration::from_secs(1)).ok();
    assert!(matches!(result, Some(Ok(Err(InferenceError::Timeout(_))))));
    let result = running.wait_timeout(Duration::from_secs(1)).ok();
    assert!(matches!(result, Some(Ok(Err(InferenceError::Timeout(_))))));

    open.send(()).unwrap();
    assert!(entered.recv_timeout(Duration::from_millis(200)).is_err());
  }
}
