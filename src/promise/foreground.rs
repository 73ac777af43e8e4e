use tokio::sync::mpsc;

/// A callback posted to the foreground context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The single serialized context callbacks can ask to run on (typically a UI thread).
pub trait Foreground: Send + Sync {
  /// Post a job to run later. Nothing about its execution is reported back.
  fn post(&self, job: Job);
}

/// Sender half of a channel-backed foreground context.
#[derive(Clone)]
pub struct ForegroundQueue {
  tx: mpsc::UnboundedSender<Job>,
}

/// Receiver half: whoever owns it is the foreground thread.
pub struct ForegroundReceiver {
  rx: mpsc::UnboundedReceiver<Job>,
}

impl ForegroundQueue {
  pub fn new() -> (Self, ForegroundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, ForegroundReceiver { rx })
  }
}

impl Foreground for ForegroundQueue {
  fn post(&self, job: Job) {
    // Receiver gone means the foreground loop ended; the job is dropped with it
    if self.tx.send(job).is_err() {
      tracing::debug!("foreground receiver closed, dropping job");
    }
  }
}

impl ForegroundReceiver {
  /// Run every job queued so far without waiting. Returns how many ran.
  pub fn run_pending(&mut self) -> usize {
    let mut ran = 0;
    while let Ok(job) = self.rx.try_recv() {
      job();
      ran += 1;
    }
    ran
  }

  /// Block the current thread until one job arrives and run it.
  ///
  /// Returns false once every queue handle has been dropped.
  pub fn run_one_blocking(&mut self) -> bool {
    match self.rx.blocking_recv() {
      Some(job) => {
        job();
        true
      }
      None => false,
    }
  }

  /// Run jobs until every queue handle has been dropped.
  pub async fn run(mut self) {
    while let Some(job) = self.rx.recv().await {
      job();
    }
  }
}
