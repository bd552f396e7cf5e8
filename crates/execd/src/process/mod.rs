//! The supervised coprocess.
//!
//! [`Execd`] owns at most one child at a time. Each child generation gets its
//! own feeder, drain and diagnostics task; the supervisor tears all of them
//! down before a replacement is spawned.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::accumulator::Accumulator;
use crate::codec::DecoderFactory;
use crate::codec::MetricEncoder;
use crate::config::ExecdConfig;
use crate::error::ExecdError;
use crate::error::ExecdResult;
use crate::metric::Metric;
use crate::tracking::DeliveryTracker;
use crate::tracking::Input;
use crate::tracking::TrackingId;

mod diagnostics;
mod drain;
mod feeder;
mod spawn;

pub use diagnostics::DIAGNOSTICS_TARGET;

use drain::Drain;
use feeder::Feeder;
use spawn::Coprocess;

/// Lifecycle of an [`Execd`] instance.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    #[display("stopped")]
    Stopped,
    #[display("running")]
    Running,
    #[display("restarting")]
    Restarting,
    #[display("stopping")]
    Stopping,
}

/// A metric waiting for the feeder.
#[derive(Debug)]
pub(crate) struct Queued {
    pub metric: Metric,
    pub id: Option<TrackingId>,
}

struct Running {
    queue: mpsc::Sender<Queued>,
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Runs an external program as a streaming transformation stage.
///
/// Metrics passed to [`Execd::add`] are written to the program's stdin,
/// whatever it prints on stdout is decoded and handed to the accumulator
/// given to [`Execd::start`], and its stderr is logged. A program that exits
/// on its own is restarted after the configured delay.
pub struct Execd {
    config: Arc<ExecdConfig>,
    name: Arc<str>,
    encoder: Arc<dyn MetricEncoder>,
    decoders: DecoderFactory,
    tracker: DeliveryTracker,
    state: Arc<watch::Sender<Lifecycle>>,
    restarts: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl Execd {
    /// Uses the codecs of the configured data format.
    pub fn new(config: ExecdConfig) -> ExecdResult<Self> {
        let encoder = config.data_format.encoder();
        let decoders = config.data_format.decoder_factory();
        Self::with_codec(config, encoder, decoders)
    }

    pub fn with_codec(
        config: ExecdConfig,
        encoder: Arc<dyn MetricEncoder>,
        decoders: DecoderFactory,
    ) -> ExecdResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(Lifecycle::Stopped);
        Ok(Self {
            name: Arc::from(config.display_name()),
            tracker: DeliveryTracker::new(config.outputs_per_input),
            config: Arc::new(config),
            encoder,
            decoders,
            state: Arc::new(state),
            restarts: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ExecdConfig {
        &self.config
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Lifecycle> {
        self.state.subscribe()
    }

    /// Number of times the child was restarted after exiting on its own.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Tracked inputs whose outcome is still open.
    pub fn pending_deliveries(&self) -> usize {
        self.tracker.pending()
    }

    /// Spawns the child and starts supervising it.
    ///
    /// Fails if the program cannot be started or the instance is already running.
    pub async fn start(&self, accumulator: Arc<dyn Accumulator>) -> ExecdResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Report::new(ExecdError::AlreadyRunning {
                name: self.name.to_string(),
            }));
        }

        let process = spawn::spawn(&self.config)?;
        info!(name = %self.name, pid = ?process.pid, "started process");

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor {
            config: Arc::clone(&self.config),
            name: Arc::clone(&self.name),
            encoder: Arc::clone(&self.encoder),
            decoders: Arc::clone(&self.decoders),
            tracker: self.tracker.clone(),
            accumulator,
            queue: Arc::new(Mutex::new(rx)),
            shutdown: shutdown.clone(),
            state: Arc::clone(&self.state),
            restarts: Arc::clone(&self.restarts),
        };

        self.state.send_replace(Lifecycle::Running);
        *running = Some(Running {
            queue: tx,
            shutdown,
            supervisor: tokio::spawn(supervisor.run(process)),
        });
        Ok(())
    }

    /// Queues a metric for the child.
    ///
    /// Waits while the queue is full. Fails with [`ExecdError::NotRunning`]
    /// before `start`, and with [`ExecdError::Stopped`] once `stop` began; a
    /// tracked metric is resolved as not delivered in both cases.
    pub async fn add(&self, input: impl Into<Input>) -> ExecdResult<()> {
        let (metric, id) = match input.into() {
            Input::Untracked(metric) => (metric, None),
            Input::Tracked(tracked) => {
                let (metric, mut delivery) = tracked.into_parts();
                let id = delivery.id();
                if let Some(resolver) = delivery.take_resolver() {
                    self.tracker.register(id, resolver);
                }
                (metric, Some(id))
            }
        };

        let running = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|running| (running.queue.clone(), running.shutdown.clone()))
        };
        let Some((queue, shutdown)) = running else {
            self.reject(id);
            return Err(Report::new(ExecdError::NotRunning {
                name: self.name.to_string(),
            }));
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            sent = queue.send(Queued { metric, id }) => sent.is_ok(),
        };
        if sent {
            return Ok(());
        }
        self.reject(id);
        Err(Report::new(ExecdError::Stopped {
            name: self.name.to_string(),
        }))
    }

    /// Stops the child and waits for every task to finish.
    ///
    /// Metrics already queued are still written during the grace period; the
    /// child is killed if it has not exited after `stop_timeout`. Calling
    /// `stop` on a stopped instance does nothing.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            queue,
            shutdown,
            supervisor,
        }) = running.take()
        else {
            return;
        };

        info!(name = %self.name, "stopping process");
        self.state.send_replace(Lifecycle::Stopping);
        shutdown.cancel();
        drop(queue);
        if let Err(e) = supervisor.await {
            error!(name = %self.name, "supervisor task failed: {e}");
        }
        self.state.send_replace(Lifecycle::Stopped);
        info!(name = %self.name, "process stopped");
    }

    fn reject(&self, id: Option<TrackingId>) {
        if let Some(id) = id {
            self.tracker.reject(id);
        }
    }
}

impl Drop for Execd {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut() {
            running.shutdown.cancel();
        }
    }
}

/// How one generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Stopped,
    Exited,
    Faulted,
}

enum Event {
    Exited(std::io::Result<std::process::ExitStatus>),
    Fault,
    Shutdown,
}

struct Supervisor {
    config: Arc<ExecdConfig>,
    name: Arc<str>,
    encoder: Arc<dyn MetricEncoder>,
    decoders: DecoderFactory,
    tracker: DeliveryTracker,
    accumulator: Arc<dyn Accumulator>,
    queue: Arc<Mutex<mpsc::Receiver<Queued>>>,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<Lifecycle>>,
    restarts: Arc<AtomicU64>,
}

impl Supervisor {
    async fn run(self, first: Coprocess) {
        let mut next = Some(first);
        loop {
            let process = match next.take() {
                Some(process) => process,
                None => match spawn::spawn(&self.config) {
                    Ok(process) => {
                        info!(name = %self.name, pid = ?process.pid, "restarted process");
                        if !self.shutdown.is_cancelled() {
                            self.state.send_replace(Lifecycle::Running);
                        }
                        process
                    }
                    Err(report) => {
                        error!(name = %self.name, "failed to restart process: {report:?}");
                        if !self.wait_restart_delay().await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let outcome = self.run_generation(process).await;
            self.tracker.abandon_in_flight();

            if outcome == Outcome::Stopped || self.shutdown.is_cancelled() {
                break;
            }
            self.restarts.fetch_add(1, Ordering::Relaxed);
            self.state.send_replace(Lifecycle::Restarting);
            info!(
                name = %self.name,
                delay = ?self.config.restart_delay(),
                "restarting process after delay"
            );
            if !self.wait_restart_delay().await {
                break;
            }
        }

        self.discard_queued().await;
    }

    /// Returns `false` when a stop request cut the wait short.
    async fn wait_restart_delay(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.restart_delay()) => true,
        }
    }

    async fn run_generation(&self, process: Coprocess) -> Outcome {
        let Coprocess {
            mut child,
            pid,
            stdin,
            stdout,
            stderr,
        } = process;
        let abort = CancellationToken::new();
        let fault = CancellationToken::new();

        let feeder = tokio::spawn(
            Feeder {
                name: Arc::clone(&self.name),
                stdin,
                queue: Arc::clone(&self.queue),
                encoder: Arc::clone(&self.encoder),
                tracker: self.tracker.clone(),
                shutdown: self.shutdown.clone(),
                abort: abort.clone(),
                fault: fault.clone(),
            }
            .run(),
        );
        let drain = tokio::spawn(
            Drain {
                name: Arc::clone(&self.name),
                stdout,
                decoder: (self.decoders)(),
                tracker: self.tracker.clone(),
                accumulator: Arc::clone(&self.accumulator),
            }
            .run(),
        );
        let diagnostics = tokio::spawn(diagnostics::run(Arc::clone(&self.name), stderr));

        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            _ = fault.cancelled() => Event::Fault,
            _ = self.shutdown.cancelled() => Event::Shutdown,
        };

        let outcome = match event {
            Event::Exited(status) => {
                if self.shutdown.is_cancelled() {
                    Outcome::Stopped
                } else {
                    match status {
                        Ok(status) => {
                            error!(name = %self.name, ?pid, "process exited unexpectedly: {status}")
                        }
                        Err(e) => {
                            error!(name = %self.name, ?pid, "failed to wait for process: {e}")
                        }
                    }
                    Outcome::Exited
                }
            }
            Event::Fault => {
                error!(name = %self.name, ?pid, "process stdin broken, killing process");
                kill(&self.name, &mut child).await;
                Outcome::Faulted
            }
            Event::Shutdown => {
                let timeout = self.config.stop_timeout();
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => info!(name = %self.name, ?pid, "process exited: {status}"),
                    Ok(Err(e)) => warn!(name = %self.name, "failed to wait for process: {e}"),
                    Err(_) => {
                        warn!(
                            name = %self.name,
                            ?pid,
                            "process did not exit within {timeout:?}, killing it"
                        );
                        kill(&self.name, &mut child).await;
                    }
                }
                Outcome::Stopped
            }
        };

        abort.cancel();
        if let Err(e) = feeder.await {
            error!(name = %self.name, "feeder task failed: {e}");
        }
        // streams may be held open by the child's own children
        let grace = self.config.stop_timeout();
        join_bounded(&self.name, "drain", drain, grace).await;
        join_bounded(&self.name, "diagnostics", diagnostics, grace).await;
        outcome
    }

    /// Rejects whatever is still queued once no child will ever read it.
    async fn discard_queued(&self) {
        let mut queue = self.queue.lock().await;
        queue.close();
        let mut discarded = 0usize;
        while let Ok(queued) = queue.try_recv() {
            if let Some(id) = queued.id {
                self.tracker.reject(id);
            }
            discarded += 1;
        }
        if discarded > 0 {
            warn!(name = %self.name, discarded, "discarded queued metrics on shutdown");
        }
    }
}

async fn kill(name: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(name = %name, "failed to kill process: {e}");
    }
}

async fn join_bounded(name: &str, task: &str, mut handle: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(name = %name, "{task} task failed: {e}"),
        Err(_) => {
            warn!(name = %name, "{task} task did not finish in {limit:?}, aborting it");
            handle.abort();
        }
    }
}
