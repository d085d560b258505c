//! Bridge between the synchronous tick loop and the async network stack.
//!
//! The driver thread never awaits anything. It hands units of work to a
//! [`DispatchBridge`], which runs them on a tokio runtime owned by a
//! dedicated worker thread and reports each outcome through a completion
//! callback executed on that runtime.

use futures::FutureExt;
use once_cell::sync::OnceCell;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::error::{ClientError, DispatchError};
use crate::http_client::{ChatRequest, Response, StreamingRequestClient};

/// How long the runtime may take to cancel leftover tasks once the worker stops.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// In-flight accounting shared with every submitted task.
#[derive(Default)]
struct BridgeState {
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl BridgeState {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// The worker thread and its runtime handle.
struct Worker {
    handle: Handle,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn start(worker_threads: Option<usize>) -> Result<Self, DispatchError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("dispatch-worker".to_string())
            .spawn(move || {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.enable_all().thread_name("dispatch-rt");
                if let Some(threads) = worker_threads {
                    builder.worker_threads(threads);
                }

                let runtime = match builder.build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
            })
            .map_err(|e| DispatchError::Startup(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|e| DispatchError::Startup(e.to_string()))?
            .map_err(DispatchError::Startup)?;

        debug!("Dispatch worker started");
        Ok(Self {
            handle,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn signal_stop(&self) {
        let mut stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = stop_tx.take() {
            let _ = tx.send(());
        }
    }

    fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Dispatch worker thread panicked during shutdown");
            }
        }
    }
}

/// A submitted unit's completion hook.
///
/// Guarantees the callback runs at most once and the in-flight count is
/// released even when the task is cancelled or the callback panics.
struct Pending<T, C>
where
    C: FnOnce(Result<T, DispatchError>),
{
    on_complete: Option<C>,
    state: Arc<BridgeState>,
    _output: PhantomData<fn(T)>,
}

impl<T, C> Pending<T, C>
where
    C: FnOnce(Result<T, DispatchError>),
{
    fn finish(mut self, outcome: Result<T, DispatchError>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(outcome);
        }
    }
}

impl<T, C> Drop for Pending<T, C>
where
    C: FnOnce(Result<T, DispatchError>),
{
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(Err(DispatchError::Closed));
        }
        self.state.finish_one();
    }
}

/// Fire-and-notify executor for network work.
///
/// The worker is created on first use and lives until [`DispatchBridge::shutdown`].
/// Methods that block ([`block_on`](Self::block_on), [`wait_idle`](Self::wait_idle),
/// [`shutdown`](Self::shutdown)) must be called from outside any tokio runtime.
pub struct DispatchBridge {
    worker: OnceCell<Worker>,
    state: Arc<BridgeState>,
    worker_threads: Option<usize>,
}

impl DispatchBridge {
    pub fn new() -> Self {
        Self {
            worker: OnceCell::new(),
            state: Arc::new(BridgeState::default()),
            worker_threads: None,
        }
    }

    /// Bridge whose runtime uses a fixed number of worker threads.
    pub fn with_worker_threads(threads: usize) -> Self {
        Self {
            worker: OnceCell::new(),
            state: Arc::new(BridgeState::default()),
            worker_threads: Some(threads.max(1)),
        }
    }

    /// Whether the worker has been started.
    pub fn is_started(&self) -> bool {
        self.worker.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Units submitted whose callbacks have not yet returned.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    fn worker(&self) -> Result<&Worker, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        self.worker
            .get_or_try_init(|| Worker::start(self.worker_threads))
    }

    /// Run `work` on the worker and hand its outcome to `on_complete`.
    ///
    /// Returns immediately. `on_complete` runs on the worker runtime,
    /// concurrently with the caller; it must not block. When this returns an
    /// error the callback is dropped without being invoked.
    pub fn submit<F, T, C>(&self, work: F, on_complete: C) -> Result<(), DispatchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, DispatchError>) + Send + 'static,
    {
        let worker = self.worker()?;

        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        let pending = Pending {
            on_complete: Some(on_complete),
            state: self.state.clone(),
            _output: PhantomData,
        };

        worker.handle.spawn(async move {
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|_| DispatchError::Panicked);
            pending.finish(outcome);
        });
        Ok(())
    }

    /// Spawn an untracked task, such as a signal watcher or a local server.
    pub fn spawn_background<F>(&self, work: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = self.worker()?;
        worker.handle.spawn(work);
        Ok(())
    }

    /// Block the calling thread on `work`; only for startup and teardown paths.
    pub fn block_on<F: Future>(&self, work: F) -> Result<F::Output, DispatchError> {
        let worker = self.worker()?;
        Ok(worker.handle.block_on(work))
    }

    /// Block until nothing is in flight, or until `timeout` passes.
    ///
    /// Returns whether the bridge went idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let Some(worker) = self.worker.get() else {
            return true;
        };

        let state = self.state.clone();
        let drained = async move {
            loop {
                let notified = state.idle.notified();
                if state.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => worker
                .handle
                .block_on(async { tokio::time::timeout(limit, drained).await.is_ok() }),
            None => {
                worker.handle.block_on(drained);
                true
            }
        }
    }

    /// Stop accepting work, let outstanding units drain, then stop the worker.
    ///
    /// `grace` bounds the drain; `None` waits for every unit. Returns the
    /// number of units still outstanding when the worker was stopped.
    pub fn shutdown(&self, grace: Option<Duration>) -> usize {
        let already_closed = self.state.closed.swap(true, Ordering::AcqRel);
        let Some(worker) = self.worker.get() else {
            return 0;
        };
        if already_closed && worker.thread.lock().map(|t| t.is_none()).unwrap_or(true) {
            return self.in_flight();
        }

        info!(in_flight = self.in_flight(), "Draining dispatch bridge");
        if !self.wait_idle(grace) {
            warn!(
                in_flight = self.in_flight(),
                "Drain grace period elapsed, cancelling outstanding requests"
            );
        }
        let remaining = self.in_flight();

        worker.signal_stop();
        worker.join();
        debug!(remaining, "Dispatch worker stopped");
        remaining
    }
}

impl Default for DispatchBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DispatchBridge {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::Release);
        if let Some(worker) = self.worker.get() {
            worker.signal_stop();
        }
    }
}

// ==================================================================================================
// Request launching
// ==================================================================================================

/// Completion callback for one chat request.
pub type Completion = Box<dyn FnOnce(Result<Response, ClientError>) + Send + 'static>;

/// Where sessions send their requests.
pub trait RequestLauncher: Send + Sync {
    /// Start `request` without waiting for it.
    ///
    /// On `Ok`, `on_complete` is invoked exactly once, possibly on another
    /// thread. On `Err` it is never invoked.
    fn launch(&self, request: ChatRequest, on_complete: Completion) -> Result<(), DispatchError>;
}

/// Runs [`StreamingRequestClient`] calls on a [`DispatchBridge`].
pub struct BridgedClient {
    bridge: Arc<DispatchBridge>,
    client: Arc<StreamingRequestClient>,
}

impl BridgedClient {
    pub fn new(bridge: Arc<DispatchBridge>, client: Arc<StreamingRequestClient>) -> Self {
        Self { bridge, client }
    }

    pub fn bridge(&self) -> &Arc<DispatchBridge> {
        &self.bridge
    }
}

impl RequestLauncher for BridgedClient {
    fn launch(&self, request: ChatRequest, on_complete: Completion) -> Result<(), DispatchError> {
        let client = self.client.clone();
        self.bridge.submit(
            async move { client.execute(&request).await },
            move |outcome| on_complete(outcome.unwrap_or_else(|e| Err(e.into()))),
        )
    }
}
