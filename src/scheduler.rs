//! The device scheduler.
//!
//! The scheduler drives device handlers on the plugin's behalf:
//!
//! - a **read loop** ticks on the configured interval and invokes the read
//!   (or bulk read) function of every readable handler;
//! - a **write loop** drains the bounded write queue in batches, driving
//!   write handlers under per-device deadlines and advancing the write
//!   transactions;
//! - one **listener task** per listening device pumps push-based readings,
//!   restarting the handler with capped exponential backoff when it fails.
//!
//! Every reading -- polled or pushed -- passes through
//! [`finalize_readings`] (device transforms, then device context merge)
//! before it is handed to the reading channel, whose consumer updates the
//! reading store. In parallel mode handler invocations within a tick run
//! concurrently; in serial mode they run one after another and a tick waits
//! for the previous one to drain. An optional token-bucket limiter gates
//! every handler invocation.
//!
//! Stop is cooperative: loops observe the stop signal at tick boundaries,
//! in-flight handler calls finish, and writes still queued are drained with
//! an ERROR status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{PluginSettings, RunMode};
use crate::device::{Device, DeviceHandler};
use crate::errors::{PluginError, PluginResult};
use crate::health::HealthManager;
use crate::limiter::RateLimiter;
use crate::output::{ReadContext, WriteData};
use crate::registry::DeviceRegistry;
use crate::stop::StopSignal;
use crate::transaction::{Transaction, TransactionStore, WriteStatus};

/// Interval at which the scheduler liveness health check is evaluated.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Initial and maximum delay between listener restarts.
const LISTEN_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const LISTEN_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Buffer between a listen handler and the reading pipeline.
const LISTEN_SINK_CAPACITY: usize = 128;

/// A write waiting in the scheduler's queue.
pub struct WriteContext {
    pub transaction: Arc<Transaction>,
    /// ID of the device to write.
    pub device: String,
    pub data: WriteData,
}

/// Everything the scheduler needs, passed explicitly so multiple plugin
/// instances can coexist in one process.
pub struct SchedulerContext {
    pub settings: PluginSettings,
    pub registry: Arc<DeviceRegistry>,
    pub transactions: Arc<TransactionStore>,
    /// Producer half of the reading channel; the consumer updates the
    /// reading store.
    pub read_tx: mpsc::Sender<ReadContext>,
    pub stop: StopSignal,
}

/// Handles for the scheduler's background tasks.
///
/// Loop tasks terminate on their own once the stop signal trips. Listener
/// tasks only exit when their handler returns; [`abort`](SchedulerTasks::abort_listeners)
/// is the shutdown backstop for handlers that never observe their sink
/// closing.
pub struct SchedulerTasks {
    pub loops: Vec<JoinHandle<()>>,
    pub listeners: Vec<JoinHandle<()>>,
}

impl SchedulerTasks {
    /// Wait for the read and write loops to wind down.
    pub async fn join_loops(&mut self) {
        for handle in self.loops.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn abort_listeners(&mut self) {
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    settings: PluginSettings,
    registry: Arc<DeviceRegistry>,
    transactions: Arc<TransactionStore>,
    read_tx: mpsc::Sender<ReadContext>,
    write_tx: mpsc::Sender<WriteContext>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteContext>>>,
    limiter: Option<RateLimiter>,
    stop: StopSignal,

    last_read_tick: Mutex<Option<Instant>>,
    last_write_tick: Mutex<Option<Instant>>,
    restarts: Mutex<HashMap<String, u64>>,
    transform_errors: AtomicU64,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(ctx.settings.write.queue_size);
        let limiter = ctx.settings.limiter.as_ref().map(RateLimiter::new);
        Arc::new(Self {
            settings: ctx.settings,
            registry: ctx.registry,
            transactions: ctx.transactions,
            read_tx: ctx.read_tx,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            limiter,
            stop: ctx.stop,
            last_read_tick: Mutex::new(None),
            last_write_tick: Mutex::new(None),
            restarts: Mutex::new(HashMap::new()),
            transform_errors: AtomicU64::new(0),
        })
    }

    /// Trip the shared stop signal. Idempotent; loops observe it at their
    /// next tick boundary.
    pub fn stop(&self) {
        self.stop.signal();
    }

    /// Start the listener tasks (first), then the read and write loops.
    pub fn start(self: &Arc<Self>) -> SchedulerTasks {
        let listeners = self.start_listeners();
        let loops = vec![
            tokio::spawn(self.clone().run_read_loop()),
            tokio::spawn(self.clone().run_write_loop()),
        ];
        SchedulerTasks { loops, listeners }
    }

    /// Number of times the listener for the given device has been restarted.
    pub fn listener_restarts(&self, device_id: &str) -> u64 {
        self.restarts.lock().get(device_id).copied().unwrap_or(0)
    }

    /// Number of readings dropped due to transform failures.
    pub fn transform_error_count(&self) -> u64 {
        self.transform_errors.load(Ordering::Relaxed)
    }

    async fn limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }

    // =========================================================================
    // Read loop
    // =========================================================================

    async fn run_read_loop(self: Arc<Self>) {
        let read = &self.settings.read;
        if read.disable {
            info!("read loop disabled");
            return;
        }
        let handlers = self.registry.readable_handlers();
        if handlers.is_empty() {
            debug!("no readable handlers registered, not starting read loop");
            return;
        }

        info!(
            interval = ?read.interval(),
            mode = ?self.settings.mode,
            handlers = handlers.len(),
            "starting read loop"
        );
        if !read.delay().is_zero() {
            tokio::select! {
                _ = self.stop.stopped() => return,
                _ = tokio::time::sleep(read.delay()) => {}
            }
        }

        let mut ticker = interval_at(Instant::now(), read.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.stopped() => break,
                _ = ticker.tick() => {
                    *self.last_read_tick.lock() = Some(Instant::now());
                    for handler in &handlers {
                        match self.settings.mode {
                            RunMode::Parallel => {
                                tokio::spawn(self.clone().read_handler(handler.clone()));
                            }
                            RunMode::Serial => {
                                self.clone().read_handler(handler.clone()).await;
                            }
                        }
                    }
                }
            }
        }
        info!("read loop stopped");
    }

    /// One read cycle for one handler: a single bulk read, or one read per
    /// device.
    async fn read_handler(self: Arc<Self>, handler: Arc<DeviceHandler>) {
        let devices = self.registry.devices_for_handler(handler.name());
        if devices.is_empty() {
            return;
        }

        if let Some(bulk_read) = handler.bulk_read_fn() {
            self.limit().await;
            match bulk_read(devices).await {
                Ok(contexts) => {
                    for ctx in contexts {
                        self.emit(ctx).await;
                    }
                }
                Err(e) => {
                    warn!(handler = handler.name(), error = %e, "bulk read failed");
                }
            }
        } else if let Some(read) = handler.read_fn() {
            for device in devices {
                if self.stop.is_stopped() {
                    return;
                }
                self.limit().await;
                match read(device.clone()).await {
                    Ok(readings) => {
                        self.emit(ReadContext::new(device.id(), readings)).await;
                    }
                    Err(e) => {
                        warn!(device = device.id(), error = %e, "device read failed");
                    }
                }
            }
        }
    }

    /// Finalize a read context and push it onto the reading channel.
    async fn emit(&self, mut ctx: ReadContext) {
        let Some(device) = self.registry.get(&ctx.device) else {
            warn!(device = %ctx.device, "reading for unknown device dropped");
            return;
        };
        if let Err(e) = finalize_readings(&device, &mut ctx) {
            self.transform_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device = device.id(), error = %e, "reading dropped");
            return;
        }
        tokio::select! {
            _ = self.stop.stopped() => {}
            result = self.read_tx.send(ctx) => {
                if result.is_err() {
                    debug!("reading channel closed");
                }
            }
        }
    }

    // =========================================================================
    // Write loop
    // =========================================================================

    /// Enqueue writes for a device, one transaction per data element.
    ///
    /// Blocks when the write queue is full (back-pressure), but never drops;
    /// the stop signal aborts the wait.
    pub async fn write(
        &self,
        device: &Arc<Device>,
        data: &[WriteData],
    ) -> PluginResult<Vec<Arc<Transaction>>> {
        if data.is_empty() {
            return Err(PluginError::NilData);
        }
        if !device.is_writable() {
            return Err(PluginError::DeviceNotWritable(device.id().to_string()));
        }

        let timeout = device.write_timeout_or(self.settings.write.timeout());
        let mut transactions = Vec::with_capacity(data.len());
        for item in data {
            let txn = self.transactions.create(timeout, item.action.clone());
            let wctx = WriteContext {
                transaction: txn.clone(),
                device: device.id().to_string(),
                data: item.clone(),
            };
            tokio::select! {
                _ = self.stop.stopped() => return Err(PluginError::Stopping),
                result = self.write_tx.send(wctx) => {
                    if result.is_err() {
                        return Err(PluginError::Stopping);
                    }
                }
            }
            transactions.push(txn);
        }
        Ok(transactions)
    }

    fn take_write_rx(&self) -> Option<mpsc::Receiver<WriteContext>> {
        self.write_rx.lock().take()
    }

    async fn run_write_loop(self: Arc<Self>) {
        let write = &self.settings.write;
        if write.disable {
            info!("write loop disabled");
            return;
        }
        if !self.registry.has_writable_devices() {
            debug!("no writable devices registered, not starting write loop");
            return;
        }
        let Some(mut rx) = self.take_write_rx() else {
            error!("write queue receiver already taken");
            return;
        };

        info!(
            interval = ?write.interval(),
            batch = write.batch_size,
            "starting write loop"
        );
        if !write.delay().is_zero() {
            tokio::select! {
                _ = self.stop.stopped() => {}
                _ = tokio::time::sleep(write.delay()) => {}
            }
        }

        let mut ticker = interval_at(Instant::now(), write.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if self.stop.is_stopped() {
                break;
            }
            tokio::select! {
                _ = self.stop.stopped() => break,
                _ = ticker.tick() => {
                    *self.last_write_tick.lock() = Some(Instant::now());
                    for _ in 0..write.batch_size {
                        match rx.try_recv() {
                            Ok(wctx) => match self.settings.mode {
                                RunMode::Parallel => {
                                    tokio::spawn(self.clone().write_one(wctx));
                                }
                                RunMode::Serial => self.clone().write_one(wctx).await,
                            },
                            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                        }
                    }
                }
            }
        }

        // Anything still queued at stop is failed out, not silently dropped.
        let mut cancelled = 0;
        while let Ok(wctx) = rx.try_recv() {
            self.cancel_write(&wctx);
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled queued writes on stop");
        }
        info!("write loop stopped");
    }

    async fn write_one(self: Arc<Self>, wctx: WriteContext) {
        let id = wctx.transaction.id().to_string();
        if let Err(e) = self.transactions.mark(&id, WriteStatus::Writing, None) {
            error!(%id, error = %e, "failed to mark transaction writing");
            return;
        }

        debug!(%id, device = %wctx.device, action = %wctx.data.action, "processing write");
        match self.execute_write(&wctx).await {
            Ok(()) => {
                let _ = self.transactions.mark(&id, WriteStatus::Done, None);
            }
            Err(e) => {
                warn!(%id, device = %wctx.device, error = %e, "write failed");
                let _ = self
                    .transactions
                    .mark(&id, WriteStatus::Error, Some(&e.to_string()));
            }
        }
    }

    /// Drive the device's write handler under its deadline. On deadline the
    /// handler is abandoned and its eventual return value discarded.
    async fn execute_write(&self, wctx: &WriteContext) -> PluginResult<()> {
        let device = self
            .registry
            .get(&wctx.device)
            .ok_or(PluginError::NilDevice)?;
        let write_fn = device
            .handler()
            .and_then(|h| h.write_fn())
            .cloned()
            .ok_or_else(|| PluginError::DeviceNotWritable(wctx.device.clone()))?;

        self.limit().await;
        let deadline = device.write_timeout_or(self.settings.write.timeout());
        match tokio::time::timeout(deadline, write_fn(device, wctx.data.clone())).await {
            Err(_) => Err(PluginError::WriteTimeout(wctx.device.clone())),
            Ok(Err(e)) => Err(PluginError::WriteHandler {
                device: wctx.device.clone(),
                message: e.to_string(),
            }),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Fail out a queued write at shutdown. The transaction is walked
    /// through WRITING so its status history stays a legal prefix.
    fn cancel_write(&self, wctx: &WriteContext) {
        let id = wctx.transaction.id();
        let _ = self.transactions.mark(id, WriteStatus::Writing, None);
        let _ = self
            .transactions
            .mark(id, WriteStatus::Error, Some("write cancelled: plugin stopping"));
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    fn start_listeners(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.settings.listen.disable {
            info!("listeners disabled");
            return Vec::new();
        }
        let devices = self.registry.listener_devices();
        if !devices.is_empty() {
            info!(count = devices.len(), "starting device listeners");
        }
        devices
            .into_iter()
            .map(|device| tokio::spawn(self.clone().run_listener(device)))
            .collect()
    }

    /// Run one device's listen handler, restarting it with capped
    /// exponential backoff on failure. Readings it pushes flow through the
    /// same finalize pipeline as polled readings.
    async fn run_listener(self: Arc<Self>, device: Arc<Device>) {
        let Some(listen) = device.handler().and_then(|h| h.listen_fn()).cloned() else {
            return;
        };

        let mut backoff = LISTEN_BACKOFF_INITIAL;
        debug!(device = device.id(), "starting listener");
        loop {
            if self.stop.is_stopped() {
                break;
            }

            let (sink_tx, mut sink_rx) = mpsc::channel::<ReadContext>(LISTEN_SINK_CAPACITY);
            let forwarder = tokio::spawn({
                let scheduler = self.clone();
                async move {
                    loop {
                        tokio::select! {
                            _ = scheduler.stop.stopped() => break,
                            ctx = sink_rx.recv() => match ctx {
                                Some(ctx) => scheduler.emit(ctx).await,
                                None => break,
                            },
                        }
                    }
                }
            });

            let result = listen(device.clone(), sink_tx).await;
            let _ = forwarder.await;

            match result {
                Ok(()) => {
                    debug!(device = device.id(), "listener completed");
                    break;
                }
                Err(e) => {
                    if self.stop.is_stopped() {
                        break;
                    }
                    let restarts = {
                        let mut restarts = self.restarts.lock();
                        let count = restarts.entry(device.id().to_string()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    let err = PluginError::ListenHandler {
                        device: device.id().to_string(),
                        message: e.to_string(),
                    };
                    warn!(
                        error = %err,
                        restarts,
                        backoff = ?backoff,
                        "listener failed, restarting"
                    );
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(LISTEN_BACKOFF_MAX);
                }
            }
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Register the scheduler's liveness check with the health manager.
    pub fn register_health_checks(
        self: &Arc<Self>,
        health: &HealthManager,
    ) -> PluginResult<JoinHandle<()>> {
        let scheduler = self.clone();
        health.register_periodic(
            "scheduler-liveness",
            LIVENESS_CHECK_INTERVAL,
            move || scheduler.liveness_check(),
            self.stop.clone(),
        )
    }

    /// Fails when any enabled loop has not ticked within three intervals.
    pub fn liveness_check(&self) -> Result<(), String> {
        let now = Instant::now();

        if !self.settings.read.disable && !self.registry.readable_handlers().is_empty() {
            if let Some(last) = *self.last_read_tick.lock() {
                let age = now.duration_since(last);
                if age > 3 * self.settings.read.interval() {
                    return Err(format!("read loop has not ticked in {age:?}"));
                }
            }
        }
        if !self.settings.write.disable && self.registry.has_writable_devices() {
            if let Some(last) = *self.last_write_tick.lock() {
                let age = now.duration_since(last);
                if age > 3 * self.settings.write.interval() {
                    return Err(format!("write loop has not ticked in {age:?}"));
                }
            }
        }
        Ok(())
    }
}

/// Apply the device's transform list to every reading, then merge the
/// device context into each reading's context (device keys win).
///
/// On the first failing transform the error propagates and the context is
/// never handed to the store; values already transformed stay applied to the
/// in-memory readings, which only matters to callers inspecting the dropped
/// context.
pub fn finalize_readings(device: &Device, ctx: &mut ReadContext) -> PluginResult<()> {
    for reading in ctx.readings.iter_mut() {
        for transform in &device.transforms {
            let next = transform.transform(reading.value.clone()).map_err(|e| {
                PluginError::TransformFailed {
                    device: device.id().to_string(),
                    message: e.to_string(),
                }
            })?;
            reading.value = next;
        }
    }
    if !device.context.is_empty() {
        for reading in ctx.readings.iter_mut() {
            for (key, value) in &device.context {
                reading.context.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}
