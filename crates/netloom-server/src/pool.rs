//! Event-loop pool.
//!
//! A fixed number of independent event loops, each a current-thread Tokio
//! runtime driven by its own OS thread. Anything spawned through a loop's
//! handle runs on that loop's thread and nowhere else, so two tasks pinned to
//! the same loop never execute concurrently. Sessions rely on this instead of
//! locking their own state.
//!
//! # Lifecycle
//!
//! ```text
//!   new ──> run() ──> running ──> stop() ──> stopped ──> run() ...
//! ```
//!
//! Every `run()` builds fresh runtimes and threads; a stopped loop is never
//! resumed. `stop()` signals each loop, lets it tear down whatever work is left
//! on it, and joins every thread before returning.

use std::{
    cell::Cell,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use tokio::{
    runtime::{Builder, Handle},
    sync::oneshot,
};

use crate::{
    config::{LoopSelection, PoolSize},
    error::ServerError,
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// `(pool id, loop index)` of the loop driven by the current thread.
    static CURRENT_LOOP: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// One running loop.
struct EventLoop {
    handle: Handle,
    load: Arc<AtomicUsize>,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// A pin to one loop of the pool.
///
/// While the pin is alive it counts towards the loop's load, which drives
/// [`LoopSelection::LeastLoaded`].
pub struct LoopHandle {
    index: usize,
    handle: Handle,
    load: Arc<AtomicUsize>,
}

impl LoopHandle {
    fn new(index: usize, event_loop: &EventLoop) -> Self {
        event_loop.load.fetch_add(1, Ordering::Relaxed);
        Self { index, handle: event_loop.handle.clone(), load: Arc::clone(&event_loop.load) }
    }

    /// Position of the loop in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Runtime handle of the loop. Tasks spawned on it run on the loop thread.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Fixed-size pool of single-threaded event loops.
pub struct EventLoopPool {
    id: u64,
    size: usize,
    selection: LoopSelection,
    next: AtomicUsize,
    loops: RwLock<Option<Vec<EventLoop>>>,
}

impl EventLoopPool {
    /// Create a stopped pool. `size` is resolved immediately, so the pool
    /// always has at least one loop.
    pub fn new(size: PoolSize, selection: LoopSelection) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            size: size.resolve(),
            selection,
            next: AtomicUsize::new(0),
            loops: RwLock::new(None),
        }
    }

    /// Number of loops this pool runs.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Loop assignment policy.
    pub fn selection(&self) -> LoopSelection {
        self.selection
    }

    /// Whether the loops are currently running.
    pub fn is_running(&self) -> bool {
        self.loops.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Start one worker thread per loop.
    ///
    /// If any runtime or thread cannot be created, the loops started so far are
    /// stopped and joined and the pool stays stopped.
    pub fn run(&self) -> Result<(), ServerError> {
        let mut guard = self.loops.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(ServerError::Lifecycle("event loop pool is already running".into()));
        }

        let mut started = Vec::with_capacity(self.size);
        for index in 0..self.size {
            match self.spawn_loop(index) {
                Ok(event_loop) => started.push(event_loop),
                Err(e) => {
                    tracing::error!(loop_index = index, "failed to start event loop: {}", e);
                    shutdown_loops(started);
                    return Err(e);
                },
            }
        }

        self.next.store(0, Ordering::Relaxed);
        *guard = Some(started);
        tracing::info!(pool_size = self.size, "event loop pool started");
        Ok(())
    }

    fn spawn_loop(&self, index: usize) -> Result<EventLoop, ServerError> {
        let runtime = Builder::new_current_thread().enable_all().build().map_err(|e| {
            ServerError::Resource(format!("failed to build runtime for loop {index}: {e}"))
        })?;
        let handle = runtime.handle().clone();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let pool_id = self.id;

        let thread = thread::Builder::new()
            .name(format!("netloom-loop-{index}"))
            .spawn(move || {
                CURRENT_LOOP.with(|current| current.set(Some((pool_id, index))));
                // A dropped sender ends the loop just like an explicit signal.
                let _ = runtime.block_on(shutdown_rx);
                // Dropping the runtime here tears down the tasks still pinned to
                // this loop on the loop's own thread.
                drop(runtime);
                CURRENT_LOOP.with(|current| current.set(None));
            })
            .map_err(|e| {
                ServerError::Resource(format!("failed to spawn thread for loop {index}: {e}"))
            })?;

        Ok(EventLoop { handle, load: Arc::new(AtomicUsize::new(0)), shutdown, thread })
    }

    /// Signal every loop to stop and join all worker threads.
    ///
    /// No-op when the pool is not running. Fails without side effects when
    /// called from one of this pool's own loop threads, which could never be
    /// joined.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.on_loop_thread() {
            return Err(ServerError::Lifecycle(
                "event loop pool cannot be stopped from one of its own loops".into(),
            ));
        }

        // Release the lock before joining: loop threads may still be selecting.
        let loops = self.loops.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(loops) = loops {
            shutdown_loops(loops);
            tracing::info!(pool_size = self.size, "event loop pool stopped");
        }
        Ok(())
    }

    /// Pin to a loop according to the pool's selection policy.
    ///
    /// `None` when the pool is not running.
    pub fn select(&self) -> Option<LoopHandle> {
        let guard = self.loops.read().unwrap_or_else(PoisonError::into_inner);
        let loops = guard.as_ref()?;
        let index = match self.selection {
            LoopSelection::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % loops.len(),
            LoopSelection::LeastLoaded => loops
                .iter()
                .enumerate()
                .min_by_key(|(i, l)| (l.load.load(Ordering::Relaxed), *i))
                .map_or(0, |(i, _)| i),
        };
        loops.get(index).map(|l| LoopHandle::new(index, l))
    }

    /// Pin to a specific loop. `None` if not running or out of range.
    pub fn pin(&self, index: usize) -> Option<LoopHandle> {
        let guard = self.loops.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref()?.get(index).map(|l| LoopHandle::new(index, l))
    }

    /// Number of live pins per loop. Empty when not running.
    pub fn loads(&self) -> Vec<usize> {
        let guard = self.loops.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|loops| loops.iter().map(|l| l.load.load(Ordering::Relaxed)).collect())
            .unwrap_or_default()
    }

    /// Index of the loop driving the calling thread, if it belongs to this pool.
    pub fn current_loop(&self) -> Option<usize> {
        CURRENT_LOOP
            .with(Cell::get)
            .and_then(|(pool_id, index)| (pool_id == self.id).then_some(index))
    }

    /// Whether the calling thread is one of this pool's loop threads.
    pub fn on_loop_thread(&self) -> bool {
        self.current_loop().is_some()
    }
}

impl Drop for EventLoopPool {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("event loop pool dropped on its own loop: {}", e);
        }
    }
}

impl std::fmt::Debug for EventLoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopPool")
            .field("size", &self.size)
            .field("selection", &self.selection)
            .field("running", &self.is_running())
            .finish()
    }
}

fn shutdown_loops(loops: Vec<EventLoop>) {
    let mut threads = Vec::with_capacity(loops.len());
    for event_loop in loops {
        // The loop may already have exited; nothing to signal then.
        let _ = event_loop.shutdown.send(());
        threads.push(event_loop.thread);
    }
    for thread in threads {
        if thread.join().is_err() {
            tracing::error!("event loop thread panicked");
        }
    }
}
