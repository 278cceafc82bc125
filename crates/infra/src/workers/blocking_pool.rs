//! Bounded pool of dedicated threads for blocking policy-engine calls.
//!
//! Request handling runs on the async runtime; anything that may block
//! (`enforce`, snapshot assembly, store IO behind mutations) is shipped here
//! instead. Capacity is `threads + queue_capacity` permits. A caller that
//! cannot obtain a permit within `dispatch_wait` gets `PoolError::Saturated`
//! rather than queuing without bound.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

use warden_core::WardenError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct BlockingPoolConfig {
    /// Worker threads
    pub threads: usize,
    /// Jobs allowed to wait beyond the ones running
    pub queue_capacity: usize,
    /// How long a caller may wait for a free slot
    pub dispatch_wait: Duration,
    /// Thread name prefix
    pub name: String,
}

impl Default for BlockingPoolConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            queue_capacity: 1024,
            dispatch_wait: Duration::from_millis(50),
            name: "policy-worker".to_string(),
        }
    }
}

impl BlockingPoolConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_dispatch_wait(mut self, wait: Duration) -> Self {
        self.dispatch_wait = wait;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool saturated")]
    Saturated,

    #[error("worker pool shut down")]
    ShutDown,

    #[error("job panicked on a worker thread")]
    JobPanicked,
}

impl From<PoolError> for WardenError {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::Saturated | PoolError::ShutDown => WardenError::WorkerPoolSaturated,
            PoolError::JobPanicked => WardenError::store("policy evaluation panicked"),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub threads: usize,
    pub capacity: usize,
    pub in_flight: usize,
    pub dispatched: u64,
    pub rejected: u64,
}

pub struct BlockingPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    permits: Arc<Semaphore>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    config: BlockingPoolConfig,
    capacity: usize,
    dispatched: AtomicU64,
    rejected: AtomicU64,
}

impl core::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BlockingPool {
    pub fn new(config: BlockingPoolConfig) -> std::io::Result<Self> {
        let threads = config.threads.max(1);
        let capacity = threads + config.queue_capacity;
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let name = format!("{}-{i}", config.name);
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                debug!(worker = %name, "worker started");
                loop {
                    let job = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }
                debug!(worker = %name, "worker stopped");
            })?;
            workers.push(handle);
        }

        info!(name = %config.name, threads, capacity, "blocking pool started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            permits: Arc::new(Semaphore::new(capacity)),
            workers: Mutex::new(workers),
            config,
            capacity,
            dispatched: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Runs `f` on a worker thread and awaits its result.
    pub async fn run<F, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::ShutDown),
            Err(TryAcquireError::NoPermits) => {
                match tokio::time::timeout(self.config.dispatch_wait, self.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::ShutDown),
                    Err(_) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(name = %self.config.name, capacity = self.capacity, "worker pool saturated");
                        return Err(PoolError::Saturated);
                    }
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let out = std::panic::catch_unwind(AssertUnwindSafe(f));
            drop(permit);
            match out {
                Ok(value) => {
                    let _ = tx.send(value);
                }
                Err(_) => error!("job panicked on worker thread"),
            }
        });

        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(PoolError::ShutDown)?;
            sender.send(job).map_err(|_| PoolError::ShutDown)?;
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        rx.await.map_err(|_| PoolError::JobPanicked)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.config.threads.max(1),
            capacity: self.capacity,
            in_flight: self.capacity.saturating_sub(self.permits.available_permits()),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work, lets queued jobs finish and joins the workers.
    ///
    /// Blocks the calling thread; call from a blocking context.
    pub fn shutdown(&self) {
        self.permits.close();
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for w in workers {
            let _ = w.join();
        }
        info!(name = %self.config.name, "blocking pool stopped");
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        // Workers exit once the channel closes; they are not joined here.
        self.permits.close();
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[tokio::test]
    async fn runs_closure_off_the_runtime() {
        let pool = BlockingPool::new(BlockingPoolConfig::default().with_threads(2)).unwrap();
        let name = pool
            .run(|| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert!(name.unwrap().starts_with("policy-worker-"));
    }

    #[tokio::test]
    async fn saturated_pool_fails_fast() {
        let pool = Arc::new(
            BlockingPool::new(
                BlockingPoolConfig::default()
                    .with_threads(1)
                    .with_queue_capacity(0)
                    .with_dispatch_wait(Duration::from_millis(20)),
            )
            .unwrap(),
        );

        let gate = Arc::new(Barrier::new(2));
        let busy = {
            let pool = pool.clone();
            let gate = gate.clone();
            tokio::spawn(async move { pool.run(move || gate.wait()).await })
        };
        while pool.stats().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.run(|| ()).await, Err(PoolError::Saturated));
        assert_eq!(pool.stats().rejected, 1);

        gate.wait();
        busy.await.unwrap().unwrap();
        assert_eq!(pool.run(|| 7).await, Ok(7));
    }

    #[tokio::test]
    async fn panicking_job_is_reported_and_pool_survives() {
        let pool = BlockingPool::new(BlockingPoolConfig::default().with_threads(1)).unwrap();
        let result: Result<(), PoolError> = pool.run(|| panic!("boom")).await;
        assert_eq!(result, Err(PoolError::JobPanicked));
        assert_eq!(pool.run(|| 1 + 1).await, Ok(2));
    }
}
