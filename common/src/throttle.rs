//! Process-wide resource limits for file transfers.
//!
//! Three independent token semaphores, each disabled until configured:
//!
//! 1. **Open files** - every transfer holds one permit while its source and destination
//!    handles are open; permits are returned when the guard drops.
//! 2. **Ops** - one token per entry produced by the tree walker.
//! 3. **IOPS** - one token per chunk moved by a transfer.
//!
//! Ops and IOPS tokens are consumed (forgotten) and refilled by a replenish task that runs
//! every [`REPLENISH_INTERVAL`]:
//!
//! ```rust,no_run
//! # async fn example() {
//! // 500 walked entries per second
//! common::throttle::init_ops_tokens(50);
//! tokio::spawn(common::throttle::run_ops_replenish_thread(50));
//! common::throttle::get_ops_token().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

pub const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
/// Replenish ticks per second, i.e. the smallest non-zero rate that can be expressed
pub const REPLENISH_PER_SEC: usize = 10;

struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    fn setup(&self, value: usize) {
        self.enabled.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        // the semaphores are never closed
        self.sem.acquire().await.ok()
    }

    async fn consume(&self) {
        if let Some(permit) = self.acquire().await {
            permit.forget();
        }
    }

    async fn run_replenish_thread(&self, replenish: usize) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let mut interval = tokio::time::interval(REPLENISH_INTERVAL);
        loop {
            interval.tick().await;
            let curr_permits = self.sem.available_permits();
            if curr_permits < replenish {
                self.sem.add_permits(replenish - curr_permits);
            }
        }
    }
}

static OPEN_FILES_LIMIT: Semaphore = Semaphore::new();
static OPS_THROTTLE: Semaphore = Semaphore::new();
static IOPS_THROTTLE: Semaphore = Semaphore::new();

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

/// Holds an open-files permit (if the limit is enabled) until dropped.
pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(tokens_per_interval: usize) {
    OPS_THROTTLE.setup(tokens_per_interval);
}

pub fn init_iops_tokens(tokens_per_interval: usize) {
    IOPS_THROTTLE.setup(tokens_per_interval);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume().await;
}

pub async fn get_iops_token() {
    IOPS_THROTTLE.consume().await;
}

pub async fn run_ops_replenish_thread(tokens_per_interval: usize) {
    OPS_THROTTLE.run_replenish_thread(tokens_per_interval).await;
}

pub async fn run_iops_replenish_thread(tokens_per_interval: usize) {
    IOPS_THROTTLE.run_replenish_thread(tokens_per_interval).await;
}

/// Convert a per-second rate into tokens handed out every [`REPLENISH_INTERVAL`].
#[must_use]
pub fn tokens_per_interval(per_second: usize) -> usize {
    per_second / REPLENISH_PER_SEC
}
