//! Background execution of post-commit work.
//!
//! - [`TenantLanes`]: one FIFO task per tenant. Jobs of a tenant run one at a
//!   time in submission order; tenants progress independently. A lane whose
//!   queue runs dry retires and leaves the table.
//! - [`InFlight`]: counts spawned side effects so shutdown (and tests) can
//!   wait for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use marketplace_core::TenantId;

pub type LaneJob = BoxFuture<'static, ()>;

#[derive(Debug)]
struct Lane {
    id: u64,
    jobs: mpsc::UnboundedSender<LaneJob>,
}

type LaneTable = Arc<Mutex<HashMap<TenantId, Lane>>>;

fn lock_table(table: &LaneTable) -> MutexGuard<'_, HashMap<TenantId, Lane>> {
    match table.lock() {
        Ok(lanes) => lanes,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
pub struct TenantLanes {
    lanes: LaneTable,
    next_id: AtomicU64,
}

impl TenantLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind every job previously submitted for `tenant_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, tenant_id: TenantId, job: LaneJob) {
        let mut lanes = lock_table(&self.lanes);

        let job = match lanes.get(&tenant_id) {
            Some(lane) => match lane.jobs.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => {
                    // The lane task died (a job panicked); start a fresh one.
                    warn!(tenant_id = %tenant_id, "tenant lane restarted");
                    job
                }
            },
            None => job,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let jobs = spawn_lane(self.lanes.clone(), tenant_id, id);
        let _ = jobs.send(job);
        lanes.insert(tenant_id, Lane { id, jobs });
    }

    pub fn lane_count(&self) -> usize {
        lock_table(&self.lanes).len()
    }
}

/// Run jobs until the queue is empty, then retire. The emptiness check holds
/// the table lock, which `submit` also holds while sending, so a job is never
/// left behind in a retired lane.
fn spawn_lane(table: LaneTable, tenant_id: TenantId, id: u64) -> mpsc::UnboundedSender<LaneJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
    tokio::spawn(async move {
        loop {
            let job = match rx.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    let mut lanes = lock_table(&table);
                    match rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            if lanes.get(&tenant_id).is_some_and(|lane| lane.id == id) {
                                lanes.remove(&tenant_id);
                            }
                            debug!(tenant_id = %tenant_id, "tenant lane idle, retired");
                            return;
                        }
                    }
                }
            };
            job.await;
        }
    });
    tx
}

/// Counter of running background side effects.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { owner: self.clone() }
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a running side effect; dropping it marks the effect finished.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.owner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.idle.notify_waiters();
        }
    }
}
