//! Generic warm pool over opaque resource ids. The pool pre-allocates
//! resources towards a desired size, hands them to pods, and parks freed
//! resources in a cool down queue before they become eligible again.

use std::collections::{HashMap, VecDeque};

use tokio::time::{Duration, Instant};
use tracing::{info, trace, warn};

use crate::error::{Error, Result};

/// Tuning knobs for a node's warm pool.
#[derive(Debug, Clone)]
pub struct WarmPoolConfig {
    /// Target number of warm resources after a reconcile.
    pub desired_size: usize,
    /// Floor on the total resources; a create job is emitted when the pool
    /// falls below it.
    pub min_desired_size: usize,
    /// Hysteresis band; the pool does not act while the distance from the
    /// desired size stays within it.
    pub max_deviation: usize,
    /// Head room subtracted from the node capacity.
    pub reserved_size: usize,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            desired_size: crate::config::IPV4_DEFAULT_WARM_POOL_SIZE,
            min_desired_size: crate::config::IPV4_DEFAULT_MIN_WARM_POOL_SIZE,
            max_deviation: crate::config::IPV4_DEFAULT_MAX_DEVIATION,
            reserved_size: crate::config::IPV4_DEFAULT_RESERVED_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
    ProcessDeleteQueue,
    ReconcileNotRequired,
}

/// Unit of work handed to the resource provider's worker pool.
#[derive(Debug, Clone)]
pub struct WarmPoolJob {
    pub node_name: String,
    pub operation: Operation,
    pub resource_count: usize,
    pub resources: Vec<String>,
}

impl WarmPoolJob {
    pub fn reconcile_not_required(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            operation: Operation::ReconcileNotRequired,
            resource_count: 0,
            resources: Vec::new(),
        }
    }

    pub fn process_delete_queue(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            operation: Operation::ProcessDeleteQueue,
            resource_count: 0,
            resources: Vec::new(),
        }
    }
}

struct CooldownResource {
    id: String,
    freed_at: Instant,
}

/// Action the sizing arithmetic asks for, before any state is touched.
enum PoolDelta {
    Create(usize),
    Delete(usize),
    None,
}

/// Warm pool state for a single node. Callers wrap the pool in a lock; the
/// methods themselves assume exclusive access.
pub struct ResourcePool {
    node_name: String,
    config: WarmPoolConfig,
    /// Free resources, oldest first.
    warm: VecDeque<String>,
    /// Pod uid to assigned resource id.
    used: HashMap<String, String>,
    /// Creates in flight on the worker pool.
    pending: usize,
    cooldown: VecDeque<CooldownResource>,
    capacity: usize,
}

impl ResourcePool {
    pub fn new(
        node_name: &str,
        config: WarmPoolConfig,
        used: HashMap<String, String>,
        warm: Vec<String>,
        capacity: usize,
    ) -> Self {
        info!(
            msg = "initialized resource pool",
            node = node_name,
            warm = warm.len(),
            used = used.len(),
            capacity
        );
        Self {
            node_name: node_name.to_string(),
            config,
            warm: warm.into(),
            used,
            pending: 0,
            cooldown: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand a warm resource to the pod. Re-issues the previous assignment
    /// when the pod already holds one.
    pub fn assign_resource(&mut self, pod_uid: &str) -> Result<String> {
        if let Some(existing) = self.used.get(pod_uid) {
            trace!(
                msg = "pod already owns a resource",
                node = self.node_name,
                pod_uid
            );
            return Ok(existing.clone());
        }
        let id = self
            .warm
            .pop_front()
            .ok_or_else(|| Error::PoolEmpty(self.node_name.clone()))?;
        self.used.insert(pod_uid.to_string(), id.clone());
        Ok(id)
    }

    /// Return the pod's resource to the cool down queue and forget the
    /// assignment.
    pub fn free_resource(&mut self, pod_uid: &str) -> Result<String> {
        let id = self.used.remove(pod_uid).ok_or_else(|| {
            Error::UnknownResource(self.node_name.clone(), pod_uid.to_string())
        })?;
        self.cooldown.push_back(CooldownResource {
            id: id.clone(),
            freed_at: Instant::now(),
        });
        Ok(id)
    }

    fn max_total(&self) -> usize {
        self.capacity.saturating_sub(self.config.reserved_size)
    }

    fn total(&self) -> usize {
        self.used.len() + self.warm.len() + self.pending
    }

    /// Distance of the warm set from its target, the single place the
    /// sizing arithmetic lives.
    fn compute_delta(&self) -> PoolDelta {
        let warm_and_pending = self.warm.len() + self.pending;

        if warm_and_pending < self.config.desired_size {
            let deviation = self.config.desired_size - warm_and_pending;
            let below_min = self.total() < self.config.min_desired_size;
            if below_min || deviation > self.config.max_deviation {
                let head_room = self.max_total().saturating_sub(self.total());
                let count = deviation.min(head_room);
                if count > 0 {
                    return PoolDelta::Create(count);
                }
            }
        } else {
            let deviation = warm_and_pending - self.config.desired_size;
            if deviation > self.config.max_deviation {
                let surplus = deviation.min(self.warm.len());
                if surplus > 0 {
                    return PoolDelta::Delete(surplus);
                }
            }
        }

        PoolDelta::None
    }

    /// Pure decision over the current state. Emitting a create job bumps
    /// the pending count so the decision is idempotent until the worker
    /// reports back through [`ResourcePool::update_pool`].
    pub fn reconcile_pool(&mut self) -> WarmPoolJob {
        match self.compute_delta() {
            PoolDelta::Create(count) => {
                self.pending += count;
                trace!(
                    msg = "pool below target, creating resources",
                    node = self.node_name,
                    count
                );
                WarmPoolJob {
                    node_name: self.node_name.clone(),
                    operation: Operation::Create,
                    resource_count: count,
                    resources: Vec::new(),
                }
            }
            PoolDelta::Delete(surplus) => {
                let resources: Vec<String> = (0..surplus)
                    .filter_map(|_| self.warm.pop_back())
                    .collect();
                trace!(
                    msg = "pool above target, deleting resources",
                    node = self.node_name,
                    count = resources.len()
                );
                WarmPoolJob {
                    node_name: self.node_name.clone(),
                    operation: Operation::Delete,
                    resource_count: resources.len(),
                    resources,
                }
            }
            PoolDelta::None => WarmPoolJob::reconcile_not_required(&self.node_name),
        }
    }

    /// Move cooled down resources back to the warm set, oldest first. A
    /// resource the pool no longer has room for is returned for deletion
    /// instead.
    pub fn process_cooldown_queue(&mut self, cool_down: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut to_delete = Vec::new();
        while let Some(head) = self.cooldown.front() {
            if now.duration_since(head.freed_at) < cool_down {
                break;
            }
            // Entries behind the head are younger, FIFO keeps the pass cheap.
            let head = self.cooldown.pop_front().expect("head checked above");
            if self.total() < self.max_total() {
                self.warm.push_back(head.id);
            } else {
                to_delete.push(head.id);
            }
        }
        to_delete
    }

    /// Commit the outcome of a worker job. Returns whether the state now
    /// warrants another reconcile pass.
    pub fn update_pool(&mut self, job: &WarmPoolJob, did_succeed: bool) -> bool {
        match job.operation {
            Operation::Create => {
                assert!(
                    self.pending >= job.resource_count,
                    "pending create count underflow on node {}",
                    self.node_name
                );
                self.pending -= job.resource_count;
                if !did_succeed {
                    warn!(
                        msg = "create job failed, keeping partial results",
                        node = self.node_name,
                        created = job.resources.len(),
                        requested = job.resource_count
                    );
                }
                // The job carries whatever was actually created, which on
                // failure can be a prefix of the requested count.
                for id in &job.resources {
                    self.warm.push_back(id.clone());
                }
            }
            Operation::Delete => {
                if !did_succeed {
                    // Failed deletions come back in the job, the resources
                    // still exist on the instance.
                    warn!(
                        msg = "delete job failed, re-adding survivors",
                        node = self.node_name,
                        failed = job.resources.len()
                    );
                    for id in &job.resources {
                        self.warm.push_back(id.clone());
                    }
                }
            }
            Operation::ProcessDeleteQueue | Operation::ReconcileNotRequired => {}
        }
        self.reconcile_needed()
    }

    fn reconcile_needed(&self) -> bool {
        !matches!(self.compute_delta(), PoolDelta::None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const NODE: &str = "test-node";

    fn config() -> WarmPoolConfig {
        WarmPoolConfig {
            desired_size: 3,
            min_desired_size: 2,
            max_deviation: 1,
            reserved_size: 0,
        }
    }

    fn pool_with(warm: &[&str], capacity: usize) -> ResourcePool {
        ResourcePool::new(
            NODE,
            config(),
            HashMap::new(),
            warm.iter().map(|s| s.to_string()).collect(),
            capacity,
        )
    }

    #[test]
    fn test_assign_pops_oldest_warm_resource() {
        let mut pool = pool_with(&["10.0.0.1", "10.0.0.2"], 10);

        assert_eq!(pool.assign_resource("uid-1").unwrap(), "10.0.0.1");
        assert_eq!(pool.assign_resource("uid-2").unwrap(), "10.0.0.2");
        let err = pool.assign_resource("uid-3").unwrap_err();
        assert!(matches!(err, Error::PoolEmpty(_)));
    }

    #[test]
    fn test_assign_is_idempotent_per_pod() {
        let mut pool = pool_with(&["10.0.0.1", "10.0.0.2"], 10);

        assert_eq!(pool.assign_resource("uid-1").unwrap(), "10.0.0.1");
        assert_eq!(pool.assign_resource("uid-1").unwrap(), "10.0.0.1");
        assert_eq!(pool.warm.len(), 1);
    }

    #[test]
    fn test_free_unknown_pod_fails() {
        let mut pool = pool_with(&[], 10);
        assert!(pool.free_resource("uid-1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freed_resource_not_reassignable_within_cooldown() {
        let mut pool = pool_with(&["10.0.0.1"], 10);

        assert_eq!(pool.assign_resource("uid-1").unwrap(), "10.0.0.1");
        assert_eq!(pool.free_resource("uid-1").unwrap(), "10.0.0.1");

        // Inside the cool down window the resource stays parked.
        tokio::time::advance(Duration::from_secs(29)).await;
        pool.process_cooldown_queue(Duration::from_secs(30));
        assert!(matches!(
            pool.assign_resource("uid-2").unwrap_err(),
            Error::PoolEmpty(_)
        ));

        tokio::time::advance(Duration::from_secs(2)).await;
        pool.process_cooldown_queue(Duration::from_secs(30));
        assert_eq!(pool.assign_resource("uid-2").unwrap(), "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_queue_drains_in_insertion_order() {
        let mut pool = pool_with(&["a", "b", "c"], 10);
        let cool_down = Duration::from_secs(30);

        for (uid, at) in [("uid-a", 0), ("uid-b", 10), ("uid-c", 10)] {
            tokio::time::advance(Duration::from_secs(at)).await;
            pool.assign_resource(uid).unwrap();
            pool.free_resource(uid).unwrap();
        }
        // t=20s: freed at 0s, 10s and 20s respectively.

        tokio::time::advance(Duration::from_secs(11)).await; // t=31s
        pool.process_cooldown_queue(cool_down);
        assert_eq!(pool.warm, VecDeque::from(["a".to_string()]));

        tokio::time::advance(Duration::from_secs(10)).await; // t=41s
        pool.process_cooldown_queue(cool_down);
        assert_eq!(pool.warm.len(), 2);

        tokio::time::advance(Duration::from_secs(10)).await; // t=51s
        pool.process_cooldown_queue(cool_down);
        assert_eq!(
            pool.warm,
            VecDeque::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_reconcile_creates_towards_desired_size() {
        let mut pool = pool_with(&[], 10);

        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::Create);
        assert_eq!(job.resource_count, 3);
        assert_eq!(pool.pending, 3);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut pool = pool_with(&[], 10);

        let first = pool.reconcile_pool();
        assert_eq!(first.operation, Operation::Create);

        // The pending count covers the in-flight create, a second pass on
        // the same state is a no-op.
        let second = pool.reconcile_pool();
        assert_eq!(second.operation, Operation::ReconcileNotRequired);
        let third = pool.reconcile_pool();
        assert_eq!(third.operation, Operation::ReconcileNotRequired);
    }

    #[test]
    fn test_reconcile_respects_deviation_band() {
        // warm = 2, desired = 3, deviation 1 is within the band and above
        // the minimum: nothing to do.
        let mut pool = pool_with(&["a", "b"], 10);
        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::ReconcileNotRequired);
    }

    #[test]
    fn test_reconcile_deletes_surplus() {
        let mut pool = pool_with(&["a", "b", "c", "d", "e"], 10);

        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::Delete);
        assert_eq!(job.resources, vec!["e".to_string(), "d".to_string()]);
        assert_eq!(pool.warm.len(), 3);
    }

    #[test]
    fn test_reconcile_caps_create_at_capacity() {
        let mut pool = pool_with(&[], 2);

        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::Create);
        assert_eq!(job.resource_count, 2);

        // Capacity exhausted, even though the pool is below desired size.
        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::ReconcileNotRequired);
    }

    #[test]
    fn test_update_pool_commits_created_resources() {
        let mut pool = pool_with(&[], 10);

        let mut job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::Create);

        job.resources = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let should_reconcile = pool.update_pool(&job, true);
        assert!(!should_reconcile);
        assert_eq!(pool.pending, 0);
        assert_eq!(pool.warm.len(), 3);
    }

    #[test]
    fn test_update_pool_partial_create_triggers_reconcile() {
        let mut pool = pool_with(&[], 10);

        let mut job = pool.reconcile_pool();
        assert_eq!(job.resource_count, 3);

        // Only one of three came up before the cloud call failed.
        job.resources = vec!["a".to_string()];
        let should_reconcile = pool.update_pool(&job, false);
        assert!(should_reconcile);
        assert_eq!(pool.pending, 0);
        assert_eq!(pool.warm.len(), 1);
    }

    #[test]
    fn test_update_pool_failed_delete_readds_survivors() {
        let mut pool = pool_with(&["a", "b", "c", "d", "e"], 10);

        let job = pool.reconcile_pool();
        assert_eq!(job.operation, Operation::Delete);

        // Both deletions failed, the ids are still live on the instance.
        pool.update_pool(&job, false);
        assert_eq!(pool.warm.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooled_down_resource_beyond_capacity_is_deleted() {
        // Three resources on an instance that only has room for two, as
        // after a capacity downgrade observed on restart.
        let mut pool = pool_with(&["a", "b", "c"], 2);
        pool.assign_resource("uid-1").unwrap();
        pool.free_resource("uid-1").unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let to_delete = pool.process_cooldown_queue(Duration::from_secs(30));
        assert_eq!(to_delete, vec!["a".to_string()]);
        assert_eq!(pool.warm.len(), 2);
    }
}
