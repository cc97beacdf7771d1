//! Per-client launch budgets.
//!
//! Each client draws from its own bucket of worker launches, refilled at a
//! fixed rate. A submission costs one unit per worker it asks for, so a
//! ten-worker request drains ten times what a one-worker request does. Every
//! other non-probe request costs [`REQUEST_COST`].

use fanout_core::SecurityConfig;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Units charged for a request that launches no workers.
pub const REQUEST_COST: u32 = 1;

struct Bucket {
    units: f64,
    last_refill: Instant,
}

/// A refused charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Denied {
    /// Units the request would have cost.
    pub cost: u32,
    /// Wait until the bucket covers `cost`; `None` when it never can.
    pub retry_after: Option<Duration>,
}

/// A granted charge. Hand it back to [`LaunchBudget::refund`] if nothing launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    client: String,
    cost: u32,
}

impl Charge {
    /// Units taken.
    pub fn cost(&self) -> u32 {
        self.cost
    }
}

/// Token buckets of worker launches, one per client key.
pub struct LaunchBudget {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl LaunchBudget {
    /// A budget holding at most `capacity` units per client, regaining
    /// `refill_per_sec` units every second.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// A budget sized by the `[security]` section.
    pub fn from_config(security: &SecurityConfig) -> Self {
        Self::new(
            security.worker_launch_burst,
            security.worker_launches_per_second,
        )
    }

    /// Take `cost` units from `client`'s bucket, or report how long until it could.
    pub async fn charge(&self, client: &str, cost: u32) -> Result<Charge, Denied> {
        let wanted = f64::from(cost);
        if wanted > self.capacity {
            return Err(Denied {
                cost,
                retry_after: None,
            });
        }

        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(client.to_string()).or_insert(Bucket {
            units: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.units = (bucket.units + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.units >= wanted {
            bucket.units -= wanted;
            Ok(Charge {
                client: client.to_string(),
                cost,
            })
        } else {
            let deficit = wanted - bucket.units;
            Err(Denied {
                cost,
                retry_after: Duration::try_from_secs_f64(deficit / self.refill_per_sec).ok(),
            })
        }
    }

    /// Return a charge whose submission launched nothing.
    pub async fn refund(&self, charge: Charge) {
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get_mut(&charge.client) {
            bucket.units = (bucket.units + f64::from(charge.cost)).min(self.capacity);
            debug!(client = %charge.client, units = charge.cost, "Refunded launch budget");
        }
    }

    /// Drop buckets idle for at least `max_idle`. Returns how many remain.
    pub async fn cleanup(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
        buckets.len()
    }
}
