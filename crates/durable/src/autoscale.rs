//! Backlog-driven fleet autoscaling
//!
//! Each retiring worker replaces itself with one successor while work
//! remains, and adds a second one with a probability that shrinks as the
//! fleet approaches its cap. Summed over many independent retirements this
//! grows the fleet toward the cap without any coordination between workers.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use crate::persistence::{FleetSnapshot, LaunchError, LaunchPlanner};

/// Starts a new worker process
#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    /// Request a worker with the given id. Does not wait for it to start.
    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError>;
}

/// Number of successors to launch
///
/// Zero when nothing is deferred. Otherwise one, plus one more with
/// probability `1 - fleet_size / max_fleet_size`.
pub fn launch_count(backlog: u64, fleet_size: u64, max_fleet_size: u64) -> u32 {
    launch_count_with(&mut rand::thread_rng(), backlog, fleet_size, max_fleet_size)
}

/// [`launch_count`] with an explicit random source
pub fn launch_count_with<R: Rng>(
    rng: &mut R,
    backlog: u64,
    fleet_size: u64,
    max_fleet_size: u64,
) -> u32 {
    if backlog == 0 {
        return 0;
    }
    if max_fleet_size == 0 {
        return 1;
    }

    let occupancy = fleet_size as f64 / max_fleet_size as f64;
    if rng.gen::<f64>() >= occupancy {
        2
    } else {
        1
    }
}

/// [`LaunchPlanner`] that applies [`launch_count`] and delegates to a launcher
pub struct Autoscaler {
    launcher: Arc<dyn ComputeLauncher>,
    max_fleet_size: u64,
}

impl Autoscaler {
    pub fn new(launcher: Arc<dyn ComputeLauncher>, max_fleet_size: u64) -> Self {
        Self {
            launcher,
            max_fleet_size,
        }
    }
}

#[async_trait]
impl LaunchPlanner for Autoscaler {
    fn plan(&self, snapshot: FleetSnapshot) -> u32 {
        let count = launch_count(snapshot.backlog, snapshot.fleet_size, self.max_fleet_size);
        info!(
            backlog = snapshot.backlog,
            fleet_size = snapshot.fleet_size,
            max_fleet_size = self.max_fleet_size,
            count,
            "autoscaling decision"
        );
        count
    }

    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError> {
        self.launcher.launch(worker_id).await
    }
}
