// src/dependency_graph.rs
//
// The `provides` coalescing timer. Grounded on `control.rs`'s single-`Notify`
// gate pattern (one pending-state guard shared by every caller instead of
// spawning a fresh timer per call) but built on `tokio::time::sleep` rather
// than a `Notify`, since the semantics here are "coalesce for ~2s then
// commit once" rather than "wait until someone else flips a flag".

use crate::supervisor::Supervisor;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

const COALESCE_WINDOW: Duration = Duration::from_secs(2);

struct Pending {
    targets: HashSet<String>,
    armed: bool,
}

pub struct DependencyGraph {
    supervisor: Arc<Supervisor>,
    pending: Mutex<Pending>,
}

impl DependencyGraph {
    pub fn new(supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new(DependencyGraph {
            supervisor,
            pending: Mutex::new(Pending {
                targets: HashSet::new(),
                armed: false,
            }),
        })
    }

    /// Queues `targets` for a delayed commit into `Supervisor.provides`.
    /// Repeat calls inside the coalescing window extend the pending set
    /// without arming a second timer.
    pub async fn provide(self: &Arc<Self>, targets: HashSet<String>) {
        let mut pending = self.pending.lock().await;
        pending.targets.extend(targets);

        if pending.armed {
            return;
        }
        pending.armed = true;
        drop(pending);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COALESCE_WINDOW).await;
            this.commit().await;
        });
    }

    async fn commit(self: Arc<Self>) {
        let targets = {
            let mut pending = self.pending.lock().await;
            pending.armed = false;
            std::mem::take(&mut pending.targets)
        };
        if !targets.is_empty() {
            self.supervisor.commit_provides(targets).await;
        }
    }

    /// Removes targets immediately; only the Supervisor calls this, when a
    /// job advertising them leaves RUNNING and no other job still does.
    pub async fn revoke(&self, targets: &HashSet<String>) {
        self.supervisor.revoke_provides(targets).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::process_events::spawn_poll;

    #[tokio::test]
    async fn repeat_provide_calls_within_window_coalesce_to_one_commit() {
        let handle = spawn_poll(Duration::from_millis(50));
        let supervisor = Supervisor::new(AppConfig::dummy(), handle.source);
        let graph = DependencyGraph::new(supervisor.clone());

        let mut a = HashSet::new();
        a.insert("net".to_string());
        graph.provide(a).await;

        let mut b = HashSet::new();
        b.insert("disk".to_string());
        graph.provide(b).await;

        tokio::time::sleep(Duration::from_millis(2200)).await;

        let provides = supervisor.snapshot_provides().await;
        assert!(provides.contains("net"));
        assert!(provides.contains("disk"));
    }
}
