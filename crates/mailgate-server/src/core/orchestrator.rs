//! Owns the full set of per-server connection supervisors and provides
//! a graceful `stop()` the way the top-level process needs at shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::connection::ConnectionSupervisor;
use crate::rest::TicketingClient;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Orchestrator {
    supervisors: Vec<Arc<ConnectionSupervisor>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, client: Arc<dyn TicketingClient>, shutdown: CancellationToken) -> Self {
        let runtime = Arc::new(config.runtime);
        let supervisors = config
            .servers
            .into_iter()
            .map(|server| Arc::new(ConnectionSupervisor::new(server, runtime.clone(), client.clone(), shutdown.clone())))
            .collect();

        Self { supervisors, handles: Vec::new(), shutdown }
    }

    /// Spawns one task per configured server and waits for `shutdown`.
    pub async fn run(&mut self) {
        for supervisor in &self.supervisors {
            let supervisor = supervisor.clone();
            info!(server = supervisor.name(), "starting connection supervisor");
            self.handles.push(tokio::spawn(async move {
                supervisor.run().await;
            }));
        }

        self.shutdown.cancelled().await;
        self.stop().await;
    }

    /// Waits until every supervisor has settled back to idle, polling
    /// every 500ms, per the graceful-shutdown contract.
    pub async fn stop(&mut self) {
        info!("orchestrator stopping, waiting for connections to settle");
        loop {
            let mut all_idle = true;
            for supervisor in &self.supervisors {
                if !supervisor.is_idle().await {
                    all_idle = false;
                    break;
                }
            }
            if all_idle {
                break;
            }
            sleep(STOP_POLL_INTERVAL).await;
        }

        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }
}
