use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use webterm_containers::ContainerService;

use crate::broker::Broker;
use crate::config::BrokerConfig;

/// Periodic sweeps plus orderly shutdown. One cancellation token stops all
/// three loops.
pub struct Supervisor {
    broker: Arc<Broker>,
    containers: Arc<dyn ContainerService>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn spawn(
        broker: Arc<Broker>,
        containers: Arc<dyn ContainerService>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            broker,
            containers,
            cancel: CancellationToken::new(),
        });

        // Idle-session sweep.
        {
            let broker = supervisor.broker.clone();
            let cancel = supervisor.cancel.clone();
            let period = config.session_sweep_interval;
            let max_idle = config.idle_timeout;
            tokio::spawn(async move {
                let mut ticks = interval(period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {
                            let reaped = broker.sweep_idle(max_idle);
                            if reaped > 0 {
                                info!(reaped, "idle session sweep");
                            }
                        }
                    }
                }
            });
        }

        // Health sweep.
        {
            let broker = supervisor.broker.clone();
            let cancel = supervisor.cancel.clone();
            let period = config.health_sweep_interval;
            tokio::spawn(async move {
                let mut ticks = interval(period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {
                            let sweep = broker.sweep_health();
                            if sweep.dead_channels + sweep.stuck_connecting > 0 {
                                info!(
                                    dead_channels = sweep.dead_channels,
                                    stuck_connecting = sweep.stuck_connecting,
                                    "health sweep"
                                );
                            }
                        }
                    }
                }
            });
        }

        // Idle-container sweep.
        {
            let containers = supervisor.containers.clone();
            let cancel = supervisor.cancel.clone();
            let period = config.container_sweep_interval;
            let max_idle = config.idle_timeout;
            tokio::spawn(async move {
                let mut ticks = interval(period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {
                            match containers.reap_idle(max_idle).await {
                                Ok(0) => {}
                                Ok(reaped) => info!(reaped, "idle container sweep"),
                                Err(err) => warn!(%err, "idle container sweep failed"),
                            }
                        }
                    }
                }
            });
        }

        supervisor
    }

    /// Orderly shutdown: stop the sweeps, notify and destroy every
    /// session, then stop every remaining container.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.cancel.cancel();

        self.broker.shutdown();

        match self.containers.list().await {
            Ok(records) => {
                for record in records {
                    if let Err(err) = self.containers.stop(&record.container_id).await {
                        error!(container_id = %record.container_id, %err, "failed to stop container at shutdown");
                    }
                }
            }
            Err(err) => error!(%err, "failed to list containers at shutdown"),
        }
    }
}
