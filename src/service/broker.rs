use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::{runtime, signal};
use tracing::{info, trace};

use crate::engine::Engine;
use crate::request::{spawn_delay_forwarder, EngineRequestHandler};
use crate::utils::MultipleChannelWorkerPool;
use crate::{AppResult, BrokerConfig};

/// Process bootstrap: builds the runtime, recovers the engine, wires the
/// request pool and the delay-fire forwarder, then runs until ctrl-c and
/// drives the graceful shutdown handshake.
pub struct Broker {
    config: Arc<BrokerConfig>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Broker {
            config: Arc::new(config),
        }
    }

    pub fn start(&self) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

        let engine = rt.block_on(Engine::bootstrap(self.config.clone()))?;

        rt.block_on(async {
            engine.start_tasks(&notify_shutdown, &shutdown_complete_tx);

            // the shared worker pool drains every inbound unit of work;
            // transports submit RequestTasks, the forwarder submits due
            // delay records
            let pool = Arc::new(MultipleChannelWorkerPool::new(
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
                EngineRequestHandler::new(engine.clone()),
                self.config.request_handler_pool.to_pool_config(),
            ));
            spawn_delay_forwarder(engine.clone(), pool.clone(), &notify_shutdown);

            info!(
                "broker {} running with {} request channels",
                self.config.general.id,
                pool.channel_count()
            );
            let _ = signal::ctrl_c().await;
            info!("got shutdown signal");
        });

        // stop every task, then wait until the last holder of a
        // completion sender is gone
        let _ = notify_shutdown.send(());
        drop(shutdown_complete_tx);
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());

        rt.block_on(engine.close())?;
        info!("broker shutdown complete");
        Ok(())
    }
}
