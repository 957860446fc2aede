use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rotary_config::ConfigStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    context::SchedulerContext,
    engines::helper::{HelperActivation, HelperSpoofer},
    error::SchedulerError,
    scheduler::{ActivationScheduler, SchedulerOptions},
};

/// Owns the scheduler and drives it on a blocking thread, stopping it on
/// Ctrl-C.
pub struct AgentDaemon {
    scheduler: ActivationScheduler,
    shutdown: CancellationToken,
}

impl AgentDaemon {
    pub fn new(store: &ConfigStore, once: bool) -> Result<Self> {
        let report = store.report();
        if !report.is_valid() {
            let err = SchedulerError::ConfigInvalid(report.clone());
            error!(kind = err.kind(), "{err}");
            return Err(err).context(format!("Refusing to start with {}", store.path().display()));
        }

        let config = store.snapshot();
        let Some(spoofer_path) = config.spoofer_path.clone() else {
            bail!("spoofer_path is not configured");
        };
        let Some(activator_path) = config.activator_path.clone() else {
            bail!("activator_path is not configured");
        };

        let spoofer = HelperSpoofer::new(spoofer_path, config.driver_path.clone());
        let activation = HelperActivation::new(activator_path);
        let ctx = SchedulerContext::open(config).context("Failed to open data files")?;

        let shutdown = CancellationToken::new();
        let scheduler = ActivationScheduler::new(ctx, Arc::new(spoofer), Arc::new(activation))
            .with_shutdown_token(shutdown.clone())
            .with_options(SchedulerOptions {
                max_cycles: once.then_some(1),
                ..Default::default()
            });

        Ok(Self {
            scheduler,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            mut scheduler,
            shutdown,
        } = self;

        let mut worker = tokio::task::spawn_blocking(move || {
            let result = scheduler.run();
            scheduler.cleanup();
            result
        });

        tokio::select! {
            result = &mut worker => {
                return Ok(result.context("Scheduler thread panicked")??);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("received Ctrl-C, finishing the current identity");
                shutdown.cancel();
            }
        }

        worker.await.context("Scheduler thread panicked")??;
        Ok(())
    }
}

pub async fn run(store: ConfigStore, once: bool) -> Result<()> {
    let daemon = AgentDaemon::new(&store, once)?;
    info!(config = %store.path().display(), once, "starting activation scheduler");
    daemon.run().await
}
