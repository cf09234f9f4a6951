//! The periodic background sweep of the overlay cache.

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::OverlayCache;
use crate::config::ConfigHandle;
use crate::metrics::{PerformanceMonitor, OP_SWEEP};
use crate::prelude::*;

/// Runs [`OverlayCache::sweep`] on the configured interval between [`Self::start`] and [`Self::stop`].
pub struct OverlaySweeper {
    overlay: Arc<OverlayCache>,
    config: ConfigHandle,
    metrics: Arc<PerformanceMonitor>,
    running: Mutex<Option<CancellationToken>>,
}

impl OverlaySweeper {
    /// Creates a stopped sweeper.
    pub fn new(overlay: Arc<OverlayCache>, config: ConfigHandle, metrics: Arc<PerformanceMonitor>) -> Self {
        Self {
            overlay,
            config,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Spawns the sweep loop on `runtime`. Returns `false` if it is already running.
    pub fn start(&self, runtime: &Handle) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        let (overlay, config, metrics) = (Arc::clone(&self.overlay), self.config.clone(), Arc::clone(&self.metrics));
        runtime.spawn(async move {
            loop {
                // Re-read every round so interval changes apply without a restart
                let interval = config.load().sweep_interval;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        sweep_once(&overlay, &metrics);
                    }
                }
            }
            debug!("Overlay sweeper stopped");
        });
        true
    }

    /// Stops the sweep loop. Returns `false` if it wasn't running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Checks if the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Sweeps once on the calling thread.
    pub fn sweep_now(&self) -> usize {
        sweep_once(&self.overlay, &self.metrics)
    }
}

impl Drop for OverlaySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_once(overlay: &OverlayCache, metrics: &PerformanceMonitor) -> usize {
    let removed = metrics.time(OP_SWEEP, || overlay.sweep());
    if removed > 0 {
        trace!(removed, "Swept empty overlay entries");
    }
    removed
}
