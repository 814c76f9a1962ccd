use crate::config::schema::PresenceConfig;
use crate::session::page::{eval_as, PageHandle};
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BUSY_SCRIPT: &str = "/*cp:busy*/ !!document.querySelector('.loading-overlay')";

const AREA_WIDTH: f64 = 1200.0;
const AREA_HEIGHT: f64 = 800.0;

/// Start the idle pointer loop. It follows the controller's current page
/// through relaunches and stops when `cancel` fires.
pub fn spawn(
    config: PresenceConfig,
    pages: watch::Receiver<Option<PageHandle>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut position = (AREA_WIDTH / 2.0, AREA_HEIGHT / 2.0);
        loop {
            let wait = next_interval(&config);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let Some(page) = pages.borrow().clone() else {
                continue;
            };

            match eval_as::<Option<bool>>(page.as_ref(), BUSY_SCRIPT).await {
                Ok(Some(true)) => {
                    tracing::trace!("Page busy, skipping presence move");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Presence probe failed: {}", e);
                    continue;
                }
            }

            let target = random_point();
            for (x, y) in path(position, target, config.move_steps) {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = page.move_mouse(x, y).await {
                    tracing::debug!("Presence move failed: {}", e);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(8)).await;
            }
            position = target;
        }
        tracing::debug!("Presence loop stopped");
    })
}

fn next_interval(config: &PresenceConfig) -> Duration {
    let ms = if config.max_interval_ms > config.min_interval_ms {
        rand::thread_rng().gen_range(config.min_interval_ms..=config.max_interval_ms)
    } else {
        config.min_interval_ms
    };
    Duration::from_millis(ms)
}

fn random_point() -> (f64, f64) {
    let mut rng = rand::thread_rng();
    (
        rng.gen_range(0.0..AREA_WIDTH),
        rng.gen_range(0.0..AREA_HEIGHT),
    )
}

/// Straight-line interpolation ending exactly at `to`.
fn path(from: (f64, f64), to: (f64, f64), steps: u32) -> Vec<(f64, f64)> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            (from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)
        })
        .collect()
}
