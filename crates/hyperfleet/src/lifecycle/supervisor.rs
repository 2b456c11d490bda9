//! Crash detection (spec §4.8): a background task that waits on every
//! registered instance's process and reconciles the store when one exits
//! without going through the normal `stop` pipeline.

use super::Engine;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Identifies a registration by the address of its `Runtime` allocation.
/// The same machine id can be re-registered after a `stopped -> starting`
/// restart (spec §4.8) with a fresh `Arc`, so the bare id alone doesn't
/// tell "still the process we're already watching" apart from "a new
/// process that happens to reuse the id".
fn registration_token(runtime: &crate::registry::Runtime) -> usize {
    Arc::as_ptr(runtime) as usize
}

/// Runs until `engine` is dropped from under it (never in practice: the
/// caller holds an `Arc` for the life of the process). Each tick,
/// reconciles `watched` against the registry's current running ids:
/// drops entries for ids no longer present, and spawns a fresh watcher
/// for any id whose registration token has changed since last seen (a
/// restart) or that hasn't been seen at all.
pub async fn run(engine: Arc<Engine>) {
    let mut watched: HashMap<String, usize> = HashMap::new();

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let running_ids = engine.registry.list_running().await;
        let running_set: HashSet<&String> = running_ids.iter().collect();
        watched.retain(|id, _| running_set.contains(id));

        for id in running_ids {
            let Some(runtime) = engine.registry.get(&id).await else {
                continue;
            };
            let token = registration_token(&runtime);

            if watched.get(&id) == Some(&token) {
                continue;
            }
            watched.insert(id.clone(), token);

            let engine = engine.clone();
            tokio::spawn(async move {
                watch_one(engine, id).await;
            });
        }
    }
}

async fn watch_one(engine: Arc<Engine>, machine_id: String) {
    let Some(runtime) = engine.registry.get(&machine_id).await else {
        return;
    };

    let exit_code = {
        let mut driver = runtime.lock().await;
        driver.wait().await
    };

    match exit_code {
        Ok(code) => {
            info!(machine_id = %machine_id, code, "watched process exited");
            if let Err(e) = engine.observe_crash(&machine_id, code).await {
                warn!(machine_id = %machine_id, error = %e, "failed to record crash");
            }
        }
        Err(e) => {
            warn!(machine_id = %machine_id, error = %e, "wait() on watched process failed");
        }
    }
}
