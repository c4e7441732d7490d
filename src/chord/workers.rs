use crate::chord::actor::ChordHandle;
use crate::chord::types::Role;
use log::{debug, info, trace, warn};
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

/// Checks the successor once per period. A silent successor is cleared and
/// a proposal round starts; while the slot stays empty each tick proposes again.
pub async fn run_successor_heartbeat(
    handle: ChordHandle,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_heartbeat(handle, Role::Successor, period, shutdown).await
}

/// Checks the predecessor once per period. A silent predecessor is only
/// cleared; the next node to ask for a successor fills the slot again.
pub async fn run_predecessor_heartbeat(
    handle: ChordHandle,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_heartbeat(handle, Role::Predecessor, period, shutdown).await
}

async fn run_heartbeat(
    handle: ChordHandle,
    role: Role,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting {} heartbeat every {:?}", role, period);

    // spread the two workers of a node and the nodes of a ring apart
    let jitter_ms = rand::rng().random_range(0..=period.as_millis().min(250) as u64);
    tokio::select! {
        _ = shutdown.changed() => return,
        _ = sleep(Duration::from_millis(jitter_ms)) => {}
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let probe = match handle.start_probe(role).await {
            Ok(Some(probe)) => probe,
            Ok(None) => {
                trace!("No {} to probe", role);
                continue;
            }
            Err(e) => {
                debug!("{} heartbeat stopping: {}", role, e);
                break;
            }
        };

        let answered = tokio::select! {
            _ = shutdown.changed() => break,
            result = timeout(period, probe.ack) => matches!(result, Ok(Ok(()))),
        };

        if answered {
            trace!("{} {} is alive", role, probe.peer);
            continue;
        }

        warn!("{} {} did not answer within {:?}", role, probe.peer, period);
        if let Err(e) = handle.probe_expired(role, probe.peer).await {
            debug!("{} heartbeat stopping: {}", role, e);
            break;
        }
    }

    info!("{} heartbeat stopped", role);
}
