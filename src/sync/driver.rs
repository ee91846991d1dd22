//! Async pumps that feed transport events into a [`SyncEngine`] or a
//! standalone [`TransferQueue`] until they are done.

use std::future::Future;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::api::{ApiEvent, CloudApi};
use crate::error::{Result, SyncError};
use crate::sync::engine::SyncEngine;
use crate::sync::queue::{QueueEvent, TransferQueue};

/// Drive `engine` until it completes or aborts.
pub async fn run<A: CloudApi>(engine: &mut SyncEngine<A>, events: &mut UnboundedReceiver<ApiEvent>) -> Result<()> {
    run_until(engine, events, std::future::pending::<()>()).await
}

/// Drive `engine` like [`run`], aborting the session when `abort_signal`
/// resolves first.
pub async fn run_until<A, F>(
    engine: &mut SyncEngine<A>,
    events: &mut UnboundedReceiver<ApiEvent>,
    abort_signal: F,
) -> Result<()>
where
    A: CloudApi,
    F: Future<Output = ()>,
{
    tokio::pin!(abort_signal);
    let mut signalled = false;

    while !engine.is_done() {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => engine.handle_event(event),
                None => return Err(SyncError::TransportClosed),
            },
            _ = &mut abort_signal, if !signalled => {
                signalled = true;
                tracing::info!("Abort requested");
                engine.abort();
            }
        }
    }

    Ok(())
}

/// Run a download queue on its own, outside of a sync session.
///
/// Every queue event is handed to `on_event`. The first per-file error aborts
/// the queue and is returned.
pub async fn run_queue(
    queue: &mut TransferQueue,
    api: &mut dyn CloudApi,
    events: &mut UnboundedReceiver<ApiEvent>,
    mut on_event: impl FnMut(&QueueEvent),
) -> Result<()> {
    let mut pending = queue.start(api);

    loop {
        for event in pending.drain(..) {
            on_event(&event);
            match event {
                QueueEvent::Finished | QueueEvent::Aborted => return Ok(()),
                QueueEvent::Error { cause, .. } => {
                    queue.abort(api);
                    return Err(cause);
                }
                QueueEvent::Progress { .. } | QueueEvent::FileFinished { .. } => {}
            }
        }

        let Some(event) = events.recv().await else {
            return Err(SyncError::TransportClosed);
        };
        pending = queue.handle_event(api, &event);
    }
}
