//! Actor loop driving a scheduler.

use std::time::Instant;

use tokio::sync::mpsc;

use super::commands::{LoaderCommand, LoaderStats};
use crate::http::HttpEvent;
use crate::scheduler::Scheduler;
use crate::swarm::SwarmEvent;

/// Runs the scheduler until destroyed or every handle is dropped.
///
/// Commands, transport events and timers are processed one at a time, each
/// to completion, so a reconcile pass never interleaves with another event.
pub(super) async fn run_actor_loop(
    mut scheduler: Scheduler,
    mut receiver: mpsc::Receiver<LoaderCommand>,
    mut http_events: mpsc::UnboundedReceiver<HttpEvent>,
    mut swarm_events: mpsc::UnboundedReceiver<SwarmEvent>,
) {
    tracing::debug!(peer_id = %scheduler.peer_id(), "Loader actor started");

    loop {
        let deadline = scheduler.next_deadline();
        let wait = deadline
            .map(|deadline| deadline.saturating_duration_since(scheduler.now()))
            .unwrap_or_default();

        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    tracing::debug!("All loader handles dropped");
                    break;
                };
                if !handle_command(&mut scheduler, command).await {
                    break;
                }
            }
            Some(event) = http_events.recv() => {
                if let Err(e) = scheduler.handle_http_event(event).await {
                    tracing::warn!(error = %e, "Failed to apply HTTP event");
                }
            }
            Some(event) = swarm_events.recv() => {
                if let Err(e) = scheduler.handle_swarm_event(event).await {
                    tracing::warn!(error = %e, "Failed to apply swarm event");
                }
            }
            () = tokio::time::sleep(wait), if deadline.is_some() => {
                let now: Instant = scheduler.now();
                if let Err(e) = scheduler.poll_timers(now).await {
                    tracing::warn!(error = %e, "Timer processing failed");
                }
            }
        }
    }

    if let Err(e) = scheduler.destroy().await {
        tracing::warn!(error = %e, "Failed to release loader resources");
    }
    tracing::debug!("Loader actor stopped");
}

/// Handles a single command. Returns false to stop the actor.
async fn handle_command(scheduler: &mut Scheduler, command: LoaderCommand) -> bool {
    match command {
        LoaderCommand::Load {
            queue,
            stream_swarm_id,
            responder,
        } => {
            let result = scheduler.load(queue, &stream_swarm_id).await;
            let _ = responder.send(result);
        }

        LoaderCommand::GetSegment {
            segment_id,
            responder,
        } => {
            let result = scheduler.segment(&segment_id).await;
            let _ = responder.send(result);
        }

        LoaderCommand::GetSettings { responder } => {
            let _ = responder.send(scheduler.settings().clone());
        }

        LoaderCommand::GetPeerId { responder } => {
            let _ = responder.send(scheduler.peer_id());
        }

        LoaderCommand::GetStats { responder } => {
            let stats = LoaderStats {
                queued_segments: scheduler.queue().len(),
                http_downloads: scheduler.http().active_downloads_count(),
                p2p_downloads: scheduler.swarm().active_downloads_count(),
                connected_peers: scheduler.swarm().peer_count(),
            };
            let _ = responder.send(stats);
        }

        LoaderCommand::Destroy { responder } => {
            tracing::debug!("Loader actor shutting down");
            let result = scheduler.destroy().await;
            let _ = responder.send(result);
            return false;
        }
    }
    true
}
