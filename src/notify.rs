//! Bridges the runtime's event feed into pipeline lifecycle updates.
//!
//! Docker can emit several raw events for one logical transition (`start`
//! and `unpause`, `die` and `pause`). Only the most recent ID per class is
//! remembered; a start clears the stop marker and vice versa, so genuine
//! restarts still come through.

use anyhow::{Context, Result};
use log::debug;
use tokio::sync::mpsc;

use netcage_docker::DockerClient;
use netcage_docker::dto::Event;

use crate::pipeline::LifecycleEvent;

const SHORT_ID_LEN: usize = 12;

#[derive(Default)]
pub struct EventDeduper {
    last_started: Option<String>,
    last_stopped: Option<String>,
}

impl EventDeduper {
    /// Maps a raw event onto a lifecycle update, suppressing duplicates.
    pub fn translate(&mut self, event: &Event) -> Option<LifecycleEvent> {
        if event.kind != "container" {
            return None;
        }
        let id = short_id(&event.actor.id);
        match event.action.as_str() {
            "start" | "unpause" => {
                if self.last_started.as_deref() == Some(&id) {
                    debug!("duplicate start event for {id}");
                    return None;
                }
                self.last_started = Some(id.clone());
                self.last_stopped = None;
                Some(LifecycleEvent::Started(id))
            }
            "die" | "pause" => {
                if self.last_stopped.as_deref() == Some(&id) {
                    debug!("duplicate stop event for {id}");
                    return None;
                }
                self.last_stopped = Some(id.clone());
                self.last_started = None;
                Some(LifecycleEvent::Stopped(id))
            }
            _ => None,
        }
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Forwards deduplicated lifecycle updates until the feed or the pipeline
/// goes away.
pub async fn watch(client: DockerClient, updates: mpsc::Sender<LifecycleEvent>) -> Result<()> {
    let mut stream = client
        .events()
        .await
        .context("subscribing to container events")?;
    let mut deduper = EventDeduper::default();
    loop {
        match stream.next().await {
            Ok(Some(event)) => {
                if let Some(update) = deduper.translate(&event)
                    && updates.send(update).await.is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            // One malformed line does not invalidate the feed.
            Err(err @ netcage_docker::DockerError::Deserialize(_)) => {
                if updates
                    .send(LifecycleEvent::StartError(err.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => return Err(err).context("reading container events"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcage_docker::dto::Actor;

    fn event(kind: &str, action: &str, id: &str) -> Event {
        Event {
            kind: kind.into(),
            action: action.into(),
            actor: Actor { id: id.into() },
        }
    }

    const FULL_ID: &str = "25f561f3d0812dd6c1d97bb72d99a24437fedbe985c776896ccb328253ff7d90";

    #[test]
    fn ids_are_truncated() {
        let mut deduper = EventDeduper::default();
        assert_eq!(
            deduper.translate(&event("container", "start", FULL_ID)),
            Some(LifecycleEvent::Started("25f561f3d081".into()))
        );
    }

    #[test]
    fn duplicate_transitions_are_suppressed() {
        let mut deduper = EventDeduper::default();
        assert!(deduper.translate(&event("container", "start", FULL_ID)).is_some());
        assert!(deduper.translate(&event("container", "unpause", FULL_ID)).is_none());
        assert!(deduper.translate(&event("container", "die", FULL_ID)).is_some());
        assert!(deduper.translate(&event("container", "pause", FULL_ID)).is_none());
    }

    #[test]
    fn restart_is_not_a_duplicate() {
        let mut deduper = EventDeduper::default();
        assert!(deduper.translate(&event("container", "start", FULL_ID)).is_some());
        assert!(deduper.translate(&event("container", "die", FULL_ID)).is_some());
        assert_eq!(
            deduper.translate(&event("container", "start", FULL_ID)),
            Some(LifecycleEvent::Started("25f561f3d081".into()))
        );
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let mut deduper = EventDeduper::default();
        assert!(deduper.translate(&event("network", "create", FULL_ID)).is_none());
        assert!(deduper.translate(&event("container", "exec_start", FULL_ID)).is_none());
    }
}
