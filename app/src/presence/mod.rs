use std::sync::Arc;

use infrastructure::MqttOutMessage;
use serde_json::json;
use tokio::{
    sync::{Mutex, mpsc::Sender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::cloud::TelemetrySink,
    core::time::Duration,
    home::Presence,
    t,
};

/// Owns the occupancy flag and the single away window. A new AWAY event
/// always preempts a running one; the timer task is cancelled on shutdown so
/// it cannot fire into a torn-down process.
pub struct PresenceService {
    state: Mutex<PresenceState>,
    peer_tx: Sender<MqttOutMessage>,
    presence_topic: String,
    telemetry: TelemetrySink,
    token: CancellationToken,
}

struct PresenceState {
    presence: Presence,
    away_timer: Option<JoinHandle<()>>,
    away_event: Option<String>,
}

pub struct PresenceModule {
    service: Arc<PresenceService>,
}

#[derive(Clone)]
pub struct PresenceClient {
    service: Arc<PresenceService>,
}

impl PresenceModule {
    pub fn new(
        peer_tx: Sender<MqttOutMessage>,
        presence_topic: impl Into<String>,
        telemetry: TelemetrySink,
        token: CancellationToken,
    ) -> Self {
        Self {
            service: Arc::new(PresenceService {
                state: Mutex::new(PresenceState {
                    presence: Presence::new(),
                    away_timer: None,
                    away_event: None,
                }),
                peer_tx,
                presence_topic: presence_topic.into(),
                telemetry,
                token,
            }),
        }
    }

    pub fn client(&self) -> PresenceClient {
        PresenceClient {
            service: self.service.clone(),
        }
    }
}

impl PresenceClient {
    pub async fn at_home(&self) -> bool {
        self.service.state.lock().await.presence.at_home()
    }

    pub async fn start_away(&self, duration: Duration, event_summary: &str) {
        PresenceService::start_away(&self.service, duration, event_summary).await
    }

    /// Publishes the current flag once, so subscribers have a baseline even
    /// when no calendar event ever fires. Later calls are no-ops.
    pub async fn publish_baseline(&self) {
        let changed = {
            let mut state = self.service.state.lock().await;
            let at_home = state.presence.at_home();
            state.presence.set(at_home)
        };

        if changed {
            self.service
                .publish_presence(self.at_home().await, "Initial state, no active away timer")
                .await;
        }
    }
}

impl PresenceService {
    async fn start_away(service: &Arc<Self>, duration: Duration, event_summary: &str) {
        let until = t!(now) + duration;

        {
            let mut state = service.state.lock().await;

            if let Some(timer) = state.away_timer.take() {
                tracing::info!(
                    "Cancelling running away timer for {:?} due to new event {:?}",
                    state.away_event,
                    event_summary
                );
                timer.abort();
            }

            tracing::info!(
                "Away for {} minutes (back {}) due to event {:?}",
                duration.as_minutes(),
                until.to_human_readable(),
                event_summary
            );

            state.presence.set(false);
            state.away_event = Some(event_summary.to_string());

            let timer = tokio::spawn({
                let service = service.clone();
                let token = service.token.clone();
                async move {
                    tokio::select! {
                        _ = tokio::time::sleep(duration.into()) => service.finish_away().await,
                        _ = token.cancelled() => {}
                    }
                }
            });
            state.away_timer = Some(timer);
        }

        let reason = format!("AWAY event '{}'", event_summary);
        service.publish_presence(false, &reason).await;

        if let Err(e) = service
            .telemetry
            .send(json!({
                "calendar_away_event_active": true,
                "away_event_summary": event_summary,
                "away_duration_minutes": duration.as_minutes(),
            }))
            .await
        {
            tracing::error!("Error queueing away telemetry: {:?}", e);
        }
    }

    async fn finish_away(&self) {
        let (changed, event_summary) = {
            let mut state = self.state.lock().await;
            let changed = state.presence.set(true);
            state.away_timer = None;
            (changed, state.away_event.take())
        };

        let reason = format!("Away timer expired for event {:?}", event_summary);
        tracing::info!("{}, setting person at home", reason);

        if changed {
            self.publish_presence(true, &reason).await;
        }

        if let Err(e) = self
            .telemetry
            .send(json!({
                "calendar_away_event_active": false,
                "ended_away_event_summary": event_summary,
            }))
            .await
        {
            tracing::error!("Error queueing away-ended telemetry: {:?}", e);
        }
    }

    async fn publish_presence(&self, at_home: bool, reason: &str) {
        tracing::info!("Presence changing to at_home={} ({})", at_home, reason);

        let payload = json!({"person_at_home": at_home}).to_string();
        if let Err(e) = self
            .peer_tx
            .send(MqttOutMessage::retained(self.presence_topic.clone(), payload))
            .await
        {
            tracing::error!("Error queueing presence message: {}", e);
        }

        if let Err(e) = self
            .telemetry
            .send(json!({
                "person_at_home_calendar": at_home,
                "last_presence_update_reason": reason,
            }))
            .await
        {
            tracing::error!("Error queueing presence telemetry: {:?}", e);
        }
    }
}
