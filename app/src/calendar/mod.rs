mod client;
mod directives;
mod processed;

pub use client::{CalendarClient, CalendarEvent};

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::cloud::TelemetrySink,
    command::CommandClient,
    core::{
        resilience::ExponentialBackoff,
        time::{DateTime, Duration},
    },
    home::{ActuatorKind, CommandOrigin, CommandPayload, TargetValue},
    presence::PresenceClient,
    t,
};

use directives::{has_alarm_directive, parse_away_directive};
use processed::ProcessedEvents;

#[derive(Debug, Deserialize, Clone)]
pub struct CalendarSettings {
    pub url: String,
    pub token: String,
    pub calendar_id: String,
    pub poll_interval: Duration,
    pub lookahead: Duration,
    pub trigger_window: Duration,
    pub default_away: Duration,
    pub alarm_beep_ms: u64,
}

/// Polls the calendar and turns actionable events into presence changes and
/// buzzer alarms. Each (event id, start time) pair acts at most once; a
/// recurring event becomes eligible again with its next start time.
pub struct CalendarRunner {
    client: CalendarClient,
    presence: PresenceClient,
    command: CommandClient,
    telemetry: TelemetrySink,
    settings: CalendarSettings,
    processed: ProcessedEvents,
}

impl CalendarRunner {
    pub fn new(
        settings: CalendarSettings,
        presence: PresenceClient,
        command: CommandClient,
        telemetry: TelemetrySink,
    ) -> anyhow::Result<Self> {
        let client = CalendarClient::new(&settings.url, &settings.token, &settings.calendar_id)?;

        Ok(Self {
            client,
            presence,
            command,
            telemetry,
            settings,
            processed: ProcessedEvents::new(t!(6 hours)),
        })
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.settings.poll_interval, t!(10 minutes));

        loop {
            let now = t!(now);

            let delay = match self.client.upcoming_events(now, self.settings.lookahead).await {
                Ok(events) => {
                    backoff.reset();
                    self.process_events(&events, now).await;
                    self.presence.publish_baseline().await;
                    self.processed.purge(now);
                    self.settings.poll_interval
                }
                Err(e) => {
                    //auth failures included: stay up, retry with backoff
                    backoff.bump();
                    let delay = backoff.next_delay();
                    tracing::warn!("Calendar poll failed (retry in {}s): {:?}", delay.as_secs(), e);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay.into()) => {}
                _ = token.cancelled() => {
                    tracing::info!("Calendar poller stopping");
                    return;
                }
            }
        }
    }

    async fn process_events(&mut self, events: &[CalendarEvent], now: DateTime) {
        //events clustered in time must not stack away windows
        let mut away_activated_this_cycle = false;

        for event in events {
            if !self.is_actionable(event, now) {
                continue;
            }

            if let Some(directive) = parse_away_directive(&event.summary)
                && !away_activated_this_cycle
                && !self.processed.contains_away(event)
            {
                let duration = directive
                    .minutes
                    .map(Duration::minutes)
                    .unwrap_or(self.settings.default_away);

                if !duration.is_positive() {
                    tracing::warn!("Ignoring AWAY event {:?} with non-positive duration", event.summary);
                } else {
                    self.presence.start_away(duration, &event.summary).await;
                    self.processed.mark_away(event);
                    away_activated_this_cycle = true;
                }
            }

            if has_alarm_directive(&event.summary) && !self.processed.contains_alarm(event) {
                self.trigger_alarm(event).await;
                self.processed.mark_alarm(event);
            }
        }
    }

    /// An event is actionable when its start lies within the trigger window
    /// ahead of now, or started no longer ago than one poll cycle can miss.
    fn is_actionable(&self, event: &CalendarEvent, now: DateTime) -> bool {
        let until_start = event.start.elapsed_since(now).as_secs();
        let tolerance = self.settings.poll_interval.as_secs() + 15;

        until_start <= self.settings.trigger_window.as_secs() && until_start > -tolerance
    }

    async fn trigger_alarm(&self, event: &CalendarEvent) {
        tracing::info!("Alarm event {:?} imminent, triggering buzzer", event.summary);

        let payload = CommandPayload::Actuator {
            kind: ActuatorKind::Buzzer,
            value: TargetValue::Beep {
                duration_ms: self.settings.alarm_beep_ms,
            },
        };

        if let Err(e) = self.command.apply(CommandOrigin::Alarm, payload).await {
            tracing::error!("Error triggering alarm buzzer: {:?}", e);
        }

        if let Err(e) = self
            .telemetry
            .send(json!({
                "calendar_alarm_triggered": true,
                "event_summary": event.summary,
                "event_start_time": event.start.to_iso_string(),
            }))
            .await
        {
            tracing::error!("Error queueing alarm telemetry: {:?}", e);
        }
    }
}
