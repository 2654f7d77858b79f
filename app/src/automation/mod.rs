pub mod rules;

pub use rules::{RuleSet, RulesSettings};

use tokio_util::sync::CancellationToken;

use crate::{adapter::device::ReadingCache, command::CommandClient, core::time::Duration, presence::PresenceClient};

/// Drives the sensor-threshold rules on a fixed tick. The actual evaluation
/// runs inside the command service, under the same lock every command takes.
pub struct RulesRunner {
    readings: ReadingCache,
    presence: PresenceClient,
    command: CommandClient,
    tick_interval: Duration,
}

impl RulesRunner {
    pub fn new(readings: ReadingCache, presence: PresenceClient, command: CommandClient, tick_interval: Duration) -> Self {
        Self {
            readings,
            presence,
            command,
            tick_interval,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut timer = tokio::time::interval(self.tick_interval.into());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = token.cancelled() => {
                    tracing::info!("Rules runner stopping");
                    return;
                }
            }

            //nothing to evaluate before the first valid reading
            let Some(reading) = self.readings.latest().await else {
                continue;
            };

            let at_home = self.presence.at_home().await;

            if let Err(e) = self.command.run_rules_tick(&reading, at_home).await {
                tracing::error!("Error evaluating rules: {:?}", e);
            }
        }
    }
}
