mod service;

pub use service::{DispatchOutcome, StatusPublisher};

use std::sync::Arc;

use service::CommandService;

use crate::{
    adapter::device::DeviceHandle,
    automation::rules::RuleSet,
    core::time::Duration,
    home::{CommandOrigin, CommandPayload, SensorReading},
};

pub struct CommandModule {
    service: Arc<CommandService>,
}

#[derive(Clone)]
pub struct CommandClient {
    service: Arc<CommandService>,
}

impl CommandModule {
    pub fn new(device: DeviceHandle, status: StatusPublisher, rules: RuleSet, override_duration: Duration) -> Self {
        Self {
            service: Arc::new(CommandService::new(device, status, rules, override_duration)),
        }
    }

    pub fn client(&self) -> CommandClient {
        CommandClient {
            service: self.service.clone(),
        }
    }
}

impl CommandClient {
    pub async fn apply(&self, origin: CommandOrigin, payload: CommandPayload) -> anyhow::Result<DispatchOutcome> {
        self.service.apply(origin, payload).await
    }

    pub async fn run_rules_tick(&self, reading: &SensorReading, at_home: bool) -> anyhow::Result<()> {
        self.service.run_rules_tick(reading, at_home).await
    }
}
