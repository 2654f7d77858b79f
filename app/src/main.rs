use infrastructure::Mqtt;
use settings::Settings;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapter::cloud::{RPC_REQUEST_FILTER, RpcRunner, TelemetrySink};
use crate::adapter::db::ReadingRepository;
use crate::adapter::device::DeviceRunner;
use crate::adapter::peer::PeerRunner;
use crate::automation::{RuleSet, RulesRunner};
use crate::calendar::CalendarRunner;
use crate::command::{CommandModule, StatusPublisher};
use crate::presence::PresenceModule;

mod adapter;
mod automation;
mod calendar;
mod command;
mod core;
mod home;
mod presence;
mod settings;

struct Infrastructure {
    peer_mqtt: Mqtt,
    cloud_mqtt: Mqtt,
    db_pool: Option<sqlx::PgPool>,
}

#[tokio::main(flavor = "multi_thread")]
pub async fn main() {
    let settings = Settings::new().expect("Error reading configuration");

    let mut infrastructure = Infrastructure::init(&settings)
        .await
        .expect("Error initializing infrastructure");

    let command_rx = infrastructure
        .peer_mqtt
        .subscribe(settings.peer.command_topic())
        .await
        .expect("Error subscribing to peer command topic");
    let sibling_rx = infrastructure
        .peer_mqtt
        .subscribe(settings.peer.sibling_data_topic())
        .await
        .expect("Error subscribing to sibling data topic");
    let rpc_rx = infrastructure
        .cloud_mqtt
        .subscribe(RPC_REQUEST_FILTER)
        .await
        .expect("Error subscribing to RPC requests");

    let peer_publisher = infrastructure.peer_mqtt.new_publisher();
    let telemetry = TelemetrySink::new(infrastructure.cloud_mqtt.new_publisher());
    let rpc_publisher = infrastructure.cloud_mqtt.new_publisher();

    let history = infrastructure.db_pool.clone().map(ReadingRepository::new);

    let device_runner = DeviceRunner::new(
        settings.device.clone(),
        peer_publisher.clone(),
        settings.peer.data_topic(),
        telemetry.clone(),
        history,
    );

    let rules = RuleSet::new(&settings.rules).expect("Invalid rules configuration");

    let command = CommandModule::new(
        device_runner.handle(),
        StatusPublisher::new(peer_publisher.clone(), settings.peer.status_topic(), telemetry.clone()),
        rules,
        settings.dispatch.override_duration,
    );

    let token = CancellationToken::new();

    let presence = PresenceModule::new(
        peer_publisher,
        settings.peer.presence_topic(),
        telemetry.clone(),
        token.clone(),
    );

    let rules_runner = RulesRunner::new(
        device_runner.readings(),
        presence.client(),
        command.client(),
        settings.rules.tick_interval,
    );
    let peer_runner = PeerRunner::new(command_rx, sibling_rx, command.client());
    let rpc_runner = RpcRunner::new(rpc_rx, rpc_publisher, command.client());

    let calendar_runner = settings.calendar.map(|calendar| {
        CalendarRunner::new(calendar, presence.client(), command.client(), telemetry.clone())
            .expect("Error initializing calendar client")
    });

    let process_infrastructure = infrastructure.process();

    tracing::info!("Starting main loop");

    let mut workers = JoinSet::new();
    workers.spawn(device_runner.run(token.clone()));
    workers.spawn(rules_runner.run(token.clone()));
    workers.spawn(peer_runner.run(token.clone()));
    workers.spawn(rpc_runner.run(token.clone()));
    if let Some(calendar_runner) = calendar_runner {
        workers.spawn(calendar_runner.run(token.clone()));
    }

    tokio::select!(
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        },
        _ = process_infrastructure => {
            tracing::error!("MQTT processing stopped unexpectedly");
        },
        _ = workers.join_next() => {
            tracing::error!("A worker stopped unexpectedly");
        },
    );

    //workers observe the token and exit within one tick interval
    token.cancel();
    let drain = async {
        while workers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("Workers did not stop in time, exiting anyway");
    }
}

impl Infrastructure {
    pub async fn init(settings: &Settings) -> anyhow::Result<Self> {
        settings.monitoring.init().expect("Error initializing monitoring");

        let db_pool = match &settings.database {
            Some(database) => Some(database.new_pool().await?),
            None => None,
        };

        let peer_mqtt = settings.peer_mqtt.new_client();
        let cloud_mqtt = settings.cloud_mqtt.new_client();

        Ok(Self {
            peer_mqtt,
            cloud_mqtt,
            db_pool,
        })
    }

    async fn process(self) {
        tokio::select!(
            _ = self.peer_mqtt.process() => {},
            _ = self.cloud_mqtt.process() => {},
        )
    }
}
