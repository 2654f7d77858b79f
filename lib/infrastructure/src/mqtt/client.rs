use std::str::Utf8Error;

use rumqttc::v5::{
    AsyncClient, EventLoop, MqttOptions,
    mqttbytes::{
        QoS,
        v5::{ConnectProperties, Publish, SubscribeProperties},
    },
};

use rumqttc::v5::Event::Incoming;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinSet,
};

use super::{MqttInMessage, MqttOutMessage};

pub struct Mqtt {
    client: AsyncClient,
    event_loop: EventLoop,
    subscriptions: Vec<Sender<MqttInMessage>>,
    publisher_tx: Sender<MqttOutMessage>,
    publisher_rx: Receiver<MqttOutMessage>,
}

impl Mqtt {
    pub fn connect(host: &str, port: u16, client_id: &str, username: Option<&str>, password: Option<&str>) -> Self {
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(::std::time::Duration::from_secs(5));
        mqttoptions.set_clean_start(false);

        //token-authenticated brokers expect the token as username
        if let Some(username) = username {
            mqttoptions.set_credentials(username, password.unwrap_or_default());
        }

        let mut connect_props = ConnectProperties::new();
        connect_props.session_expiry_interval = 60.into();
        connect_props.max_packet_size = Some(1024 * 1024);
        mqttoptions.set_connect_properties(connect_props);

        let (client, event_loop) = AsyncClient::new(mqttoptions, 10);
        let (publisher_tx, publisher_rx) = mpsc::channel::<MqttOutMessage>(32);

        Mqtt {
            client,
            event_loop,
            subscriptions: vec![],
            publisher_tx,
            publisher_rx,
        }
    }

    pub async fn subscribe(&mut self, topic: impl Into<String>) -> anyhow::Result<Receiver<MqttInMessage>> {
        self.subscribe_all(&[topic.into()]).await
    }

    pub async fn subscribe_all(&mut self, topics: &[String]) -> anyhow::Result<Receiver<MqttInMessage>> {
        let (tx, rx) = mpsc::channel::<MqttInMessage>(32);

        for topic in topics {
            tracing::info!("Subscribing to topic {:?}", topic);

            self.subscriptions.push(tx.clone());

            self.client
                .subscribe_with_properties(
                    topic,
                    QoS::AtLeastOnce,
                    SubscribeProperties {
                        id: Some(self.subscriptions.len()), //must be > 0
                        user_properties: vec![],
                    },
                )
                .await?;
        }

        Ok(rx)
    }

    pub fn new_publisher(&self) -> Sender<MqttOutMessage> {
        self.publisher_tx.clone()
    }

    pub async fn process(mut self) {
        let mut tasks = JoinSet::new();

        let client = self.client;
        let mut event_loop = self.event_loop;

        tasks.spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Incoming(rumqttc::v5::mqttbytes::v5::Packet::Publish(msg))) => {
                        let in_message: MqttInMessage = match (&msg).try_into() {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::error!("Error parsing MQTT message: {}", e);
                                continue;
                            }
                        };

                        let subscription_ids = match msg.properties {
                            Some(p) => p.subscription_identifiers,
                            None => {
                                tracing::error!("No subscription identifiers in MQTT message");
                                continue;
                            }
                        };

                        for id in subscription_ids {
                            match self.subscriptions.get(id - 1) {
                                Some(tx) => {
                                    if let Err(e) = tx.send(in_message.clone()).await {
                                        tracing::error!("Failed to forward MQTT message to subscriber: {}", e);
                                    }
                                }
                                None => {
                                    tracing::error!("No subscription for id: {}", id);
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        //rumqttc reconnects on the next poll, nothing to do here
                        tracing::error!("MQTT error: {}", e);
                    }
                }
            }
        });

        tasks.spawn(async move {
            while let Some(msg) = self.publisher_rx.recv().await {
                tracing::debug!("Publishing MQTT message to {} (retain={}): {:?}", msg.topic, msg.retain, msg.payload);

                if let Err(e) = client
                    .publish(msg.topic.clone(), QoS::AtLeastOnce, msg.retain, msg.payload)
                    .await
                {
                    tracing::error!("Error publishing MQTT message to {}: {}", msg.topic, e);
                }
            }
        });

        while let Some(task) = tasks.join_next().await {
            let () = task.unwrap();
        }
    }
}

impl TryInto<MqttInMessage> for &Publish {
    type Error = Utf8Error;

    fn try_into(self) -> Result<MqttInMessage, Self::Error> {
        Ok(MqttInMessage {
            topic: std::str::from_utf8(&self.topic)?.to_string(),
            payload: std::str::from_utf8(&self.payload)?.to_string(),
        })
    }
}
