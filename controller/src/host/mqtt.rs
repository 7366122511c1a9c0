use std::{collections::VecDeque, sync::Arc, time::Duration};

use relay_common::{BrokerTransport, DeviceConfig, InboundMessage, LinkError, PAYLOAD_OFFLINE};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, Incoming, LastWill,
    MqttOptions, Outgoing, QoS,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug)]
enum LinkEvent {
    Up,
    Down(String),
    Message(InboundMessage),
}

/// rumqttc session driven from the synchronous control loop. The event loop
/// only polls after a connect request, so reconnect pacing stays with the
/// controller's backoff instead of rumqttc's own retries.
pub struct MqttTransport {
    handle: Handle,
    client: AsyncClient,
    connect_requested: Arc<Notify>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    inbox: VecDeque<InboundMessage>,
    connected: bool,
    task: JoinHandle<()>,
}

impl MqttTransport {
    pub fn new(handle: Handle, config: &DeviceConfig) -> Self {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        options.set_last_will(LastWill::new(
            config.availability_topic.clone(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if !config.mqtt_user.is_empty() {
            options.set_credentials(config.mqtt_user.clone(), config.mqtt_pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, events) = mpsc::unbounded_channel();
        let connect_requested = Arc::new(Notify::new());
        let task = handle.spawn(drive_eventloop(eventloop, connect_requested.clone(), tx));

        Self {
            handle,
            client,
            connect_requested,
            events,
            inbox: VecDeque::new(),
            connected: false,
            task,
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up => self.connected = true,
            LinkEvent::Down(reason) => {
                if self.connected {
                    warn!("mqtt link lost: {reason}");
                }
                self.connected = false;
            }
            LinkEvent::Message(message) => self.inbox.push_back(message),
        }
    }
}

impl BrokerTransport for MqttTransport {
    fn network_available(&self) -> bool {
        !self.task.is_finished()
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.drain_events();
        if self.connected {
            return Ok(());
        }

        self.connect_requested.notify_one();

        let Self {
            handle,
            events,
            inbox,
            ..
        } = self;
        let outcome = handle.block_on(async {
            tokio::time::timeout(CONNECT_TIMEOUT, async {
                while let Some(event) = events.recv().await {
                    match event {
                        LinkEvent::Up => return Ok(()),
                        LinkEvent::Down(reason) => return Err(LinkError::ConnectFailed(reason)),
                        LinkEvent::Message(message) => inbox.push_back(message),
                    }
                }
                Err(LinkError::Closed)
            })
            .await
            .unwrap_or(Err(LinkError::Timeout))
        });

        self.connected = outcome.is_ok();
        if self.connected {
            info!("mqtt connected");
        }
        outcome
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            if let Err(err) = self.client.try_disconnect() {
                debug!("mqtt disconnect request dropped: {err}");
            }
        }
        self.connected = false;
        self.inbox.clear();
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(map_client_error)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        // A request queued on a dead link would go out after the next reconnect.
        self.drain_events();
        if !self.connected {
            return Err(LinkError::Closed);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(map_client_error)
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.drain_events();
        self.inbox.pop_front()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn map_client_error(err: ClientError) -> LinkError {
    match err {
        ClientError::TryRequest(_) => LinkError::QueueFull,
        _ => LinkError::Closed,
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    connect_requested: Arc<Notify>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        connect_requested.notified().await;

        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        LinkEvent::Up
                    } else {
                        LinkEvent::Down(format!("{:?}", ack.code))
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    LinkEvent::Message(InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    })
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    LinkEvent::Down("disconnect requested".to_string())
                }
                Ok(_) => continue,
                Err(err) => LinkEvent::Down(err.to_string()),
            };

            let down = matches!(event, LinkEvent::Down(_));
            if events.send(event).is_err() {
                return;
            }
            if down {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_is_rejected_once_the_link_drops() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut transport = MqttTransport::new(runtime.handle().clone(), &DeviceConfig::default());
        let (link, events) = mpsc::unbounded_channel();
        transport.events = events;

        assert!(matches!(
            transport.publish("relay/switch/state", b"1", true),
            Err(LinkError::Closed)
        ));

        link.send(LinkEvent::Up).unwrap();
        assert!(transport.publish("relay/switch/state", b"1", true).is_ok());
        assert!(transport.is_connected());

        link.send(LinkEvent::Down("connection reset".to_string())).unwrap();
        assert!(matches!(
            transport.publish("relay/switch/state", b"0", true),
            Err(LinkError::Closed)
        ));
        assert!(!transport.is_connected());
    }
}
