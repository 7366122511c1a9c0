use log::{debug, info, warn};

use crate::{
    clock::{elapsed_ms, Millis},
    ports::{BrokerTransport, InboundMessage},
    topics::PAYLOAD_ONLINE,
};

/// Upper bound on inbound messages handled in one tick.
const MAX_MESSAGES_PER_TICK: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub connected: bool,
    pub last_attempt: Millis,
    pub backoff_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub step_ms: u32,
    pub max_ms: u32,
}

impl Backoff {
    pub fn next(self, current_ms: u32) -> u32 {
        current_ms.saturating_add(self.step_ms).min(self.max_ms)
    }
}

/// Broker session with incremental reconnect backoff. Publishes are best
/// effort: dropped, never queued, while the link is down.
pub struct ConnectivitySession<B> {
    transport: B,
    backoff: Backoff,
    command_topic: String,
    availability_topic: String,
}

impl<B: BrokerTransport> ConnectivitySession<B> {
    pub fn new(
        transport: B,
        backoff: Backoff,
        command_topic: impl Into<String>,
        availability_topic: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            backoff,
            command_topic: command_topic.into(),
            availability_topic: availability_topic.into(),
        }
    }

    pub fn transport(&self) -> &B {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut B {
        &mut self.transport
    }

    pub fn tick(&mut self, state: &mut ConnectivityState, now: Millis) -> Vec<SessionEvent> {
        if state.connected {
            return self.service(state);
        }

        if !self.transport.network_available() {
            return Vec::new();
        }
        if elapsed_ms(now, state.last_attempt) < state.backoff_ms {
            return Vec::new();
        }

        state.last_attempt = now;
        match self.transport.connect() {
            Ok(()) => {
                state.connected = true;
                state.backoff_ms = 0;
                info!("broker connected");

                if let Err(err) = self.transport.subscribe(&self.command_topic) {
                    warn!("subscribe to {} failed: {err}", self.command_topic);
                }
                if let Err(err) = self.transport.publish(
                    &self.availability_topic,
                    PAYLOAD_ONLINE.as_bytes(),
                    true,
                ) {
                    warn!("availability publish failed: {err}");
                }
                vec![SessionEvent::Connected]
            }
            Err(err) => {
                state.backoff_ms = self.backoff.next(state.backoff_ms);
                warn!(
                    "broker connect failed: {err}; next attempt in {} ms",
                    state.backoff_ms
                );
                Vec::new()
            }
        }
    }

    pub fn publish(
        &mut self,
        state: &ConnectivityState,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> bool {
        if !state.connected || !self.transport.network_available() {
            debug!("dropping publish to {topic}: broker offline");
            return false;
        }

        match self.transport.publish(topic, payload, retain) {
            Ok(()) => true,
            Err(err) => {
                warn!("publish to {topic} failed: {err}");
                false
            }
        }
    }

    /// Closes the session so another collaborator can take over the radio.
    pub fn suspend(&mut self, state: &mut ConnectivityState) {
        if state.connected {
            self.transport.disconnect();
        }
        state.connected = false;
    }

    fn service(&mut self, state: &mut ConnectivityState) -> Vec<SessionEvent> {
        if !self.transport.is_connected() {
            state.connected = false;
            warn!("broker connection lost");
            return vec![SessionEvent::Disconnected];
        }

        let mut events = Vec::new();
        while events.len() < MAX_MESSAGES_PER_TICK {
            let Some(message) = self.transport.poll_message() else {
                break;
            };
            events.push(SessionEvent::Message(message));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{ports::LinkError, testing::FakeBroker};

    const BACKOFF: Backoff = Backoff {
        step_ms: 1_000,
        max_ms: 60_000,
    };

    fn session(broker: FakeBroker) -> ConnectivitySession<FakeBroker> {
        ConnectivitySession::new(broker, BACKOFF, "dev/cmnd", "dev/status")
    }

    #[test]
    fn backoff_grows_by_step_and_saturates() {
        let mut broker = FakeBroker::online();
        broker.fail_next_connects(70);
        let mut session = session(broker);
        let mut state = ConnectivityState::default();
        let mut now: Millis = 0;

        for attempt in 1..=70_u32 {
            now = now.wrapping_add(state.backoff_ms);
            let _ = session.tick(&mut state, now);
            assert_eq!(state.backoff_ms, (1_000 * attempt).min(60_000));
            assert_eq!(session.transport().connect_attempts, attempt);
        }

        now = now.wrapping_add(state.backoff_ms);
        let events = session.tick(&mut state, now);
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(state.backoff_ms, 0);
        assert!(state.connected);
    }

    #[test]
    fn waits_out_backoff_before_retrying() {
        let mut broker = FakeBroker::online();
        broker.fail_next_connects(1);
        let mut session = session(broker);
        let mut state = ConnectivityState::default();

        let _ = session.tick(&mut state, 5_000);
        assert_eq!(state.backoff_ms, 1_000);

        let _ = session.tick(&mut state, 5_999);
        assert_eq!(session.transport().connect_attempts, 1);

        let events = session.tick(&mut state, 6_000);
        assert_eq!(events, vec![SessionEvent::Connected]);
        assert_eq!(session.transport().connect_attempts, 2);
    }

    #[test]
    fn backoff_deadline_spans_counter_wraparound() {
        let mut broker = FakeBroker::online();
        broker.fail_next_connects(1);
        let mut session = session(broker);
        let mut state = ConnectivityState::default();

        let failed_at = u32::MAX - 400;
        let _ = session.tick(&mut state, failed_at);
        let _ = session.tick(&mut state, 500);
        assert!(!state.connected);

        let _ = session.tick(&mut state, 600);
        assert!(state.connected);
    }

    #[test]
    fn connect_subscribes_and_announces_online() {
        let mut session = session(FakeBroker::online());
        let mut state = ConnectivityState::default();

        let _ = session.tick(&mut state, 0);

        assert_eq!(session.transport().subscriptions, vec!["dev/cmnd"]);
        assert_eq!(
            session.transport().payloads_on("dev/status"),
            vec![("online".to_string(), true)]
        );
    }

    #[test]
    fn skips_attempts_without_network() {
        let mut session = session(FakeBroker::offline());
        let mut state = ConnectivityState::default();

        let _ = session.tick(&mut state, 0);
        let _ = session.tick(&mut state, 10_000);

        assert_eq!(session.transport().connect_attempts, 0);
        assert_eq!(state.backoff_ms, 0);
    }

    #[test]
    fn publish_is_dropped_while_disconnected() {
        let mut session = session(FakeBroker::online());
        let state = ConnectivityState::default();

        assert!(!session.publish(&state, "dev/state", b"1", true));
        assert!(session.transport().published.is_empty());
    }

    #[test]
    fn publish_is_dropped_when_network_vanishes() {
        let mut session = session(FakeBroker::online());
        let mut state = ConnectivityState::default();
        let _ = session.tick(&mut state, 0);

        session.transport_mut().network = false;

        assert!(!session.publish(&state, "dev/state", b"1", true));
        assert!(session.transport().payloads_on("dev/state").is_empty());
    }

    #[test]
    fn lost_link_returns_to_disconnected_without_extra_penalty() {
        let mut session = session(FakeBroker::online());
        let mut state = ConnectivityState::default();
        let _ = session.tick(&mut state, 0);

        session.transport_mut().drop_link();
        let events = session.tick(&mut state, 10);

        assert_eq!(events, vec![SessionEvent::Disconnected]);
        assert!(!state.connected);
        assert_eq!(state.backoff_ms, 0);

        let events = session.tick(&mut state, 20);
        assert_eq!(events, vec![SessionEvent::Connected]);
    }

    #[test]
    fn delivers_inbound_messages_while_connected() {
        let mut session = session(FakeBroker::online());
        let mut state = ConnectivityState::default();
        let _ = session.tick(&mut state, 0);

        session.transport_mut().deliver("dev/cmnd", b"1");
        session.transport_mut().deliver("dev/cmnd", b"0");
        let events = session.tick(&mut state, 10);

        assert_eq!(
            events,
            vec![
                SessionEvent::Message(InboundMessage {
                    topic: "dev/cmnd".to_string(),
                    payload: b"1".to_vec(),
                }),
                SessionEvent::Message(InboundMessage {
                    topic: "dev/cmnd".to_string(),
                    payload: b"0".to_vec(),
                }),
            ]
        );
    }

    #[test]
    fn failed_publish_reports_false() {
        let mut session = session(FakeBroker::online());
        let mut state = ConnectivityState::default();
        let _ = session.tick(&mut state, 0);

        session.transport_mut().publish_error = Some(LinkError::QueueFull);

        assert!(!session.publish(&state, "dev/state", b"1", true));
    }
}
