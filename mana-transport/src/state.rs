//! Connection lifecycle, fed by the HELLO exchange, socket transitions
//! and heartbeat outcomes. Observers subscribe to the `statechange`,
//! `diagnostic` and `policy` channels of the event bus.

use mana_common::eventhub::{EventHub, EventSender, EventSubscription};
use mana_common::DiagnosticRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChange {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },
    Diagnostic(DiagnosticRecord),
    Policy(DiagnosticRecord),
}

pub struct ConnectionStateMachine {
    phase: ConnectionPhase,
    server_name: Option<String>,
    server_caps: Option<Vec<String>>,
    sender: EventSender<ConnectionEvent>,
}

pub struct ConnectionBus {
    hub: EventHub<ConnectionEvent>,
}

impl ConnectionBus {
    pub async fn subscribe_statechange(&mut self) -> EventSubscription<ConnectionEvent> {
        self.hub
            .subscribe(|e| matches!(e, ConnectionEvent::StateChange { .. }))
            .await
    }

    pub async fn subscribe_diagnostic(&mut self) -> EventSubscription<ConnectionEvent> {
        self.hub
            .subscribe(|e| matches!(e, ConnectionEvent::Diagnostic(_)))
            .await
    }

    pub async fn subscribe_policy(&mut self) -> EventSubscription<ConnectionEvent> {
        self.hub
            .subscribe(|e| matches!(e, ConnectionEvent::Policy(_)))
            .await
    }

    pub async fn subscribe_all(&mut self) -> EventSubscription<ConnectionEvent> {
        self.hub.subscribe(|_| true).await
    }
}

impl ConnectionStateMachine {
    pub fn setup() -> (Self, ConnectionBus) {
        let (hub, sender) = EventHub::setup();
        (
            ConnectionStateMachine {
                phase: ConnectionPhase::Idle,
                server_name: None,
                server_caps: None,
                sender,
            },
            ConnectionBus { hub },
        )
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn server_caps(&self) -> Option<&[String]> {
        self.server_caps.as_deref()
    }

    async fn transition(&mut self, to: ConnectionPhase) {
        if self.phase == to {
            return;
        }
        let from = self.phase;
        info!(?from, ?to, "connection state change");
        self.phase = to;
        let _ = self
            .sender
            .send(ConnectionEvent::StateChange { from, to })
            .await;
    }

    pub async fn socket_opened(&mut self) {
        self.transition(ConnectionPhase::Connecting).await;
    }

    pub async fn hello_sent(&mut self) {
        if self.phase == ConnectionPhase::Connecting {
            self.transition(ConnectionPhase::Authenticating).await;
        }
    }

    pub async fn hello_received(&mut self, server_name: String, caps: Option<Vec<String>>) {
        self.server_name = Some(server_name);
        self.server_caps = caps;
        self.transition(ConnectionPhase::Ready).await;
    }

    /// Two consecutive heartbeat probes went unanswered.
    pub async fn heartbeats_lost(&mut self) {
        if self.phase != ConnectionPhase::Closed {
            self.transition(ConnectionPhase::Reconnecting).await;
        }
    }

    pub async fn socket_closed(&mut self, resumable: bool) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        if resumable {
            self.transition(ConnectionPhase::Reconnecting).await;
        } else {
            self.transition(ConnectionPhase::Closed).await;
        }
    }

    pub async fn close(&mut self) {
        self.transition(ConnectionPhase::Closed).await;
    }

    pub async fn diagnostic(&self, record: DiagnosticRecord) {
        let _ = self.sender.send(ConnectionEvent::Diagnostic(record)).await;
    }

    pub async fn policy(&self, record: DiagnosticRecord) {
        let _ = self.sender.send(ConnectionEvent::Policy(record)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walks_the_connect_path() {
        let (mut machine, mut bus) = ConnectionStateMachine::setup();
        let mut changes = bus.subscribe_statechange().await;

        machine.socket_opened().await;
        machine.hello_sent().await;
        machine
            .hello_received("gateway-7".into(), Some(vec!["resume".into()]))
            .await;
        assert_eq!(machine.phase(), ConnectionPhase::Ready);
        assert_eq!(machine.server_name(), Some("gateway-7"));

        let expected = [
            (ConnectionPhase::Idle, ConnectionPhase::Connecting),
            (ConnectionPhase::Connecting, ConnectionPhase::Authenticating),
            (ConnectionPhase::Authenticating, ConnectionPhase::Ready),
        ];
        for (from, to) in expected {
            match changes.recv().await.unwrap() {
                ConnectionEvent::StateChange { from: f, to: t } => {
                    assert_eq!((f, t), (from, to));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_loss_reconnects() {
        let (mut machine, mut bus) = ConnectionStateMachine::setup();
        let mut all = bus.subscribe_all().await;
        machine.socket_opened().await;
        machine.hello_sent().await;
        machine.hello_received("gw".into(), None).await;
        machine.heartbeats_lost().await;
        assert_eq!(machine.phase(), ConnectionPhase::Reconnecting);
        // Drain: the subscription saw every transition.
        let mut count = 0;
        while all.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn policy_channel_is_filtered() {
        let (machine, mut bus) = ConnectionStateMachine::setup();
        let mut policy = bus.subscribe_policy().await;
        let mut diagnostic = bus.subscribe_diagnostic().await;

        machine
            .policy(DiagnosticRecord::info("buffer_state", "high"))
            .await;
        machine
            .diagnostic(DiagnosticRecord::warning("probe", "late"))
            .await;

        assert!(matches!(
            policy.recv().await.unwrap(),
            ConnectionEvent::Policy(_)
        ));
        assert!(matches!(
            diagnostic.recv().await.unwrap(),
            ConnectionEvent::Diagnostic(_)
        ));
        assert!(policy.try_recv().is_none());
    }
}
