use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::ConnectionId;

/// Lifecycle notifications surfaced to the application. Events are broadcast, i.e. every
///  subscriber sees every event; subscribing after the fact misses earlier events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// a handshake started: client side on initiating, server side on the first
    ///  CONNECT from a new address
    Connecting {
        addr: SocketAddr,
    },
    /// handshake completed, the connection is ready for application messages
    Connected {
        connection_id: ConnectionId,
        addr: SocketAddr,
        /// server-assigned player name, disambiguated if the requested name was taken
        player_name: String,
        user_id: u64,
    },
    /// an established connection went away
    Disconnected {
        connection_id: ConnectionId,
        reason: String,
    },
    /// a client-side connection attempt failed before it was established
    ConnectFailed {
        addr: SocketAddr,
        reason: String,
    },
}

pub struct EventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventNotifier {
    pub fn new() -> EventNotifier {
        let (sender, _) = broadcast::channel(256);
        EventNotifier { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ConnectionEvent) {
        debug!("connection event: {:?}", event);
        // an error just means there are no subscribers at the moment
        let _ = self.sender.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        EventNotifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let notifier = EventNotifier::new();
        let mut receiver = notifier.subscribe();

        let event = ConnectionEvent::Disconnected {
            connection_id: ConnectionId(7),
            reason: "timeout".to_string(),
        };
        notifier.publish(event.clone());
        assert_eq!(receiver.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_a_no_op() {
        let notifier = EventNotifier::new();
        notifier.publish(ConnectionEvent::ConnectFailed {
            addr: "127.0.0.1:9000".parse().unwrap(),
            reason: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let notifier = EventNotifier::new();
        notifier.publish(ConnectionEvent::Disconnected {
            connection_id: ConnectionId(1),
            reason: "early".to_string(),
        });

        let mut receiver = notifier.subscribe();
        notifier.publish(ConnectionEvent::Disconnected {
            connection_id: ConnectionId(2),
            reason: "late".to_string(),
        });
        match receiver.recv().await.unwrap() {
            ConnectionEvent::Disconnected { connection_id, .. } => {
                assert_eq!(connection_id, ConnectionId(2))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
