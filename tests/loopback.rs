//! End-to-end tests over real loopback sockets: full handshake, registry sync and typed
//!  message exchange between in-process server and client endpoints.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use gamenet::auth::authority::KeySource;
use gamenet::auth::token::{unix_now, AuthToken};
use gamenet::config::{AuthMode, NetConfig};
use gamenet::connection::ConnectionId;
use gamenet::crypto::generate_server_keypair;
use gamenet::events::ConnectionEvent;
use gamenet::manager::NetManager;
use gamenet::registry::{HandlerSide, NetMessage};
use gamenet::transport::packet::DeliveryClass;
use gamenet::wire::{put_string, try_get_string};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Chat {
    text: String,
}

impl NetMessage for Chat {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.text);
    }
    fn try_deser(buf: &mut impl Buf) -> Result<Chat> {
        Ok(Chat { text: try_get_string(buf)? })
    }
}

struct FixedKeySource(VerifyingKey);

#[async_trait::async_trait]
impl KeySource for FixedKeySource {
    async fn fetch_key(&self) -> Result<VerifyingKey> {
        Ok(self.0)
    }
}

fn loopback_config() -> NetConfig {
    NetConfig::new("127.0.0.1:0".parse().unwrap())
}

type ChatLog = Arc<Mutex<Vec<(ConnectionId, Chat)>>>;

fn server_with_chat_log() -> (NetManager, ChatLog) {
    let log: ChatLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let mut server = NetManager::new(loopback_config()).unwrap();
    server
        .register_message_type::<Chat>("chat", HandlerSide::Server, move |conn, msg: Chat| {
            sink.lock().unwrap().push((conn, msg));
        })
        .unwrap();
    (server, log)
}

fn client() -> NetManager {
    let mut client = NetManager::new(loopback_config()).unwrap();
    client
        .register_message_type::<Chat>("chat", HandlerSide::Server, |_, _| {})
        .unwrap();
    client
}

async fn pump_until(managers: &mut [&mut NetManager], mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        for manager in managers.iter_mut() {
            manager.pump(Instant::now());
        }
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached while pumping");
}

fn drain_events(receiver: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_connect_and_exchange_typed_messages() {
    let (mut server, chat_log) = server_with_chat_log();
    server.start_server().await.unwrap();
    let server_addr = server.local_addrs()[0];

    let mut client = client();
    let mut client_events = client.subscribe();
    client.connect(server_addr, "pilot", None).await.unwrap();

    // sent before the registry sync: must be queued and flushed in order
    client
        .send_to_server(&Chat { text: "first".to_string() }, DeliveryClass::ReliableOrdered)
        .unwrap();

    {
        let log = chat_log.clone();
        pump_until(&mut [&mut server, &mut client], move || {
            !log.lock().unwrap().is_empty()
        })
        .await;
    }

    client
        .send_to_server(&Chat { text: "second".to_string() }, DeliveryClass::ReliableOrdered)
        .unwrap();
    {
        let log = chat_log.clone();
        pump_until(&mut [&mut server, &mut client], move || {
            log.lock().unwrap().len() >= 2
        })
        .await;
    }

    let chats: Vec<String> = chat_log.lock().unwrap().iter().map(|(_, c)| c.text.clone()).collect();
    assert_eq!(chats, vec!["first".to_string(), "second".to_string()]);

    let connected = drain_events(&mut client_events)
        .into_iter()
        .find_map(|e| match e {
            ConnectionEvent::Connected { player_name, user_id, .. } => Some((player_name, user_id)),
            _ => None,
        })
        .expect("client never reported Connected");
    assert_eq!(connected.0, "pilot");

    assert_eq!(server.connected_players().len(), 1);
    assert_eq!(server.connected_players()[0].1, "pilot");

    let server_side_id = server.connected_players()[0].0;
    let stats = server.stats(server_side_id).unwrap();
    assert!(stats.reliable_receiver.packets_received >= 2);
}

#[tokio::test]
async fn test_second_client_with_the_same_name_is_disambiguated() {
    let (mut server, _) = server_with_chat_log();
    server.start_server().await.unwrap();
    let server_addr = server.local_addrs()[0];

    let mut first = client();
    first.connect(server_addr, "pilot", None).await.unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let mut server_events = server.subscribe();
    {
        let names = names.clone();
        pump_until(&mut [&mut server, &mut first], move || {
            while let Ok(event) = server_events.try_recv() {
                if let ConnectionEvent::Connected { player_name, .. } = event {
                    names.lock().unwrap().push(player_name);
                }
            }
            !names.lock().unwrap().is_empty()
        })
        .await;
    }

    let mut second = client();
    let mut server_events = server.subscribe();
    second.connect(server_addr, "pilot", None).await.unwrap();
    {
        let names = names.clone();
        pump_until(&mut [&mut server, &mut second], move || {
            while let Ok(event) = server_events.try_recv() {
                if let ConnectionEvent::Connected { player_name, .. } = event {
                    names.lock().unwrap().push(player_name);
                }
            }
            names.lock().unwrap().len() >= 2
        })
        .await;
    }

    assert_eq!(*names.lock().unwrap(), vec!["pilot".to_string(), "pilot_2".to_string()]);
}

#[tokio::test]
async fn test_auth_required_rejects_anonymous_clients() {
    let authority_key = SigningKey::generate(&mut OsRng);

    let mut config = loopback_config();
    config.auth_mode = AuthMode::Required;
    config.auth_authority_url = Some("http://unused.invalid/key".to_string());
    config.loopback_auth_bypass = false;

    let mut server = NetManager::new(config).unwrap();
    server
        .start_server_with_key_source(FixedKeySource(authority_key.verifying_key()))
        .await
        .unwrap();
    let server_addr = server.local_addrs()[0];

    let mut anon = client();
    let mut anon_events = anon.subscribe();
    anon.connect(server_addr, "pilot", None).await.unwrap();

    let rejected = Arc::new(Mutex::new(None));
    {
        let rejected = rejected.clone();
        pump_until(&mut [&mut server, &mut anon], move || {
            if let Ok(event) = anon_events.try_recv() {
                *rejected.lock().unwrap() = Some(event);
            }
            rejected.lock().unwrap().is_some()
        })
        .await;
    }

    match rejected.lock().unwrap().take().unwrap() {
        ConnectionEvent::ConnectFailed { reason, .. } => {
            assert_eq!(reason, "authentication required")
        }
        other => panic!("unexpected event {:?}", other),
    };
}

#[tokio::test]
async fn test_auth_required_accepts_a_valid_token() {
    let authority_key = SigningKey::generate(&mut OsRng);

    let mut config = loopback_config();
    config.auth_mode = AuthMode::Required;
    config.auth_authority_url = Some("http://unused.invalid/key".to_string());
    config.loopback_auth_bypass = false;

    let mut server = NetManager::new(config).unwrap();
    let mut server_events = server.subscribe();
    server
        .start_server_with_key_source(FixedKeySource(authority_key.verifying_key()))
        .await
        .unwrap();
    let server_addr = server.local_addrs()[0];

    let token = AuthToken::issue(&authority_key, 42, "pilot", unix_now() + 3600);
    let mut authed = client();
    authed.connect(server_addr, "pilot", Some(token)).await.unwrap();

    let connected = Arc::new(Mutex::new(None));
    {
        let connected = connected.clone();
        pump_until(&mut [&mut server, &mut authed], move || {
            while let Ok(event) = server_events.try_recv() {
                if matches!(event, ConnectionEvent::Connected { .. }) {
                    *connected.lock().unwrap() = Some(event);
                }
            }
            connected.lock().unwrap().is_some()
        })
        .await;
    }

    match connected.lock().unwrap().take().unwrap() {
        ConnectionEvent::Connected { player_name, user_id, .. } => {
            assert_eq!(player_name, "pilot");
            assert_eq!(user_id, 42);
        }
        other => panic!("unexpected event {:?}", other),
    };
}

#[tokio::test]
async fn test_encrypted_session_exchanges_messages() {
    let (server_secret, server_public) = generate_server_keypair();

    let mut server_config = loopback_config();
    server_config.server_secret_key = Some(server_secret);
    server_config.server_public_key = Some(server_public);
    server_config.encryption = true;

    let chat_log: ChatLog = Arc::new(Mutex::new(Vec::new()));
    let sink = chat_log.clone();
    let mut server = NetManager::new(server_config).unwrap();
    server
        .register_message_type::<Chat>("chat", HandlerSide::Server, move |conn, msg: Chat| {
            sink.lock().unwrap().push((conn, msg));
        })
        .unwrap();
    server.start_server().await.unwrap();
    let server_addr = server.local_addrs()[0];

    let mut client_config = loopback_config();
    client_config.encryption = true;
    client_config.server_public_key = Some(server_public);
    let mut client = NetManager::new(client_config).unwrap();
    client
        .register_message_type::<Chat>("chat", HandlerSide::Server, |_, _| {})
        .unwrap();
    client.connect(server_addr, "spy", None).await.unwrap();

    client
        .send_to_server(&Chat { text: "secret".to_string() }, DeliveryClass::ReliableOrdered)
        .unwrap();

    {
        let log = chat_log.clone();
        pump_until(&mut [&mut server, &mut client], move || {
            !log.lock().unwrap().is_empty()
        })
        .await;
    }
    assert_eq!(chat_log.lock().unwrap()[0].1.text, "secret");
}
