// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT transport against a scripted broker.
//!
//! The broker is a minimal MQTT 3.1.1 listener that answers CONNECT,
//! SUBSCRIBE, PUBLISH (QoS 1), and PINGREQ, and records every subscription
//! it receives. Unlike a full broker it can drop a connection on cue, which
//! is what the reconnect tests need.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use fleetgate::credential::{DerivedCredential, derive_device_key};
use fleetgate::transport::{
    Disposition, InboundHandler, LinkState, MqttSession, MqttTransportBuilder, SendStatus,
    Transport, TransportSession,
};

const GROUP_KEY: &str = "c2hhcmVkLWdyb3VwLWtleQ==";

fn credential(device_id: &str) -> DerivedCredential {
    derive_device_key(GROUP_KEY, device_id).unwrap()
}

fn noop_handler() -> InboundHandler {
    Arc::new(|_| Disposition::Complete)
}

// ============================================================================
// Scripted broker
// ============================================================================

/// Reads one MQTT control packet: returns the first header byte and the
/// variable-header-plus-payload bytes.
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        len |= usize::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((first[0], body))
}

/// Serves one client connection until it ends.
///
/// When `drop_after_subscribe` is set, the connection is cut right after the
/// SUBACK, forcing the client through a reconnect.
async fn serve_connection(
    mut stream: TcpStream,
    subscriptions: Arc<Mutex<Vec<String>>>,
    drop_after_subscribe: bool,
) {
    loop {
        let Ok((header, body)) = read_packet(&mut stream).await else {
            return;
        };

        match header >> 4 {
            // CONNECT -> CONNACK, session not present, accepted.
            1 => {
                if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                    return;
                }
            }
            // SUBSCRIBE -> record the filter, answer SUBACK granting QoS 1.
            8 => {
                let topic_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
                let topic = String::from_utf8_lossy(&body[4..4 + topic_len]).to_string();
                subscriptions.lock().unwrap().push(topic);

                let suback = [0x90, 0x03, body[0], body[1], 0x01];
                if stream.write_all(&suback).await.is_err() {
                    return;
                }
                if drop_after_subscribe {
                    return;
                }
            }
            // PUBLISH QoS 1 -> PUBACK with the packet id.
            3 => {
                if (header >> 1) & 0x03 == 1 {
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let pkid_at = 2 + topic_len;
                    let puback = [0x40, 0x02, body[pkid_at], body[pkid_at + 1]];
                    if stream.write_all(&puback).await.is_err() {
                        return;
                    }
                }
            }
            // PINGREQ -> PINGRESP.
            12 => {
                if stream.write_all(&[0xD0, 0x00]).await.is_err() {
                    return;
                }
            }
            // DISCONNECT ends the connection.
            14 => return,
            _ => {}
        }
    }
}

/// Starts a broker on an ephemeral port; returns its address and the
/// recorded subscriptions.
async fn start_broker(drop_first_connection: bool) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let subscriptions = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&subscriptions);
    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let drop_after = drop_first_connection && first;
            first = false;
            serve_connection(stream, Arc::clone(&recorded), drop_after).await;
        }
    });

    (addr, subscriptions)
}

async fn open_session(addr: &str, device_id: &str) -> MqttSession {
    let transport = MqttTransportBuilder::new()
        .with_open_timeout(Duration::from_secs(5))
        .build();
    transport
        .open(&format!("mqtt://{addr}"), &credential(device_id), noop_handler())
        .await
        .unwrap()
}

// ============================================================================
// Session lifecycle
// ============================================================================

mod session_lifecycle {
    use super::*;

    #[tokio::test]
    async fn open_subscribes_to_the_command_topic() {
        let (addr, subscriptions) = start_broker(false).await;
        let session = open_session(&addr, "dev-1").await;

        assert_eq!(*session.status().borrow(), LinkState::Open);

        timeout(Duration::from_secs(5), async {
            while subscriptions.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("subscription never reached the broker");

        assert_eq!(
            subscriptions.lock().unwrap().as_slice(),
            ["devices/dev-1/messages/commands/#"]
        );
        session.close().await;
    }

    #[tokio::test]
    async fn send_completes_on_acknowledgement() {
        let (addr, _subscriptions) = start_broker(false).await;
        let session = open_session(&addr, "dev-1").await;

        let rx = session
            .send(br#"{"id":"1"}"#.to_vec(), "application/json", "dev-1/1")
            .await
            .unwrap();
        let completion = timeout(Duration::from_secs(5), rx)
            .await
            .expect("no acknowledgement")
            .unwrap();

        assert_eq!(completion.status, SendStatus::Accepted);
        assert_eq!(completion.context, "dev-1/1");
        session.close().await;
    }

    #[tokio::test]
    async fn open_times_out_against_a_silent_endpoint() {
        // A listener that accepts but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                // Hold the socket open without speaking MQTT.
                std::mem::forget(stream);
            }
        });

        let transport = MqttTransportBuilder::new()
            .with_open_timeout(Duration::from_millis(300))
            .build();
        let err = transport
            .open(&format!("mqtt://{addr}"), &credential("dev-1"), noop_handler())
            .await
            .unwrap_err();

        assert!(err.cause.contains("did not open"), "got: {}", err.cause);
    }
}

// ============================================================================
// Reconnect and close semantics
// ============================================================================

mod reconnect {
    use super::*;

    #[tokio::test]
    async fn command_subscription_is_reissued_after_reconnect() {
        let (addr, subscriptions) = start_broker(true).await;
        let session = open_session(&addr, "dev-1").await;

        // The broker cuts the first connection right after the SUBACK; the
        // event loop retries and must subscribe again on the new session.
        timeout(Duration::from_secs(10), async {
            while subscriptions.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no resubscription after reconnect");

        let recorded = subscriptions.lock().unwrap().clone();
        assert_eq!(recorded.len(), 2);
        assert!(
            recorded
                .iter()
                .all(|topic| topic == "devices/dev-1/messages/commands/#")
        );

        let mut status = session.status();
        timeout(Duration::from_secs(5), status.wait_for(|s| s.is_open()))
            .await
            .expect("link did not recover")
            .unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_terminal_and_does_not_reconnect() {
        let (addr, _subscriptions) = start_broker(false).await;
        let session = open_session(&addr, "dev-1").await;

        session.close().await;

        let mut status = session.status();
        timeout(Duration::from_secs(2), status.wait_for(|s| s.is_closed()))
            .await
            .expect("close did not mark the link Closed")
            .unwrap();

        // The broker would happily accept a new connection; a deliberate
        // close must not take it.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*session.status().borrow(), LinkState::Closed);

        let err = session
            .send(b"{}".to_vec(), "application/json", "dev-1/9")
            .await
            .unwrap_err();
        assert!(matches!(err, fleetgate::error::SendError::LinkClosed));
    }
}
