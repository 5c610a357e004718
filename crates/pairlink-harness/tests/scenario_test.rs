//! End-to-end session scenarios.
//!
//! Each scenario drives one session against the simulated libraries and web
//! client, then verifies the final world with an oracle.

use std::{sync::Arc, thread};

use ciborium::Value;
use pairlink_core::{
    DisconnectContext, DisconnectReason, Envelope, MessageType, SessionState, SessionStateKind,
    transport::{
        ChannelKind, ChannelState, HandshakeKeys, PeerConnectionState, SignalingState,
        TaskVersion, TransportEvent, TransportEvents,
    },
};
use pairlink_harness::{LogEntry, Scenario, Step, TransportCall, World};
use pairlink_proto::ConnectionDisconnect;
use pairlink_session::{EventSink, WorkerEvent, WorkerHandle};

fn disconnect_notices(world: &World) -> Vec<DisconnectReason> {
    world
        .sent()
        .iter()
        .filter(|e| e.is_connection_disconnect())
        .filter_map(|e| ConnectionDisconnect::from_envelope(e).ok())
        .map(|c| c.reason)
        .collect()
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).expect("CBOR encoding into a Vec");
    bytes
}

#[test]
fn scenario_a_connect_reaches_connected() {
    Scenario::new("connect reaches connected")
        .connected()
        .oracle(Box::new(|world| {
            if !world.is_connected() {
                return Err(format!("expected Connected, got {:?}", world.state()));
            }
            if world.state().connection_id() != Some(1) {
                return Err(format!("expected connection 1, got {:?}", world.state()));
            }

            let params = world.network.params(0).ok_or("no transport created")?;
            if params.tasks != TaskVersion::PREFERRED.to_vec() || !params.handover {
                return Err(format!("unexpected task offer {:?}", params.tasks));
            }
            if !matches!(params.keys, HandshakeKeys::Initiator { .. }) {
                return Err("start must use initiator keys".into());
            }

            let calls = world.network.calls(0);
            for expected in [
                TransportCall::Connect,
                TransportCall::CreatePeerConnection,
                TransportCall::Handover,
            ] {
                if !calls.contains(&expected) {
                    return Err(format!("missing {expected:?} in {calls:?}"));
                }
            }

            if world.log.states() != vec![SessionStateKind::Connecting, SessionStateKind::Connected]
            {
                return Err(format!("listeners saw {:?}", world.log.states()));
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn scenario_b_local_stop_notifies_peer_before_teardown() {
    let reason = DisconnectContext::by_us(DisconnectReason::SessionStopped);

    Scenario::new("local stop notifies peer")
        .connected()
        .stop(reason)
        .oracle(Box::new(move |world| {
            if world.state() != &SessionState::Disconnected {
                return Err(format!("expected Disconnected, got {:?}", world.state()));
            }
            if disconnect_notices(world) != vec![DisconnectReason::SessionStopped] {
                return Err(format!("notices {:?}", disconnect_notices(world)));
            }

            let calls = world.network.calls(0);
            let last_send = calls
                .iter()
                .rposition(|c| matches!(c, TransportCall::Send { channel: ChannelKind::Application, .. }));
            let close = calls
                .iter()
                .position(|c| c == &TransportCall::CloseChannel(ChannelKind::Application));
            match (last_send, close) {
                (Some(send), Some(close)) if send < close => {},
                _ => return Err(format!("notice not sent before teardown: {calls:?}")),
            }

            if world.log.stopped() != vec![reason] || reason.should_forget() {
                return Err(format!("stopped {:?}", world.log.stopped()));
            }
            if !world.network.is_dropped(0) {
                return Err("transport not released".into());
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn scenario_c_deleted_session_is_forgotten() {
    let reason = DisconnectContext::by_us(DisconnectReason::SessionDeleted);

    Scenario::new("deleted session is forgotten")
        .connected()
        .stop(reason)
        .oracle(Box::new(move |world| {
            if world.state_kind() != SessionStateKind::Disconnected {
                return Err(format!("expected Disconnected, got {}", world.state_kind()));
            }
            let stopped = world.log.stopped();
            if stopped.len() != 1 || !stopped[0].should_forget() {
                return Err(format!("stopped {stopped:?}"));
            }
            if disconnect_notices(world) != vec![DisconnectReason::SessionDeleted] {
                return Err(format!("notices {:?}", disconnect_notices(world)));
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn scenario_d_non_string_type_is_protocol_error() {
    let message = encode_value(&Value::Map(vec![
        (Value::Text("type".into()), Value::Integer(5.into())),
        (Value::Text("subType".into()), Value::Text("echo".into())),
    ]));

    Scenario::new("non-string type")
        .connected()
        .step(Step::PeerSendsRaw(message))
        .oracle(Box::new(|world| {
            if world.state_kind() != SessionStateKind::Error {
                return Err(format!("expected Error, got {:?}", world.state()));
            }
            let reason = world.error_reason().unwrap_or_default();
            if !reason.starts_with("Protocol error") {
                return Err(format!("unexpected diagnostic {reason:?}"));
            }
            if world.log.stopped() != vec![DisconnectContext::by_us(DisconnectReason::Error)] {
                return Err(format!("stopped {:?}", world.log.stopped()));
            }
            if world.log.count(|e| matches!(e, LogEntry::Message(_))) != 0 {
                return Err("invalid envelope reached listeners".into());
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn scenario_e_concurrent_channel_callbacks_are_serialized() {
    const PER_THREAD: usize = 200;

    let (handle, mut rx) = WorkerHandle::channel();
    let sink = Arc::new(EventSink::new(1, Arc::default(), handle));

    let threads: Vec<_> = [ChannelState::Connecting, ChannelState::Open]
        .into_iter()
        .map(|state| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for amount in 0..PER_THREAD {
                    sink.emit(TransportEvent::ChannelStateChanged {
                        channel: ChannelKind::Application,
                        state,
                    });
                    sink.emit(TransportEvent::BufferedAmountChanged {
                        channel: ChannelKind::Application,
                        amount,
                    });
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("emitter thread");
    }

    let mut last = 0;
    let mut states = 0;
    let mut amounts = vec![0usize; PER_THREAD];
    while let Ok(event) = rx.try_recv() {
        let WorkerEvent::Transport { connection_id, sequence, event } = event else {
            panic!("unexpected worker event");
        };
        assert_eq!(connection_id, 1);
        let sequence = sequence.expect("channel events carry a sequence");
        assert_eq!(sequence, last + 1, "worker must see sequences in order");
        last = sequence;

        match event {
            TransportEvent::ChannelStateChanged { channel: ChannelKind::Application, state } => {
                assert!(matches!(state, ChannelState::Connecting | ChannelState::Open));
                states += 1;
            },
            TransportEvent::BufferedAmountChanged { channel: ChannelKind::Application, amount } => {
                amounts[amount] += 1;
            },
            other => panic!("corrupted event {other:?}"),
        }
    }

    assert_eq!(last, (4 * PER_THREAD) as u64);
    assert_eq!(states, 2 * PER_THREAD);
    assert!(amounts.iter().all(|&n| n == 2));
}

#[test]
fn interleaved_chunks_are_reassembled_per_message() {
    let requests: Vec<Envelope> = (0..4u8)
        .map(|i| {
            Envelope::new(MessageType::Request, "echo")
                .with_arg("n", u64::from(i))
                .with_data(Value::Bytes(vec![i; 40_000]))
        })
        .collect();

    Scenario::new("interleaved chunks")
        .seed(42)
        .connected()
        .step(Step::PeerSendsShuffled(requests))
        .oracle(Box::new(|world| {
            if !world.is_connected() {
                return Err(format!("expected Connected, got {:?}", world.state()));
            }
            let mut echoed: Vec<u8> = world
                .sent()
                .into_iter()
                .filter(|e| e.sub_type == "echo")
                .filter_map(|e| match e.data {
                    Some(Value::Bytes(data)) if data.len() == 40_000 => data.first().copied(),
                    _ => None,
                })
                .collect();
            echoed.sort_unstable();
            if echoed != vec![0, 1, 2, 3] {
                return Err(format!("echoed payloads {echoed:?}"));
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn peer_disconnect_stops_session_without_notice() {
    Scenario::new("peer disconnect")
        .connected()
        .peer_sends(ConnectionDisconnect { reason: DisconnectReason::SessionStopped }.to_envelope())
        .oracle(Box::new(|world| {
            if world.state() != &SessionState::Disconnected {
                return Err(format!("expected Disconnected, got {:?}", world.state()));
            }
            let expected = DisconnectContext::by_peer(DisconnectReason::SessionStopped);
            if world.log.stopped() != vec![expected] {
                return Err(format!("stopped {:?}", world.log.stopped()));
            }
            if !disconnect_notices(world).is_empty() {
                return Err("peer initiated disconnect must not be echoed".into());
            }
            Ok(())
        }))
        .run()
        .expect("scenario should pass");
}

#[test]
fn second_application_channel_is_error() {
    Scenario::new("second application channel")
        .connected()
        .step(Step::Emit(TransportEvent::ChannelAnnounced {
            label: "second".into(),
            state: ChannelState::Open,
        }))
        .oracle(Box::new(|world| {
            match world.error_reason() {
                Some("A data channel is already registered") => Ok(()),
                other => Err(format!("unexpected state {:?} ({other:?})", world.state())),
            }
        }))
        .run()
        .expect("scenario should pass");
}

fn up_to_peer_connection(scenario: Scenario) -> Scenario {
    let events = [
        TransportEvent::SignalingStateChanged(SignalingState::WsConnecting),
        TransportEvent::SignalingStateChanged(SignalingState::ServerHandshake),
        TransportEvent::SignalingStateChanged(SignalingState::PeerHandshake),
        TransportEvent::SignalingStateChanged(SignalingState::Task),
        TransportEvent::PeerConnectionStateChanged(PeerConnectionState::Connected),
        TransportEvent::ChannelStateChanged {
            channel: ChannelKind::Signaling,
            state: ChannelState::Open,
        },
    ];
    events.into_iter().fold(scenario.start(), |scenario, event| scenario.step(Step::Emit(event)))
}

fn connected_once(world: &World) -> Result<(), String> {
    if !world.is_connected() {
        return Err(format!("expected Connected, got {:?}", world.state()));
    }
    let connects = world
        .log
        .entries()
        .iter()
        .filter(|e| matches!(e, LogEntry::StateChanged { new: SessionStateKind::Connected, .. }))
        .count();
    if connects != 1 {
        return Err(format!("listeners saw Connected {connects} times"));
    }
    Ok(())
}

#[test]
fn application_open_before_announce_still_connects() {
    up_to_peer_connection(Scenario::new("open before announce"))
        .step(Step::Emit(TransportEvent::ChannelStateChanged {
            channel: ChannelKind::Application,
            state: ChannelState::Open,
        }))
        .step(Step::Emit(TransportEvent::ChannelAnnounced {
            label: "app".into(),
            state: ChannelState::Connecting,
        }))
        .oracle(Box::new(connected_once))
        .run()
        .expect("scenario should pass");
}

#[test]
fn announced_open_then_open_again_connects_once() {
    up_to_peer_connection(Scenario::new("announced open then open"))
        .step(Step::Emit(TransportEvent::ChannelAnnounced {
            label: "app".into(),
            state: ChannelState::Open,
        }))
        .step(Step::Emit(TransportEvent::ChannelStateChanged {
            channel: ChannelKind::Application,
            state: ChannelState::Open,
        }))
        .oracle(Box::new(connected_once))
        .run()
        .expect("scenario should pass");
}
