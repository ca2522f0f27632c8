use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use icn_mesh_core::client::ClientEvent;
use icn_mesh_core::flow_control::is_pid_bigger;
use icn_mesh_core::sim::Sim;
use icn_mesh_core::wire::{MessageType, WireMessage};
use icn_mesh_core::{
    ClientId, Discovery, LookupHandle, MeshConfig, MeshError, MeshResult, MeshService, PeerIdentity, Scheduler,
    SendStatus, TaskId, TimerEvent, TunnelId, TunnelOptions, TunnelState, WireTunnelId, WriteToken,
};

const LATENCY: Duration = Duration::from_millis(10);
const PORT: u32 = 7;

fn reliable() -> TunnelOptions {
    TunnelOptions { reliable: true, no_buffer: false }
}

/// One payload admitted per hop at a time
fn narrow_window() -> MeshConfig {
    MeshConfig { max_msgs_queue: 1, max_tunnels: 2, ..MeshConfig::default() }
}

/// Line of `n` nodes, each linked to the next.
fn line(n: usize, config: MeshConfig) -> Sim {
    let mut sim = Sim::new(7);
    for _ in 0..n {
        sim.add_node(config.clone()).unwrap();
    }
    for i in 1..n {
        sim.link(i - 1, i, LATENCY);
    }
    sim
}

fn tunnel_state(sim: &Sim, node: usize, tid: TunnelId) -> Option<TunnelState> {
    sim.service(node).tunnel(tid).map(|t| t.state())
}

fn payloads(count: u8) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("message {}", i).into_bytes()).collect()
}

/// Every live tunnel on every node has exactly one endpoint on its owner
/// side, and exactly one on its destination side once a path is chosen.
fn assert_endpoints(sim: &Sim) {
    for node in 0..sim.len() {
        let service = sim.service(node);
        for tid in service.tunnel_ids() {
            let tunnel = service.tunnel(tid).unwrap();
            assert!(tunnel.check_endpoints(), "node {} tunnel {}", node, tid);
            if tunnel.is_destroying() {
                continue;
            }
            assert_ne!(tunnel.owner.is_some(), tunnel.prev_hop.is_some(), "node {} tunnel {}", node, tid);
            if tunnel.state() != TunnelState::Searching {
                assert_ne!(tunnel.client.is_some(), tunnel.next_hop.is_some(), "node {} tunnel {}", node, tid);
            }
        }
    }
}

/// Send `payload`, letting the network run until the tunnel admits it.
fn send_admitted(sim: &mut Sim, node: usize, client: ClientId, tid: TunnelId, payload: Vec<u8>) {
    let mut attempts = 0;
    while sim.send(node, client, tid, payload.clone()).unwrap() == SendStatus::Dropped {
        attempts += 1;
        assert!(attempts < 200, "tunnel {} never admitted the client", tid);
        sim.run_for(Duration::from_millis(50));
    }
}

fn was_destroyed(sim: &Sim, node: usize, client: ClientId) -> bool {
    sim.client_events(node, client)
        .iter()
        .any(|event| matches!(event, ClientEvent::TunnelDestroyed { .. }))
}

#[test_log::test]
fn test_direct_reliable_tunnel_delivers_in_order() {
    let mut sim = line(2, MeshConfig::default());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();

    let tid = sim.create_tunnel(0, sender, 1, PORT, reliable()).unwrap();
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Waiting));
    for payload in payloads(5) {
        assert_eq!(sim.send(0, sender, tid, payload).unwrap(), SendStatus::Queued);
    }
    sim.run_for(Duration::from_secs(2));

    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));
    assert_eq!(sim.delivered(1, listener), payloads(5));

    let created: Vec<_> = sim
        .client_events(1, listener)
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::TunnelCreated { initiator, port, options, .. } => Some((initiator, port, options)),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec![(sim.identity(0), PORT, reliable())]);

    // Every copy was acknowledged end to end
    let rel = sim.service(0).tunnel(tid).and_then(|t| t.reliability()).map(|r| r.pending());
    assert_eq!(rel, Some(0));
    assert_eq!(sim.service(0).metrics().retransmissions(), 0);
}

#[test_log::test]
fn test_lost_reliable_payload_is_retransmitted_and_reordered() {
    let mut sim = line(2, MeshConfig::default());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();

    let mut dropped = false;
    sim.add_drop_rule(Box::new(move |_, _, message| {
        if !dropped && matches!(message, WireMessage::DataForward(data) if data.mid == 2) {
            dropped = true;
            return true;
        }
        false
    }));

    let tid = sim.create_tunnel(0, sender, 1, PORT, reliable()).unwrap();
    for payload in payloads(5) {
        sim.send(0, sender, tid, payload).unwrap();
    }

    sim.run_for(Duration::from_secs(1));
    assert_eq!(sim.delivered(1, listener), payloads(2));
    assert_eq!(sim.stats().dropped_by_rule, 1);

    sim.run_for(Duration::from_secs(10));
    assert_eq!(sim.delivered(1, listener), payloads(5));
    assert!(sim.service(0).metrics().retransmissions() >= 1);
    let pending = sim.service(0).tunnel(tid).and_then(|t| t.reliability()).map(|r| r.pending());
    assert_eq!(pending, Some(0));
}

#[test_log::test]
fn test_broken_relay_link_sends_owner_back_to_searching() {
    let mut sim = line(3, MeshConfig::default());
    sim.script_lookup(0, 2, &[1]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(2, &[PORT], true).unwrap();

    let tid = sim.create_tunnel(0, sender, 2, PORT, TunnelOptions::default()).unwrap();
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Searching));
    assert_eq!(sim.lookups_started(0), 1);

    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));
    assert_eq!(sim.service(1).tunnel_ids().len(), 1);

    sim.unlink(1, 2);
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Searching));
    assert_eq!(sim.lookups_started(0), 2);
    assert!(sim.service(0).metrics().received(MessageType::PathBroken) >= 1);

    // A direct link lets the owner re-establish without discovery
    sim.link(0, 2, LATENCY);
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));
    sim.send(0, sender, tid, b"after repair".to_vec()).unwrap();
    sim.run_for(Duration::from_secs(1));
    assert_eq!(sim.delivered(2, listener), vec![b"after repair".to_vec()]);

    let created = sim
        .client_events(2, listener)
        .iter()
        .filter(|event| matches!(event, ClientEvent::TunnelCreated { .. }))
        .count();
    assert_eq!(created, 1);
}

#[test_log::test]
fn test_unadmitted_send_is_refused() {
    let mut sim = line(2, narrow_window());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 1, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));

    assert_eq!(sim.send(0, sender, tid, b"a".to_vec()).unwrap(), SendStatus::Queued);
    assert_eq!(sim.send(0, sender, tid, b"b".to_vec()).unwrap(), SendStatus::Dropped);
    assert_eq!(sim.service(0).metrics().dropped("unsolicited"), 1);

    sim.run_for(Duration::from_secs(1));
    let admitted = sim
        .client_events(0, sender)
        .iter()
        .any(|event| matches!(event, ClientEvent::Ack { tunnel, admission: 1 } if *tunnel == tid));
    assert!(admitted);

    assert_eq!(sim.send(0, sender, tid, b"c".to_vec()).unwrap(), SendStatus::Queued);
    sim.run_for(Duration::from_secs(3));
    assert_eq!(sim.delivered(1, listener), vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test_log::test]
fn test_lost_ack_recovered_by_poll() {
    let mut sim = line(2, narrow_window());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();

    let mut dropped = false;
    sim.add_drop_rule(Box::new(move |from, to, message| {
        if !dropped && from == 1 && to == 0 && matches!(message, WireMessage::Ack { .. }) {
            dropped = true;
            return true;
        }
        false
    }));

    let tid = sim.create_tunnel(0, sender, 1, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_millis(500));
    assert_eq!(sim.send(0, sender, tid, b"first".to_vec()).unwrap(), SendStatus::Queued);
    sim.run_for(Duration::from_millis(100));
    assert_eq!(sim.stats().dropped_by_rule, 1);

    // The client was admitted one more, but the hop never heard so
    assert_eq!(sim.send(0, sender, tid, b"second".to_vec()).unwrap(), SendStatus::Queued);
    sim.run_for(Duration::from_millis(500));
    assert_eq!(sim.delivered(1, listener), vec![b"first".to_vec()]);

    sim.run_for(Duration::from_secs(3));
    assert!(sim.service(0).metrics().polls() >= 1);
    assert!(sim.service(1).metrics().received(MessageType::Poll) >= 1);
    assert_eq!(sim.delivered(1, listener), vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test_log::test]
fn test_relayed_unreliable_stream_respects_admissions() {
    let mut sim = line(3, MeshConfig::default());
    sim.script_lookup(0, 2, &[1]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(2, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 2, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));

    let expected = payloads(30);
    for payload in &expected {
        let mut attempts = 0;
        while sim.send(0, sender, tid, payload.clone()).unwrap() == SendStatus::Dropped {
            attempts += 1;
            assert!(attempts < 100, "sender never admitted");
            sim.run_for(Duration::from_millis(50));
        }
    }
    sim.run_for(Duration::from_secs(5));

    assert_eq!(sim.delivered(2, listener), expected);
    assert_eq!(sim.service(1).metrics().dropped("buffer_full"), 0);
    assert_eq!(sim.service(2).metrics().dropped("unsolicited"), 0);
}

#[test_log::test]
fn test_ttl_expiry_drops_payload_at_relay() {
    let mut sim = Sim::new(1);
    sim.add_node(MeshConfig { default_ttl: 1, ..MeshConfig::default() }).unwrap();
    for _ in 0..3 {
        sim.add_node(MeshConfig::default()).unwrap();
    }
    for i in 1..4 {
        sim.link(i - 1, i, LATENCY);
    }
    sim.script_lookup(0, 3, &[1, 2]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(3, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 3, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));

    sim.send(0, sender, tid, b"short lived".to_vec()).unwrap();
    sim.run_for(Duration::from_secs(1));
    assert!(sim.delivered(3, listener).is_empty());
    assert_eq!(sim.service(2).metrics().dropped("ttl"), 1);
}

#[test_log::test]
fn test_unbound_port_refuses_tunnel() {
    let mut sim = line(2, MeshConfig::default());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let tid = sim.create_tunnel(0, sender, 1, 99, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));

    assert!(was_destroyed(&sim, 0, sender));
    assert!(sim.service(0).tunnel(tid).is_none());
    assert!(sim.service(1).tunnel_ids().is_empty());
}

#[test_log::test]
fn test_tunnel_to_self_and_unknown_client_are_rejected() {
    let mut sim = line(2, MeshConfig::default());
    let sender = sim.connect_client(0, &[], false).unwrap();

    let to_self = sim.create_tunnel(0, sender, 0, PORT, TunnelOptions::default());
    assert!(matches!(to_self, Err(MeshError::InvalidArgument(_))));
    let stranger = sim.create_tunnel(0, ClientId(42), 1, PORT, TunnelOptions::default());
    assert!(matches!(stranger, Err(MeshError::UnknownClient(42))));

    // A port can only be claimed once per peer
    sim.connect_client(1, &[PORT], false).unwrap();
    assert!(matches!(sim.connect_client(1, &[PORT], false), Err(MeshError::PortInUse(PORT))));
}

#[test_log::test]
fn test_client_disconnect_tears_down_both_ends() {
    let mut sim = line(2, MeshConfig::default());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 1, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));
    assert_eq!(sim.service(1).tunnel_ids().len(), 1);

    sim.service_mut(0).disconnect_client(sender).unwrap();
    sim.run_for(Duration::from_secs(1));

    assert!(sim.service(0).tunnel(tid).is_none());
    assert!(sim.service(1).tunnel_ids().is_empty());
    assert!(was_destroyed(&sim, 1, listener));
    assert!(matches!(
        sim.service_mut(0).disconnect_client(sender),
        Err(MeshError::UnknownClient(_))
    ));
}

#[test_log::test]
fn test_keepalives_hold_tunnel_and_silence_frees_it() {
    let config = MeshConfig { refresh_path_time: 1, ..MeshConfig::default() };
    let mut sim = line(3, config);
    sim.script_lookup(0, 2, &[1]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(2, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 2, PORT, TunnelOptions::default()).unwrap();

    sim.run_for(Duration::from_secs(10));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));
    assert_eq!(sim.service(2).tunnel_ids().len(), 1);
    assert!(sim.service(2).metrics().received(MessageType::Keepalive) >= 5);

    // The owner drops off; the relay stops hearing keepalives and gives up
    sim.unlink(0, 1);
    sim.run_for(Duration::from_secs(10));
    assert!(sim.service(1).tunnel_ids().is_empty());
    assert!(sim.service(2).tunnel_ids().is_empty());
    assert!(was_destroyed(&sim, 2, listener));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Searching));
}

#[test_log::test]
fn test_shutdown_releases_every_peer_reference() {
    let mut sim = line(3, MeshConfig::default());
    sim.script_lookup(0, 2, &[1]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    sim.connect_client(2, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 2, PORT, reliable()).unwrap();
    sim.run_for(Duration::from_secs(1));
    sim.send(0, sender, tid, b"in flight".to_vec()).unwrap();

    sim.shutdown();
    for node in 0..sim.len() {
        let service = sim.service(node);
        assert!(!service.is_running());
        assert_eq!(service.peer_table().live(), 0);
        assert!(service.registry().is_empty());
        assert!(service.tunnel_ids().is_empty());
    }
    // Stray events after shutdown are ignored
    sim.run_for(Duration::from_secs(5));
    assert!(sim.service(0).tunnel_ids().is_empty());
}

#[test_log::test]
fn test_send_refused_while_searching_keeps_client_admission() {
    let mut sim = Sim::new(11);
    sim.add_node(narrow_window()).unwrap();
    sim.add_node(narrow_window()).unwrap();
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], true).unwrap();

    let tid = sim.create_tunnel(0, sender, 1, PORT, TunnelOptions::default()).unwrap();
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Searching));
    assert_eq!(sim.send(0, sender, tid, b"too early".to_vec()).unwrap(), SendStatus::Dropped);

    sim.link(0, 1, LATENCY);
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));

    assert_eq!(sim.send(0, sender, tid, b"first".to_vec()).unwrap(), SendStatus::Queued);
    sim.run_for(Duration::from_secs(1));
    send_admitted(&mut sim, 0, sender, tid, b"second".to_vec());
    sim.run_for(Duration::from_secs(1));
    assert_eq!(sim.delivered(1, listener), vec![b"first".to_vec(), b"second".to_vec()]);
    assert_eq!(sim.service(0).metrics().dropped("unsolicited"), 0);
}

#[test_log::test]
fn test_destroy_frees_tunnel_with_payload_held_by_window() {
    let mut sim = line(2, narrow_window());
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(1, &[PORT], false).unwrap();
    let tid = sim.create_tunnel(0, sender, 1, PORT, reliable()).unwrap();
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));

    for payload in payloads(4) {
        assert_eq!(sim.send(0, sender, tid, payload).unwrap(), SendStatus::Queued);
    }
    // The listener never consumes, so only the first payload is ever admitted
    sim.run_for(Duration::from_secs(2));
    assert_eq!(sim.delivered(1, listener), payloads(1));
    assert_eq!(sim.service(0).tunnel(tid).map(|t| t.next_fc.queue_n), Some(3));

    sim.service_mut(0).destroy_tunnel(sender, tid).unwrap();
    sim.run_for(Duration::from_secs(1));
    let polls = sim.service(0).metrics().polls();
    let retransmissions = sim.service(0).metrics().retransmissions();

    assert!(sim.service(0).tunnel(tid).is_none());
    assert!(sim.service(1).tunnel_ids().is_empty());
    assert!(was_destroyed(&sim, 1, listener));
    assert_eq!(sim.service(0).metrics().dropped("tunnel_destroyed"), 3);

    // Nothing of the tunnel keeps running afterwards
    sim.run_for(Duration::from_secs(3600));
    assert_eq!(sim.service(0).metrics().polls(), polls);
    assert_eq!(sim.service(0).metrics().retransmissions(), retransmissions);
}

#[test_log::test]
fn test_endpoints_hold_through_relay_traffic_and_repair() {
    let mut sim = line(3, MeshConfig::default());
    sim.script_lookup(0, 2, &[1]);
    let sender = sim.connect_client(0, &[], false).unwrap();
    let listener = sim.connect_client(2, &[PORT], true).unwrap();
    let tid = sim.create_tunnel(0, sender, 2, PORT, reliable()).unwrap();
    assert_endpoints(&sim);

    sim.run_for(Duration::from_secs(1));
    for payload in payloads(10) {
        send_admitted(&mut sim, 0, sender, tid, payload);
    }
    sim.run_for(Duration::from_secs(2));
    assert_endpoints(&sim);
    assert_eq!(sim.delivered(2, listener), payloads(10));

    sim.unlink(1, 2);
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Searching));
    assert_endpoints(&sim);

    sim.link(0, 2, LATENCY);
    sim.run_for(Duration::from_secs(1));
    assert_eq!(tunnel_state(&sim, 0, tid), Some(TunnelState::Ready));
    send_admitted(&mut sim, 0, sender, tid, b"after repair".to_vec());
    sim.run_for(Duration::from_secs(2));
    assert_endpoints(&sim);
    assert_eq!(sim.delivered(2, listener).last(), Some(&b"after repair".to_vec()));
}

#[test_log::test]
fn test_hops_never_send_beyond_the_admission_they_heard() {
    let config = narrow_window();
    let window = config.queue_max();
    let mut sim = line(3, config);
    sim.script_lookup(0, 2, &[1]);

    // Admission each receiving hop advertised, keyed by (sender, receiver, tunnel)
    let mut admissions: HashMap<(usize, usize, WireTunnelId), u32> = HashMap::new();
    let violations = Rc::new(RefCell::new(Vec::new()));
    let payload_frames = Rc::new(RefCell::new(0usize));
    let (seen, frames) = (Rc::clone(&violations), Rc::clone(&payload_frames));
    sim.add_drop_rule(Box::new(move |from, to, message| {
        if let WireMessage::Ack { tunnel, admission } = message {
            admissions.insert((to, from, *tunnel), *admission);
        } else if let Some(data) = message.data() {
            *frames.borrow_mut() += 1;
            let admitted = admissions.get(&(from, to, data.tunnel)).copied().unwrap_or(window - 1);
            if is_pid_bigger(data.pid, admitted) {
                seen.borrow_mut().push((from, to, data.pid, admitted));
            }
        }
        false
    }));

    let sender = sim.connect_client(0, &[], false).unwrap();
    let plain = sim.connect_client(2, &[PORT], true).unwrap();
    let careful = sim.connect_client(2, &[PORT + 1], true).unwrap();
    let unreliable = sim.create_tunnel(0, sender, 2, PORT, TunnelOptions::default()).unwrap();
    sim.run_for(Duration::from_secs(1));
    let reliable_tid = sim.create_tunnel(0, sender, 2, PORT + 1, reliable()).unwrap();
    sim.run_for(Duration::from_secs(1));

    for payload in payloads(20) {
        send_admitted(&mut sim, 0, sender, unreliable, payload.clone());
        send_admitted(&mut sim, 0, sender, reliable_tid, payload);
    }
    sim.run_for(Duration::from_secs(10));

    assert_eq!(sim.delivered(2, plain), payloads(20));
    assert_eq!(sim.delivered(2, careful), payloads(20));
    assert!(*payload_frames.borrow() >= 80);
    assert!(violations.borrow().is_empty(), "sent past admission: {:?}", violations.borrow());
}

#[test_log::test]
fn test_garbage_from_neighbor_is_dropped() {
    let mut sim = line(2, MeshConfig::default());
    let neighbor = sim.identity(1);
    sim.service_mut(0).handle_message(&neighbor, b"not a mesh message");
    assert_eq!(sim.service(0).metrics().dropped("malformed"), 1);

    let stranger = PeerIdentity::from_seed(500);
    let keepalive = WireMessage::Keepalive {
        tunnel: icn_mesh_core::WireTunnelId { owner: stranger, number: 0 },
    };
    let bytes = keepalive.to_bytes().unwrap();
    sim.service_mut(0).handle_message(&stranger, &bytes);
    assert_eq!(sim.service(0).metrics().dropped("unknown_neighbor"), 1);

    // Known neighbor, unknown tunnel
    sim.service_mut(0).handle_message(&neighbor, &bytes);
    assert_eq!(sim.service(0).metrics().dropped("protocol"), 1);
}

/// Network layer that refuses to register anyone
struct RefusingSubstrate;

impl Scheduler for RefusingSubstrate {
    fn attach(&mut self, local: &PeerIdentity) -> MeshResult<()> {
        Err(MeshError::Substrate(format!("cannot register {}", local)))
    }

    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn schedule(&mut self, _delay: Duration, _event: TimerEvent) -> TaskId {
        TaskId(0)
    }

    fn cancel(&mut self, _task: TaskId) {}

    fn request_write(&mut self, _neighbor: &PeerIdentity, _min_size: usize) -> MeshResult<WriteToken> {
        Ok(WriteToken(0))
    }

    fn cancel_write(&mut self, _token: WriteToken) {}
}

impl Discovery for RefusingSubstrate {
    fn start_lookup(&mut self, _peer: &PeerIdentity, _replication: u32) -> LookupHandle {
        LookupHandle(0)
    }

    fn stop_lookup(&mut self, _handle: LookupHandle) {}

    fn announce(&mut self, _local: &PeerIdentity, _replication: u32) {}
}

#[test_log::test]
fn test_start_fails_without_network_layer() {
    let result = MeshService::start(
        MeshConfig::default(),
        PeerIdentity::from_seed(1),
        RefusingSubstrate,
        RefusingSubstrate,
    );
    assert!(matches!(result, Err(MeshError::Substrate(_))));
}

#[test_log::test]
fn test_start_rejects_invalid_config() {
    let mut sim = Sim::new(3);
    let result = sim.add_node(MeshConfig { max_tunnels: 0, ..MeshConfig::default() });
    assert!(matches!(result, Err(MeshError::Config(_))));
    assert!(sim.is_empty());
    assert_eq!(sim.announcements(), 0);

    sim.add_node(MeshConfig::default()).unwrap();
    assert_eq!(sim.announcements(), 1);
}
