//! Routing rules for inbound events
//!
//! The router holds no state of its own. Each call looks at one event from
//! one sender and decides who, if anyone, hears about it.

use tracing::{debug, warn};

use beacon_core::crypto::is_valid_peer_id;

use crate::messages::{Identify, InboundEvent, RelayEnvelope, ServerMessage};
use crate::registry::{RelayAddr, Registry};

/// Apply one inbound event from `sender`
pub fn route(registry: &Registry, sender: &str, event: InboundEvent) {
    match event {
        InboundEvent::Heartbeat => {
            registry.touch(sender);
        }
        InboundEvent::Identify(identify) => identify_peer(registry, sender, identify),
        InboundEvent::Relay(envelope) => relay(registry, sender, envelope),
        InboundEvent::Unknown(kind) => {
            debug!("Ignoring unsupported event {} from {}", kind, sender);
        }
    }
}

fn identify_peer(registry: &Registry, sender: &str, identify: Identify) {
    let Identify {
        alias,
        relay_host,
        relay_port,
    } = identify;

    if !registry.set_alias(sender, alias.clone()) {
        debug!("Identify from departed peer {}", sender);
        return;
    }

    if let Some(port) = relay_port {
        // Default to the address the connection came from
        let host = relay_host.or_else(|| registry.get(sender).map(|p| p.origin.ip().to_string()));
        if let Some(host) = host {
            registry.set_relay_addr(sender, RelayAddr { host, port });
        }
    }

    debug!("Peer {} identified as {}", sender, alias);

    send(
        registry,
        sender,
        &ServerMessage::PeerList {
            peers: registry.identified(),
        },
    );
    broadcast(
        registry,
        &ServerMessage::PeerJoined {
            peer_id: sender.to_owned(),
            alias,
        },
        Some(sender),
    );
}

fn relay(registry: &Registry, sender: &str, envelope: RelayEnvelope) {
    let to = envelope.to.clone();
    let kind = envelope.kind;

    if !is_valid_peer_id(&to) || !registry.contains(&to) {
        debug!("Dropping {} from {}: {} is not connected", kind.as_tag(), sender, to);
        return;
    }

    match envelope.forwarded_json(sender) {
        Ok(json) => {
            if registry.send_to(&to, json) {
                debug!("Relayed {} from {} to {}", kind.as_tag(), sender, to);
            }
        }
        Err(e) => warn!("Failed to encode relay payload from {}: {}", sender, e),
    }
}

/// Serialize and queue a message for one peer
pub fn send(registry: &Registry, peer_id: &str, msg: &ServerMessage) -> bool {
    match msg.to_json() {
        Ok(json) => registry.send_to(peer_id, json),
        Err(e) => {
            warn!("Failed to encode message for {}: {}", peer_id, e);
            false
        }
    }
}

/// Serialize once and queue for every peer except `except`
pub fn broadcast(registry: &Registry, msg: &ServerMessage, except: Option<&str>) -> usize {
    match msg.to_json() {
        Ok(json) => registry.broadcast(&json, except),
        Err(e) => {
            warn!("Failed to encode broadcast: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerHandle, PeerMailbox};
    use serde_json::Value;
    use std::time::{Duration, Instant};

    fn add(registry: &Registry) -> (String, PeerMailbox) {
        let (handle, mailbox) = PeerHandle::channel(16);
        let id = registry
            .register(handle, "192.168.1.20:40000".parse().unwrap(), None)
            .unwrap();
        (id, mailbox)
    }

    fn recv(mailbox: &mut PeerMailbox) -> Value {
        let text = mailbox.rx.try_recv().expect("expected a message");
        serde_json::from_str(&text).unwrap()
    }

    fn event(json: &str) -> InboundEvent {
        InboundEvent::parse(json).unwrap()
    }

    #[test]
    fn test_heartbeat_touches_without_reply() {
        let registry = Registry::new();
        let (a, mut mb_a) = add(&registry);
        let past = Instant::now() - Duration::from_secs(30);
        registry.touch_at(&a, past);

        route(&registry, &a, event(r#"{"type":"HEARTBEAT"}"#));

        assert!(registry.get(&a).unwrap().last_seen > past);
        assert!(mb_a.rx.try_recv().is_err());
    }

    #[test]
    fn test_identify_replies_and_broadcasts() {
        let registry = Registry::new();
        let (_a, mut mb_a) = add(&registry);
        let (b, mut mb_b) = add(&registry);

        route(&registry, &b, event(r#"{"type":"IDENTIFY","alias":"bob"}"#));

        let list = recv(&mut mb_b);
        assert_eq!(list["type"], "PEER_LIST");
        let peers = list["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["peerId"], b.as_str());
        assert_eq!(peers[0]["alias"], "bob");

        let joined = recv(&mut mb_a);
        assert_eq!(joined["type"], "PEER_JOINED");
        assert_eq!(joined["peerId"], b.as_str());
        assert_eq!(joined["alias"], "bob");

        // Sender does not hear its own join
        assert!(mb_b.rx.try_recv().is_err());
    }

    #[test]
    fn test_identify_twice_rebroadcasts() {
        let registry = Registry::new();
        let (_a, mut mb_a) = add(&registry);
        let (b, _mb_b) = add(&registry);

        route(&registry, &b, event(r#"{"type":"IDENTIFY","alias":"bob"}"#));
        route(&registry, &b, event(r#"{"type":"IDENTIFY","alias":"robert"}"#));

        assert_eq!(recv(&mut mb_a)["alias"], "bob");
        assert_eq!(recv(&mut mb_a)["alias"], "robert");
        assert_eq!(registry.get(&b).unwrap().alias.as_deref(), Some("robert"));
    }

    #[test]
    fn test_identify_sets_relay_address() {
        let registry = Registry::new();
        let (a, _mb) = add(&registry);

        route(
            &registry,
            &a,
            event(r#"{"type":"IDENTIFY","alias":"alice","relayPort":4433}"#),
        );
        let addr = registry.get(&a).unwrap().relay_addr.unwrap();
        assert_eq!(addr.host, "192.168.1.20");
        assert_eq!(addr.port, 4433);

        route(
            &registry,
            &a,
            event(r#"{"type":"IDENTIFY","alias":"alice","relayHost":"relay.example","relayPort":9000}"#),
        );
        let addr = registry.get(&a).unwrap().relay_addr.unwrap();
        assert_eq!(addr.host, "relay.example");
        assert_eq!(addr.port, 9000);
    }

    #[test]
    fn test_relay_forwards_with_from() {
        let registry = Registry::new();
        let (a, mut mb_a) = add(&registry);
        let (b, mut mb_b) = add(&registry);

        let json = format!(
            r#"{{"type":"WEBRTC_OFFER","to":"{}","sdp":"v=0","from":"spoofed"}}"#,
            b
        );
        route(&registry, &a, event(&json));

        let offer = recv(&mut mb_b);
        assert_eq!(offer["type"], "WEBRTC_OFFER");
        assert_eq!(offer["to"], b.as_str());
        assert_eq!(offer["from"], a.as_str());
        assert_eq!(offer["sdp"], "v=0");
        assert!(mb_a.rx.try_recv().is_err());
    }

    #[test]
    fn test_relay_to_missing_peer_dropped() {
        let registry = Registry::new();
        let (a, mut mb_a) = add(&registry);
        let (b, mut mb_b) = add(&registry);
        registry.remove(&b);

        let json = format!(r#"{{"type":"ICE_CANDIDATE","to":"{}","candidate":"c"}}"#, b);
        route(&registry, &a, event(&json));
        route(
            &registry,
            &a,
            event(r#"{"type":"WEBRTC","to":"ffffffffffffffff"}"#),
        );

        assert!(mb_a.rx.try_recv().is_err());
        assert!(mb_b.rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_event_ignored() {
        let registry = Registry::new();
        let (a, mut mb_a) = add(&registry);
        let (_b, mut mb_b) = add(&registry);

        route(&registry, &a, event(r#"{"type":"CHAT","text":"hi"}"#));

        assert!(mb_a.rx.try_recv().is_err());
        assert!(mb_b.rx.try_recv().is_err());
    }
}
