//! loopback - an in-memory bearer shared by every device in one process
//!
//! `Air` plays the radio: advertisements reach scanning devices, writes and
//! notifications are delivered straight into the receiving device's event
//! queue. tests use its knobs to fake congestion, fading links and dead
//! peers.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use tether_core::PeerId;

use crate::transport::{CentralBearer, Channel, PeripheralBearer, ReadResponse, TransportError, TransportEvent};

const DEFAULT_SIGNAL_STRENGTH: i16 = -55;

#[derive(Default)]
struct Device {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    advertising: Option<String>,
    scanning: bool,
    /// peripheral side: who listens to what
    subscribers: HashMap<Channel, BTreeSet<PeerId>>,
    /// central side: the host this device is connected to
    connected_to: Option<PeerId>,
    congested: bool,
    /// notifications from this device vanish
    silenced: bool,
    /// connection attempts to this device never complete
    unreachable: bool,
    signal_strength: i16,
}

impl Device {
    fn send(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            // receiver gone means the device shut down
            let _ = events.send(event);
        }
    }
}

#[derive(Default)]
struct AirState {
    devices: HashMap<PeerId, Device>,
}

impl AirState {
    fn device(&mut self, peer: &PeerId) -> &mut Device {
        self.devices.entry(peer.clone()).or_insert_with(|| Device {
            signal_strength: DEFAULT_SIGNAL_STRENGTH,
            ..Default::default()
        })
    }

    fn send(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(device) = self.devices.get(peer) {
            device.send(event);
        }
    }

    /// drop the link between a central and its host, telling both sides
    fn sever(&mut self, central: &PeerId, host: &PeerId) {
        let linked = self.devices.get(central).and_then(|d| d.connected_to.as_ref()) == Some(host);
        if !linked {
            return;
        }
        self.device(central).connected_to = None;
        for subs in self.device(host).subscribers.values_mut() {
            subs.remove(central);
        }
        self.send(central, TransportEvent::Disconnected { peer: host.clone() });
        self.send(host, TransportEvent::Disconnected { peer: central.clone() });
    }
}

/// the shared medium
#[derive(Clone, Default)]
pub struct Air {
    state: Arc<Mutex<AirState>>,
}

impl Air {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a device on the air. Both halves share one event queue.
    pub fn device(&self, peer: impl Into<PeerId>) -> (LoopbackPeripheral, LoopbackCentral, mpsc::UnboundedReceiver<TransportEvent>) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().device(&peer).events = Some(tx);
        (
            LoopbackPeripheral {
                air: self.clone(),
                me: peer.clone(),
            },
            LoopbackCentral {
                air: self.clone(),
                me: peer,
            },
            rx,
        )
    }

    /// Make `peer` refuse updates until cleared; clearing signals readiness.
    pub fn set_congested(&self, peer: &PeerId, congested: bool) {
        let mut state = self.state.lock();
        let device = state.device(peer);
        let was = device.congested;
        device.congested = congested;
        if was && !congested {
            device.send(TransportEvent::ReadyToUpdate);
        }
    }

    /// Drop every notification `peer` sends without reporting a disconnect.
    pub fn set_silenced(&self, peer: &PeerId, silenced: bool) {
        self.state.lock().device(peer).silenced = silenced;
    }

    /// Connection attempts to `peer` hang forever.
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        self.state.lock().device(peer).unreachable = unreachable;
    }

    pub fn set_signal_strength(&self, peer: &PeerId, rssi: i16) {
        self.state.lock().device(peer).signal_strength = rssi;
    }

    /// Break the link between `central` and `host` as if out of range.
    pub fn sever(&self, central: &PeerId, host: &PeerId) {
        self.state.lock().sever(central, host);
    }

    pub fn subscriber_count(&self, host: &PeerId, channel: Channel) -> usize {
        self.state
            .lock()
            .devices
            .get(host)
            .and_then(|d| d.subscribers.get(&channel))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

pub struct LoopbackPeripheral {
    air: Air,
    me: PeerId,
}

impl PeripheralBearer for LoopbackPeripheral {
    fn start_advertising(&mut self, local_name: &str) -> Result<(), TransportError> {
        let mut state = self.air.state.lock();
        let rssi = state.device(&self.me).signal_strength;
        state.device(&self.me).advertising = Some(local_name.to_string());
        for (peer, device) in state.devices.iter() {
            if device.scanning && peer != &self.me {
                device.send(TransportEvent::Discovered {
                    peer: self.me.clone(),
                    local_name: local_name.to_string(),
                    signal_strength: rssi,
                });
            }
        }
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.air.state.lock().device(&self.me).advertising = None;
    }

    fn update_value(&mut self, channel: Channel, value: &[u8], to: Option<&PeerId>) -> Result<bool, TransportError> {
        let mut state = self.air.state.lock();
        let me = state.device(&self.me);
        if me.congested {
            return Ok(false);
        }
        if me.silenced {
            return Ok(true);
        }

        let targets: Vec<PeerId> = me
            .subscribers
            .get(&channel)
            .map(|subs| subs.iter().filter(|p| to.map_or(true, |t| t == *p)).cloned().collect())
            .unwrap_or_default();
        for peer in targets {
            state.send(
                &peer,
                TransportEvent::Notified {
                    peer: self.me.clone(),
                    channel,
                    value: value.to_vec(),
                },
            );
        }
        Ok(true)
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.air.state.lock().sever(peer, &self.me);
    }
}

pub struct LoopbackCentral {
    air: Air,
    me: PeerId,
}

impl LoopbackCentral {
    fn linked_host(&self, peer: &PeerId) -> Result<(), TransportError> {
        let state = self.air.state.lock();
        match state.devices.get(&self.me).and_then(|d| d.connected_to.as_ref()) {
            Some(host) if host == peer => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl CentralBearer for LoopbackCentral {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        let mut state = self.air.state.lock();
        state.device(&self.me).scanning = true;
        for (peer, device) in state.devices.iter() {
            if peer == &self.me {
                continue;
            }
            if let Some(name) = &device.advertising {
                state.send(
                    &self.me,
                    TransportEvent::Discovered {
                        peer: peer.clone(),
                        local_name: name.clone(),
                        signal_strength: device.signal_strength,
                    },
                );
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.air.state.lock().device(&self.me).scanning = false;
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        let mut state = self.air.state.lock();
        let host = state.devices.get(peer).ok_or_else(|| TransportError::PeerNotFound(peer.clone()))?;
        if host.unreachable {
            return Ok(());
        }
        state.device(&self.me).connected_to = Some(peer.clone());
        state.send(&self.me, TransportEvent::Connected { peer: peer.clone() });
        Ok(())
    }

    fn subscribe(&mut self, peer: &PeerId, channel: Channel) -> Result<(), TransportError> {
        self.linked_host(peer)?;
        let mut state = self.air.state.lock();
        let added = state.device(peer).subscribers.entry(channel).or_default().insert(self.me.clone());
        if added {
            state.send(
                peer,
                TransportEvent::Subscribed {
                    peer: self.me.clone(),
                    channel,
                },
            );
        }
        Ok(())
    }

    fn write(&mut self, peer: &PeerId, channel: Channel, value: &[u8]) -> Result<(), TransportError> {
        self.linked_host(peer)?;
        self.air.state.lock().send(
            peer,
            TransportEvent::Written {
                peer: self.me.clone(),
                channel,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    fn read(
        &mut self,
        peer: &PeerId,
        channel: Channel,
        offset: usize,
    ) -> Result<oneshot::Receiver<ReadResponse>, TransportError> {
        self.linked_host(peer)?;
        let (respond, response) = oneshot::channel();
        self.air.state.lock().send(
            peer,
            TransportEvent::ReadRequest {
                peer: self.me.clone(),
                channel,
                offset,
                respond,
            },
        );
        Ok(response)
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.air.state.lock().sever(&self.me, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_sees_advertisers() {
        let air = Air::new();
        let (mut host, _, _host_rx) = air.device("host");
        let (_, mut client, mut client_rx) = air.device("client");

        host.start_advertising("Emma|15|20|1").unwrap();
        client.start_scan().unwrap();

        match client_rx.recv().await {
            Some(TransportEvent::Discovered { peer, local_name, .. }) => {
                assert_eq!(peer, PeerId::from("host"));
                assert_eq!(local_name, "Emma|15|20|1");
            }
            other => panic!("unexpected {:?}", other),
        }

        // refreshed name reaches an already scanning client
        host.start_advertising("Emma|15|20|2").unwrap();
        assert!(matches!(
            client_rx.recv().await,
            Some(TransportEvent::Discovered { local_name, .. }) if local_name.ends_with("|2")
        ));
    }

    #[tokio::test]
    async fn test_subscribe_write_notify() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let (mut host, _, mut host_rx) = air.device("host");
        let (_, mut client, mut client_rx) = air.device("client");

        client.connect(&host_id).unwrap();
        assert!(matches!(client_rx.recv().await, Some(TransportEvent::Connected { .. })));

        client.subscribe(&host_id, Channel::Control).unwrap();
        assert!(matches!(
            host_rx.recv().await,
            Some(TransportEvent::Subscribed { channel: Channel::Control, .. })
        ));
        assert_eq!(air.subscriber_count(&host_id, Channel::Control), 1);

        client.write(&host_id, Channel::Control, b"hi").unwrap();
        assert!(matches!(
            host_rx.recv().await,
            Some(TransportEvent::Written { value, .. }) if value == b"hi"
        ));

        assert!(host.update_value(Channel::Control, b"yo", None).unwrap());
        assert!(matches!(
            client_rx.recv().await,
            Some(TransportEvent::Notified { value, .. }) if value == b"yo"
        ));
    }

    #[tokio::test]
    async fn test_congestion_and_ready() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let (mut host, _, mut host_rx) = air.device("host");

        air.set_congested(&host_id, true);
        assert!(!host.update_value(Channel::Heartbeat, b"x", None).unwrap());
        air.set_congested(&host_id, false);
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::ReadyToUpdate)));
    }

    #[tokio::test]
    async fn test_sever_notifies_both() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let client_id = PeerId::from("client");
        let (_host, _, mut host_rx) = air.device("host");
        let (_, mut client, mut client_rx) = air.device("client");

        client.connect(&host_id).unwrap();
        client_rx.recv().await;
        air.sever(&client_id, &host_id);

        assert!(matches!(client_rx.recv().await, Some(TransportEvent::Disconnected { peer }) if peer == host_id));
        assert!(matches!(host_rx.recv().await, Some(TransportEvent::Disconnected { peer }) if peer == client_id));
        assert_eq!(client.write(&host_id, Channel::Control, b"late"), Err(TransportError::NotConnected));
    }
}
