//! host - the host's side of the three channels
//!
//! keeps the latest value of every channel readable, tracks subscribers,
//! and holds back publishes the bearer refused until it reports readiness.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tether_core::PeerId;

use crate::transport::{read_at, Channel, PeripheralBearer, ReadResponse, ReadError, TransportError};

#[derive(Debug)]
struct PendingUpdate {
    channel: Channel,
    value: Vec<u8>,
    to: Option<PeerId>,
}

pub struct HostChannels {
    bearer: Box<dyn PeripheralBearer>,
    values: HashMap<Channel, Vec<u8>>,
    subscribers: HashMap<Channel, BTreeSet<PeerId>>,
    /// refused updates, in publish order
    pending: VecDeque<PendingUpdate>,
    max_transfer_size: usize,
    advertising: bool,
}

impl HostChannels {
    pub fn new(bearer: Box<dyn PeripheralBearer>, max_transfer_size: usize) -> Self {
        Self {
            bearer,
            values: HashMap::new(),
            subscribers: HashMap::new(),
            pending: VecDeque::new(),
            max_transfer_size,
            advertising: false,
        }
    }

    pub fn start_advertising(&mut self, local_name: &str) -> Result<(), TransportError> {
        self.bearer.start_advertising(local_name)?;
        tracing::info!(name = local_name, "advertising");
        self.advertising = true;
        Ok(())
    }

    /// re-publish the advertisement after membership changed
    pub fn refresh_advertisement(&mut self, local_name: &str) -> Result<(), TransportError> {
        if !self.advertising {
            return Ok(());
        }
        tracing::debug!(name = local_name, "refreshing advertisement");
        self.bearer.start_advertising(local_name)
    }

    pub fn stop_advertising(&mut self) {
        if self.advertising {
            self.bearer.stop_advertising();
            self.advertising = false;
            tracing::info!("stopped advertising");
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Publish to every subscriber of `channel`. The value also becomes the
    /// channel's readable value.
    pub fn publish(&mut self, channel: Channel, value: Vec<u8>) -> Result<(), TransportError> {
        self.values.insert(channel, value.clone());
        self.push(channel, value, None)
    }

    /// push to a single subscriber, e.g. the snapshot on subscribe
    pub fn send_to(&mut self, peer: &PeerId, channel: Channel, value: Vec<u8>) -> Result<(), TransportError> {
        self.push(channel, value, Some(peer.clone()))
    }

    fn push(&mut self, channel: Channel, value: Vec<u8>, to: Option<PeerId>) -> Result<(), TransportError> {
        // keep order behind anything already waiting
        if !self.pending.is_empty() {
            self.queue(PendingUpdate { channel, value, to });
            return Ok(());
        }
        if !self.bearer.update_value(channel, &value, to.as_ref())? {
            tracing::debug!(channel = channel.as_str(), "bearer busy, queueing update");
            self.queue(PendingUpdate { channel, value, to });
        }
        Ok(())
    }

    /// A newer value replaces a queued one for the same channel and target,
    /// keeping its place in line.
    fn queue(&mut self, update: PendingUpdate) {
        if update.channel.is_latest_value() {
            let older = self
                .pending
                .iter_mut()
                .find(|u| u.channel == update.channel && u.to == update.to);
            if let Some(older) = older {
                older.value = update.value;
                return;
            }
        }
        self.pending.push_back(update);
    }

    /// The bearer has room again. Returns how many queued updates went out.
    pub fn on_ready(&mut self) -> Result<usize, TransportError> {
        let mut sent = 0;
        while let Some(update) = self.pending.front() {
            if !self.bearer.update_value(update.channel, &update.value, update.to.as_ref())? {
                break;
            }
            self.pending.pop_front();
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(sent, queued = self.pending.len(), "flushed updates");
        }
        Ok(sent)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record a subscription. Returns `true` for a new one.
    pub fn on_subscribed(&mut self, peer: PeerId, channel: Channel) -> bool {
        self.subscribers.entry(channel).or_default().insert(peer)
    }

    pub fn on_unsubscribed(&mut self, peer: &PeerId, channel: Channel) {
        if let Some(subs) = self.subscribers.get_mut(&channel) {
            subs.remove(peer);
        }
    }

    /// forget a peer on every channel and drop updates addressed to it
    pub fn on_disconnected(&mut self, peer: &PeerId) {
        for subs in self.subscribers.values_mut() {
            subs.remove(peer);
        }
        self.pending.retain(|u| u.to.as_ref() != Some(peer));
    }

    pub fn subscribers(&self, channel: Channel) -> usize {
        self.subscribers.get(&channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Answer an offset read of `channel`'s current value.
    pub fn read(&self, channel: Channel, offset: usize) -> ReadResponse {
        let value = self
            .values
            .get(&channel)
            .ok_or(ReadError::NotReadable(channel.as_str()))?;
        read_at(value, offset, self.max_transfer_size)
    }

    pub fn disconnect(&mut self, peer: &PeerId) {
        self.bearer.disconnect(peer);
        self.on_disconnected(peer);
    }

    /// stop advertising and forget all state, ready for the next session
    pub fn reset(&mut self) {
        self.stop_advertising();
        self.values.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::Air;
    use crate::transport::{CentralBearer, TransportEvent};

    #[tokio::test]
    async fn test_backpressure_queues_then_flushes_in_order() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let (peripheral, _, _host_rx) = air.device("host");
        let (_, mut central, mut client_rx) = air.device("client");
        central.connect(&host_id).unwrap();
        central.subscribe(&host_id, Channel::Control).unwrap();
        client_rx.recv().await;

        let mut host = HostChannels::new(Box::new(peripheral), 182);
        air.set_congested(&host_id, true);
        host.publish(Channel::Control, b"one".to_vec()).unwrap();
        host.publish(Channel::Control, b"two".to_vec()).unwrap();
        assert_eq!(host.pending_len(), 2);

        air.set_congested(&host_id, false);
        assert_eq!(host.on_ready().unwrap(), 2);
        assert_eq!(host.pending_len(), 0);

        for expected in [b"one", b"two"] {
            match client_rx.recv().await {
                Some(TransportEvent::Notified { value, .. }) => assert_eq!(value, expected.to_vec()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_behind_queue_stays_queued() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let (peripheral, _, _rx) = air.device("host");
        let mut host = HostChannels::new(Box::new(peripheral), 182);

        air.set_congested(&host_id, true);
        host.publish(Channel::SessionState, b"a".to_vec()).unwrap();
        air.set_congested(&host_id, false);
        // bearer is free but the earlier update has not gone out yet
        host.publish(Channel::Control, b"b".to_vec()).unwrap();
        assert_eq!(host.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_queued_latest_values_coalesce() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let client = PeerId::from("client");
        let (peripheral, _, _host_rx) = air.device("host");
        let (_, mut central, mut client_rx) = air.device("client");
        central.connect(&host_id).unwrap();
        central.subscribe(&host_id, Channel::Heartbeat).unwrap();
        central.subscribe(&host_id, Channel::Control).unwrap();
        client_rx.recv().await;

        let mut host = HostChannels::new(Box::new(peripheral), 182);
        air.set_congested(&host_id, true);
        for seq in 0..50u8 {
            host.publish(Channel::Heartbeat, vec![seq]).unwrap();
        }
        host.publish(Channel::Control, b"end".to_vec()).unwrap();
        host.publish(Channel::Control, b"end".to_vec()).unwrap();
        host.publish(Channel::Heartbeat, vec![50]).unwrap();
        host.send_to(&client, Channel::Heartbeat, vec![99]).unwrap();
        // one broadcast heartbeat, two control, one targeted heartbeat
        assert_eq!(host.pending_len(), 4);

        air.set_congested(&host_id, false);
        assert_eq!(host.on_ready().unwrap(), 4);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            match client_rx.recv().await {
                Some(TransportEvent::Notified { channel, value, .. }) => seen.push((channel, value)),
                Some(_) => {}
                None => panic!("bearer closed"),
            }
        }
        assert_eq!(
            seen,
            vec![
                (Channel::Heartbeat, vec![50]),
                (Channel::Control, b"end".to_vec()),
                (Channel::Control, b"end".to_vec()),
                (Channel::Heartbeat, vec![99]),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_latest_value() {
        let air = Air::new();
        let (peripheral, _, _rx) = air.device("host");
        let mut host = HostChannels::new(Box::new(peripheral), 4);

        assert_eq!(
            host.read(Channel::SessionState, 0),
            Err(ReadError::NotReadable("session-state"))
        );
        host.publish(Channel::SessionState, b"snapshot".to_vec()).unwrap();
        assert_eq!(host.read(Channel::SessionState, 4).unwrap(), b"shot".to_vec());
        assert_eq!(
            host.read(Channel::SessionState, 9),
            Err(ReadError::InvalidOffset { offset: 9, len: 8 })
        );
    }

    #[tokio::test]
    async fn test_subscriber_tracking() {
        let air = Air::new();
        let (peripheral, _, _rx) = air.device("host");
        let mut host = HostChannels::new(Box::new(peripheral), 182);
        let peer = PeerId::from("client");

        assert!(host.on_subscribed(peer.clone(), Channel::Heartbeat));
        assert!(!host.on_subscribed(peer.clone(), Channel::Heartbeat));
        assert_eq!(host.subscribers(Channel::Heartbeat), 1);
        host.on_disconnected(&peer);
        assert_eq!(host.subscribers(Channel::Heartbeat), 0);
    }
}
