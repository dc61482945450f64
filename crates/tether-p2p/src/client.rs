//! client - the client's link to one host

use tether_core::PeerId;

use crate::transport::{await_read, CentralBearer, Channel, ReadAssembler, ReadError, TransportError};

pub struct ClientLink {
    bearer: Box<dyn CentralBearer>,
    host: Option<PeerId>,
    connected: bool,
    scanning: bool,
}

impl ClientLink {
    pub fn new(bearer: Box<dyn CentralBearer>) -> Self {
        Self {
            bearer,
            host: None,
            connected: false,
            scanning: false,
        }
    }

    pub fn start_scan(&mut self) -> Result<(), TransportError> {
        self.bearer.start_scan()?;
        self.scanning = true;
        tracing::info!("scanning for sessions");
        Ok(())
    }

    pub fn stop_scan(&mut self) {
        if self.scanning {
            self.bearer.stop_scan();
            self.scanning = false;
        }
    }

    pub fn connect(&mut self, host: &PeerId) -> Result<(), TransportError> {
        self.disconnect();
        self.host = Some(host.clone());
        if let Err(e) = self.bearer.connect(host) {
            self.host = None;
            return Err(e);
        }
        Ok(())
    }

    pub fn on_connected(&mut self, peer: &PeerId) {
        if self.host.as_ref() == Some(peer) {
            self.connected = true;
        }
    }

    /// Subscribe to every channel of the connected host.
    pub fn subscribe_all(&mut self) -> Result<(), TransportError> {
        let host = self.connected_host()?;
        for channel in Channel::ALL {
            self.bearer.subscribe(&host, channel)?;
        }
        Ok(())
    }

    pub fn write_control(&mut self, value: &[u8]) -> Result<(), TransportError> {
        let host = self.connected_host()?;
        self.bearer.write(&host, Channel::Control, value)
    }

    /// Pull the full current value of `channel` with offset reads.
    pub async fn pull(&mut self, channel: Channel, max_transfer_size: usize) -> Result<Vec<u8>, ReadError> {
        let host = self.connected_host()?;
        let mut assembler = ReadAssembler::new(max_transfer_size);
        while !assembler.is_done() {
            let response = self.bearer.read(&host, channel, assembler.offset())?;
            let chunk = await_read(response).await?;
            assembler.push(&chunk);
        }
        Ok(assembler.into_bytes())
    }

    /// single offset read, exposed for diagnostics
    pub async fn read_at(&mut self, channel: Channel, offset: usize) -> Result<Vec<u8>, ReadError> {
        let host = self.connected_host()?;
        let response = self.bearer.read(&host, channel, offset)?;
        await_read(response).await
    }

    /// The bearer reported a disconnect. Returns `true` if it was our host.
    pub fn on_disconnected(&mut self, peer: &PeerId) -> bool {
        if self.host.as_ref() == Some(peer) {
            self.host = None;
            self.connected = false;
            return true;
        }
        false
    }

    pub fn disconnect(&mut self) {
        if let Some(host) = self.host.take() {
            tracing::info!(%host, "disconnecting");
            self.bearer.disconnect(&host);
        }
        self.connected = false;
    }

    pub fn host(&self) -> Option<&PeerId> {
        self.host.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn connected_host(&self) -> Result<PeerId, TransportError> {
        match (&self.host, self.connected) {
            (Some(host), true) => Ok(host.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostChannels;
    use crate::loopback::Air;
    use crate::transport::TransportEvent;

    #[tokio::test]
    async fn test_pull_reassembles_value() {
        let air = Air::new();
        let host_id = PeerId::from("host");
        let (peripheral, _, mut host_rx) = air.device("host");
        let (_, central, mut client_rx) = air.device("client");

        let mut host = HostChannels::new(Box::new(peripheral), 16);
        let value: Vec<u8> = (0..50).collect();
        host.publish(Channel::SessionState, value.clone()).unwrap();

        // answer read requests the way the coordinator does
        tokio::spawn(async move {
            while let Some(event) = host_rx.recv().await {
                if let TransportEvent::ReadRequest { channel, offset, respond, .. } = event {
                    let _ = respond.send(host.read(channel, offset));
                }
            }
        });

        let mut link = ClientLink::new(Box::new(central));
        link.connect(&host_id).unwrap();
        if let Some(TransportEvent::Connected { peer }) = client_rx.recv().await {
            link.on_connected(&peer);
        }
        assert!(link.is_connected());

        assert_eq!(link.pull(Channel::SessionState, 16).await.unwrap(), value);
        assert_eq!(
            link.read_at(Channel::SessionState, 51).await,
            Err(ReadError::InvalidOffset { offset: 51, len: 50 })
        );
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let air = Air::new();
        let (_, central, _rx) = air.device("client");
        let mut link = ClientLink::new(Box::new(central));
        assert_eq!(link.write_control(b"x"), Err(TransportError::NotConnected));
    }
}
