use crate::connection::connection::{Connection, ConnectionCloser, ConnectionError, Connector, Listener};
use crate::wire::RaftMessage;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An in-process network. Listeners register under a url, connectors dial that url, and every
/// message still goes through the frame encoding, exactly like on a socket.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, mpsc::UnboundedSender<MemoryConnection>>,
    // One token per live connection pair, cancelled to simulate a network failure.
    links: HashMap<String, Vec<CancellationToken>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().expect("MemoryNetwork mutex guard poison")
    }

    pub fn listen(&self, url: impl Into<String>) -> Result<MemoryListener, ConnectionError> {
        let url = url.into();
        let mut state = self.lock();
        if let Some(existing) = state.listeners.get(&url) {
            if !existing.is_closed() {
                return Err(ConnectionError::InvalidUrl(format!("{} already has a listener", url)));
            }
        }
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        state.listeners.insert(url.clone(), incoming_tx);

        Ok(MemoryListener {
            url,
            incoming_rx,
            network: self.clone(),
        })
    }

    /// Break every live connection to `url`. Both ends observe `PeerDisconnected`.
    pub fn sever(&self, url: &str) {
        if let Some(links) = self.lock().links.remove(url) {
            for link in links {
                link.cancel();
            }
        }
    }

    fn unregister(&self, url: &str) {
        let mut state = self.lock();
        let closed = state.listeners.get(url).map(|tx| tx.is_closed()).unwrap_or(false);
        if closed {
            state.listeners.remove(url);
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, url: &str, _certificate: Option<&Bytes>) -> Result<Box<dyn Connection>, ConnectionError> {
        let (client_to_server_tx, client_to_server_rx) = mpsc::unbounded_channel();
        let (server_to_client_tx, server_to_client_rx) = mpsc::unbounded_channel();
        let link = CancellationToken::new();

        let client = MemoryConnection {
            tx: client_to_server_tx,
            rx: server_to_client_rx,
            link: link.clone(),
            closer: ConnectionCloser::new(),
        };
        let server = MemoryConnection {
            tx: server_to_client_tx,
            rx: client_to_server_rx,
            link: link.clone(),
            closer: ConnectionCloser::new(),
        };

        let mut state = self.lock();
        let listener = state
            .listeners
            .get(url)
            .ok_or_else(|| ConnectionError::Refused(url.to_string()))?;
        listener
            .send(server)
            .map_err(|_| ConnectionError::Refused(url.to_string()))?;

        let links = state.links.entry(url.to_string()).or_insert_with(Vec::new);
        links.retain(|l| !l.is_cancelled());
        links.push(link);

        Ok(Box::new(client))
    }
}

pub struct MemoryListener {
    url: String,
    incoming_rx: mpsc::UnboundedReceiver<MemoryConnection>,
    network: MemoryNetwork,
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, ConnectionError> {
        match self.incoming_rx.recv().await {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(ConnectionError::Closed),
        }
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.incoming_rx.close();
        self.network.unregister(&self.url);
    }
}

pub struct MemoryConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: CancellationToken,
    closer: ConnectionCloser,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, message: RaftMessage) -> Result<(), ConnectionError> {
        if self.closer.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.link.is_cancelled() {
            return Err(ConnectionError::PeerDisconnected);
        }
        self.tx
            .send(message.encode_frame())
            .map_err(|_| ConnectionError::PeerDisconnected)
    }

    async fn read_message(&mut self) -> Result<RaftMessage, ConnectionError> {
        let closer = self.closer.clone();
        let link = self.link.clone();
        let frame = tokio::select! {
            biased;
            _ = closer.closed() => return Err(ConnectionError::Closed),
            _ = link.cancelled() => return Err(ConnectionError::PeerDisconnected),
            frame = self.rx.recv() => frame.ok_or(ConnectionError::PeerDisconnected)?,
        };
        Ok(RaftMessage::decode_frame(&frame)?)
    }

    fn closer(&self) -> ConnectionCloser {
        self.closer.clone()
    }
}
