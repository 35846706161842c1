use crate::connection::connection::{Connection, ConnectionCloser, ConnectionError, Connector, Listener};
use crate::wire::RaftMessage;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on a single frame. AppendEntries batches are capped far below this, so anything
/// larger is a corrupt length prefix.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const URL_SCHEME: &str = "tcp://";

/// Connects to `tcp://host:port` urls. Frames are a big-endian u32 length prefix followed by an
/// encoded envelope.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &str, _certificate: Option<&Bytes>) -> Result<Box<dyn Connection>, ConnectionError> {
        // TLS is terminated outside of this crate, the certificate is only carried along.
        let addr = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| ConnectionError::InvalidUrl(url.to_string()))?;
        let stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectionError::Refused(url.to_string()),
            _ => ConnectionError::Io(e),
        })?;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpConnection::new(stream)))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    closer: ConnectionCloser,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        TcpConnection {
            stream,
            closer: ConnectionCloser::new(),
        }
    }

    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ConnectionError::FrameTooLarge(frame.len(), MAX_FRAME_BYTES));
        }
        let length_prefix = (frame.len() as u32).to_be_bytes();
        self.stream.write_all(&length_prefix).await?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let length = match self.stream.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ConnectionError::PeerDisconnected),
            Err(e) => return Err(e.into()),
        };
        if length > MAX_FRAME_BYTES {
            return Err(ConnectionError::FrameTooLarge(length, MAX_FRAME_BYTES));
        }
        let mut buffer = vec![0u8; length];
        self.stream.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: RaftMessage) -> Result<(), ConnectionError> {
        if self.closer.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let closer = self.closer.clone();
        tokio::select! {
            biased;
            _ = closer.closed() => Err(ConnectionError::Closed),
            result = self.write_frame(message.encode_frame()) => result,
        }
    }

    async fn read_message(&mut self) -> Result<RaftMessage, ConnectionError> {
        if self.closer.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let closer = self.closer.clone();
        let frame = tokio::select! {
            biased;
            _ = closer.closed() => return Err(ConnectionError::Closed),
            frame = self.read_frame() => frame?,
        };
        Ok(RaftMessage::decode_frame(&frame)?)
    }

    fn closer(&self) -> ConnectionCloser {
        self.closer.clone()
    }
}

pub struct TcpConnectionListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpConnectionListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(TcpConnectionListener { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl Listener for TcpConnectionListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, ConnectionError> {
        let (stream, _peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::new(stream)))
    }

    fn url(&self) -> String {
        format!("{}{}", URL_SCHEME, self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connection::ConnectionExt;
    use crate::wire::{ProtoAppendEntries, ProtoHello, ProtoLogEntry};
    use std::time::Duration;

    #[tokio::test]
    async fn frames_survive_the_socket() {
        // -- setup --
        let mut listener = TcpConnectionListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let url = listener.url();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let hello = conn.read::<ProtoHello>().await.unwrap();
            let append = conn.read::<ProtoAppendEntries>().await.unwrap();
            (hello, append)
        });

        // -- execute --
        let mut client = TcpConnector.connect(&url, None).await.unwrap();
        client
            .send(
                ProtoHello {
                    leader_tag: "A".into(),
                    election_timeout_ms: 300,
                    ..Default::default()
                }
                .into(),
            )
            .await
            .unwrap();
        client
            .send(
                ProtoAppendEntries {
                    term: 3,
                    entries: vec![ProtoLogEntry {
                        index: 1,
                        term: 3,
                        data: vec![7u8; 100_000],
                        flags: 0,
                    }],
                    ..Default::default()
                }
                .into(),
            )
            .await
            .unwrap();

        // -- verify --
        let (hello, append) = server.await.unwrap();
        assert_eq!("A", hello.leader_tag);
        assert_eq!(300, hello.election_timeout_ms);
        assert_eq!(100_000, append.entries[0].data.len());
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        // -- setup --
        let mut listener = TcpConnectionListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let url = listener.url();
        let _server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(conn);
        });
        let mut client = TcpConnector.connect(&url, None).await.unwrap();
        let closer = client.closer();

        // -- execute --
        let reader = tokio::spawn(async move { client.read_message().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        closer.close();

        // -- verify --
        let result = tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn rejects_urls_without_scheme() {
        let result = TcpConnector.connect("127.0.0.1:1", None).await;

        assert!(matches!(result, Err(ConnectionError::InvalidUrl(_))));
    }
}
