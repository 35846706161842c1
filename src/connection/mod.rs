mod connection;
mod memory;
mod tcp;

pub use connection::Connection;
pub use connection::ConnectionCloser;
pub use connection::ConnectionError;
pub use connection::ConnectionExt;
pub use connection::Connector;
pub use connection::Listener;
pub use memory::MemoryListener;
pub use memory::MemoryNetwork;
pub use tcp::TcpConnectionListener;
pub use tcp::TcpConnector;
