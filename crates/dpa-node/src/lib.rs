//! Diameter peer agent node: TCP transport, listener and peer table.

pub mod connection;
pub mod connector;
pub mod listener;
pub mod metrics;
pub mod node;

pub use connection::TcpConnection;
pub use connector::TcpClient;
pub use listener::TcpServer;
pub use node::LocalNode;
