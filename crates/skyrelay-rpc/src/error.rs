use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Socket unreachable, closed by the peer, timed out or already closed.
    #[error("rpc connection error: {0}")]
    Connection(#[from] io::Error),

    /// Error value reported by the peer in the reply envelope.
    #[error("rpc error reported by peer: {0}")]
    Remote(rmpv::Value),

    #[error("malformed rpc payload: {0}")]
    Decode(String),
}

impl RpcError {
    pub(crate) fn closed() -> Self {
        RpcError::Connection(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
    }

    pub(crate) fn not_connected() -> Self {
        RpcError::Connection(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RpcError::Connection(_))
    }
}
