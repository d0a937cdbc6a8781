use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Application callback for received data. In message mode, this is called once per message; in
///  stream mode, with each contiguous piece of the stream as it becomes available.
///
/// NB: This is called outside of the end point's locks, so it is fine to write to the end point
///  from here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataHandler: Send + Sync + 'static {
    async fn on_data(&self, peer_addr: SocketAddr, data: Bytes);
}
