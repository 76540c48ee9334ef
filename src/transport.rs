use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::envelope::Envelope;
use crate::error::TransportError;

/// What arrived on the reading half.
#[derive(Debug)]
pub enum Incoming {
    Envelope(Envelope),
    /// A ping or pong: the peer is alive but had nothing to say.
    Heartbeat,
}

/// The reading half of a connection.
#[async_trait]
pub trait Inbound: Send {
    /// Next frame, or `Ok(None)` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// The writing half of a connection.
#[async_trait]
pub trait Outbound: Send {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Ask the peer to prove it is still there.
    async fn ping(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl Inbound for SplitStream<WebSocket> {
    async fn receive(&mut self) -> Result<Option<Incoming>, TransportError> {
        let Some(frame) = self.next().await else {
            return Ok(None);
        };
        let message = frame?;
        if message.is_close() {
            return Ok(None);
        }
        if message.is_binary() {
            return Err(TransportError::Binary);
        }
        if let Ok(text) = message.to_str() {
            return Ok(Some(Incoming::Envelope(Envelope::from_json(text)?)));
        }
        // ping or pong; the websocket layer answers pings itself
        Ok(Some(Incoming::Heartbeat))
    }
}

#[async_trait]
impl Outbound for SplitSink<WebSocket, Message> {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope.to_json()?;
        SinkExt::send(self, Message::text(text)).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        SinkExt::send(self, Message::ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}
