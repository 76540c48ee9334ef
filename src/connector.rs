//! Client side of the protocol: connect, sign in, pick rooms, chat.
//!
//! Rendering and operator input live elsewhere; this yields [`ChatLine`]s
//! and takes chat text as plain strings.

use std::collections::VecDeque;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::envelope::{Envelope, Kind};
use crate::error::ConnectorError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One relayed chat message, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub author: String,
    pub content: String,
    pub room: String,
    pub timestamp: String,
}

impl From<Envelope> for ChatLine {
    fn from(envelope: Envelope) -> Self {
        ChatLine {
            author: envelope.author,
            content: envelope.content,
            room: envelope.targeted_room,
            timestamp: envelope.timestamp,
        }
    }
}

pub struct Connector {
    ws: WsStream,
    nickname: String,
    /// Chat that arrived while waiting for a response.
    backlog: VecDeque<ChatLine>,
}

impl Connector {
    pub async fn connect(url: &str) -> Result<Self, ConnectorError> {
        let (ws, _) = connect_async(url).await?;
        Ok(Connector {
            ws,
            nickname: String::new(),
            backlog: VecDeque::new(),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Sign in. A taken nickname comes back as `Rejected` and the
    /// connection stays usable for another attempt.
    pub async fn init(&mut self, nickname: &str) -> Result<(), ConnectorError> {
        self.request(Envelope::request(Kind::Init, nickname, "")).await?;
        self.nickname = nickname.to_string();
        Ok(())
    }

    pub async fn negotiate_name(&mut self, room: &str) -> Result<(), ConnectorError> {
        self.request(Envelope::request(Kind::NegotiateName, self.nickname.clone(), room))
            .await?;
        Ok(())
    }

    pub async fn create_room(&mut self, room: &str) -> Result<String, ConnectorError> {
        let reply = self
            .request(Envelope::request(Kind::NewRoom, self.nickname.clone(), room))
            .await?;
        Ok(reply.content)
    }

    pub async fn join_room(&mut self, room: &str) -> Result<String, ConnectorError> {
        let reply = self
            .request(Envelope::request(Kind::AddToRoom, self.nickname.clone(), room))
            .await?;
        Ok(reply.content)
    }

    pub async fn list_rooms(&mut self) -> Result<Vec<String>, ConnectorError> {
        let reply = self
            .request(Envelope::request(Kind::GetAvailableRooms, self.nickname.clone(), ""))
            .await?;
        Ok(reply.content.split_whitespace().map(str::to_string).collect())
    }

    /// Fire and forget; the server never answers chat directly.
    pub async fn send_chat(&mut self, room: &str, text: &str) -> Result<(), ConnectorError> {
        self.send(&Envelope::chat(self.nickname.clone(), room, text)).await
    }

    /// Next chat message, or `None` once the server has closed.
    pub async fn next_line(&mut self) -> Result<Option<ChatLine>, ConnectorError> {
        if let Some(line) = self.backlog.pop_front() {
            return Ok(Some(line));
        }
        loop {
            match self.recv().await? {
                Some(envelope) if envelope.kind == Kind::Normal => return Ok(Some(envelope.into())),
                Some(envelope) => debug!("Ignoring stray {:?} response", envelope.kind),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ConnectorError> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn request(&mut self, envelope: Envelope) -> Result<Envelope, ConnectorError> {
        let kind = envelope.kind;
        self.send(&envelope).await?;

        loop {
            let Some(reply) = self.recv().await? else {
                return Err(ConnectorError::Closed);
            };
            if reply.kind == Kind::Normal {
                self.backlog.push_back(reply.into());
                continue;
            }
            if reply.kind != kind {
                return Err(ConnectorError::Unexpected(reply.kind));
            }
            if !reply.ok {
                return Err(ConnectorError::Rejected {
                    kind,
                    reason: reply.content,
                });
            }
            return Ok(reply);
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ConnectorError> {
        let text = envelope.to_json()?;
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, ConnectorError> {
        while let Some(message) = self.ws.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(Envelope::from_json(text.as_str())?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}
