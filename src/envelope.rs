use serde::{Deserialize, Serialize};

/// The protocol operation an [`Envelope`] stands for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Init,
    NegotiateName,
    NewRoom,
    AddToRoom,
    GetAvailableRooms,
    Normal,
}

/// One discrete protocol message, sent as a JSON object per text frame.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: Kind,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "targetedRoom")]
    pub targeted_room: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub ok: bool,
}

impl Envelope {
    pub fn new(kind: Kind) -> Self {
        Envelope {
            kind,
            author: String::new(),
            content: String::new(),
            targeted_room: String::new(),
            timestamp: String::new(),
            ok: false,
        }
    }

    pub fn request(kind: Kind, author: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope {
            author: author.into(),
            content: content.into(),
            ..Envelope::new(kind)
        }
    }

    pub fn chat(author: impl Into<String>, room: impl Into<String>, text: impl Into<String>) -> Self {
        Envelope {
            targeted_room: room.into(),
            ..Envelope::request(Kind::Normal, author, text)
        }
    }

    /// Successful response to a request of `kind`.
    pub fn accepted(kind: Kind, content: impl Into<String>) -> Self {
        Envelope {
            content: content.into(),
            ok: true,
            ..Envelope::new(kind)
        }
    }

    /// Failed response; `reason` is shown to the participant.
    pub fn rejected(kind: Kind, reason: impl Into<String>) -> Self {
        Envelope {
            content: reason.into(),
            ok: false,
            ..Envelope::new(kind)
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
