//! Handler-visible protocol values and user callback traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{Event, Tag};

/// A client's public request for bids, as shown to the decision handler.
#[derive(Debug, Clone)]
pub struct Ask {
    pub id: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    pub tags: Vec<Tag>,
}

impl Ask {
    pub(crate) fn from_event(ev: &Event) -> Self {
        Self {
            id: ev.id.clone(),
            pubkey: ev.pubkey.clone(),
            content: ev.content.clone(),
            created_at: ev.created_at,
            tags: ev.tags.clone(),
        }
    }
}

/// The expert's offer on an ask.
#[derive(Debug, Clone)]
pub struct Bid {
    /// Offer text shown to the client.
    pub content: String,
    /// Price in satoshis.
    pub amount_sats: u64,
    /// Extra tags carried on the bid payload.
    pub tags: Vec<Tag>,
}

impl Bid {
    pub fn new(content: impl Into<String>, amount_sats: u64) -> Self {
        Self {
            content: content.into(),
            amount_sats,
            tags: Vec::new(),
        }
    }
}

/// A paid, decrypted question, as shown to the answer handler.
#[derive(Debug, Clone)]
pub struct Question {
    /// Id of the question event on the wire.
    pub id: String,
    pub content: String,
    pub tags: Vec<Tag>,
}

/// The expert's reply for one turn.
#[derive(Debug, Clone)]
pub struct Answer {
    pub content: String,
    /// Price of a paid follow-up turn; zero ends the conversation.
    pub followup_sats: u64,
    /// Extra tags carried on the answer payload.
    pub tags: Vec<Tag>,
}

impl Answer {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            followup_sats: 0,
            tags: Vec::new(),
        }
    }

    /// Offer a paid follow-up turn at `sats`.
    pub fn with_followup(mut self, sats: u64) -> Self {
        self.followup_sats = sats;
        self
    }
}

/// One completed question/answer exchange.
pub type Turn = (Question, Answer);

/// Decides whether and how to bid on an incoming ask.
#[async_trait]
pub trait AskHandler: Send + Sync {
    /// Return the bid to place, or `None` to stay silent.
    async fn on_ask(&self, ask: &Ask) -> Result<Option<Bid>>;
}

/// Produces the answer for a paid question.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    /// `history` holds every prior turn of this conversation, oldest first.
    async fn on_question(
        &self,
        ask: &Ask,
        bid: &Bid,
        question: &Question,
        history: &[Turn],
    ) -> Result<Answer>;
}

/// JSON body carried inside question and answer ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Payload {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Payload {
    /// First value of the first payload tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [n, v, ..] if n == name => Some(v.as_str()),
            _ => None,
        })
    }
}
