//! Expert agent for a paid question-and-answer protocol over Nostr.
//!
//! Clients publish public asks (kind 20174); the agent answers with
//! encrypted, invoice-backed bids (20175/20176), verifies payment on the
//! encrypted question (20177) that follows, and publishes an encrypted
//! answer (20178), optionally offering paid follow-up turns. Invoices are
//! minted and checked over Nostr Wallet Connect.
//!
//! The caller supplies two async handlers: one deciding whether to bid on
//! an ask, one producing the answer for a paid question. Relay pub/sub,
//! per-event ephemeral identities, conversation-key encryption, payment
//! verification, and per-conversation timeouts are the agent's job.

mod agent;
mod config;
mod crypto;
mod error;
mod event;
mod handler;
mod nwc;
mod relay;

pub use agent::{ConversationSnapshot, ExpertAgent};
pub use config::{ExpertConfig, DEFAULT_BID_TIMEOUT};
pub use error::{Error, Result};
pub use event::{
    event_hash, finalize, unix_now, verify_event, Event, EventTemplate, Keypair, Tag, KIND_ANSWER,
    KIND_ASK, KIND_BID, KIND_BID_PAYLOAD, KIND_QUESTION,
};
pub use handler::{Answer, Ask, AskHandler, Bid, Question, QuestionHandler, Turn};
pub use nwc::{InvoiceReceipt, InvoiceStatus, NwcClient, KIND_NWC_REQUEST, KIND_NWC_RESPONSE};
pub use crypto::{decrypt, encrypt, preimage_matches};
pub use relay::{Filter, PublishReport, RelayMultiplexer, Subscription, SubscriptionMessage};
