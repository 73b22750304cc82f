//! Expert agent core: ask listener, bid pipeline, conversation registry,
//! question→answer pipeline, lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExpertConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::event::{
    finalize, unix_now, verify_event, Event, EventTemplate, Keypair, Tag, KIND_ANSWER, KIND_ASK,
    KIND_BID, KIND_BID_PAYLOAD, KIND_QUESTION,
};
use crate::handler::{Ask, AskHandler, Bid, Payload, Question, QuestionHandler, Turn};
use crate::nwc::NwcClient;
use crate::relay::{Filter, RelayMultiplexer, Subscription, SubscriptionMessage};

/// Backfill window for the ask subscription.
const ASK_BACKFILL_SECS: u64 = 10;

/// Observable snapshot of an armed conversation.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    /// Event id the next question must tag.
    pub context_id: String,
    /// The asker's public key, constant across follow-ups.
    pub session_pubkey: String,
    /// Payment hash of the most recent outbound invoice.
    pub payment_hash: String,
    /// Completed turns so far.
    pub turns: usize,
    /// Unix second the conversation was created.
    pub created_at: u64,
}

/// Per-conversation state, owned by the task that runs its turns.
struct Conversation {
    ask: Ask,
    bid: Bid,
    session_pubkey: String,
    payment_hash: String,
    created_at: u64,
    history: Vec<Turn>,
}

struct AgentInner {
    cfg: ExpertConfig,
    keys: Keypair,
    relays: Arc<RelayMultiplexer>,
    wallet: NwcClient,
    on_ask: Arc<dyn AskHandler>,
    on_question: Arc<dyn QuestionHandler>,
    registry: Mutex<HashMap<String, ConversationSnapshot>>,
    shutdown: watch::Sender<bool>,
}

/// The expert side of the paid Q&A protocol.
///
/// Listens for asks, places invoice-backed bids, verifies payment on
/// incoming questions, and publishes encrypted answers, optionally chaining
/// paid follow-up turns.
pub struct ExpertAgent {
    inner: Arc<AgentInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ExpertAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpertAgent").finish_non_exhaustive()
    }
}

impl ExpertAgent {
    /// Validate the configuration and build an agent. No I/O happens here.
    pub fn new(
        cfg: ExpertConfig,
        on_ask: Arc<dyn AskHandler>,
        on_question: Arc<dyn QuestionHandler>,
    ) -> Result<Self> {
        if cfg.ask_relays.is_empty() {
            return Err(Error::Config("ask_relays must not be empty".into()));
        }
        if cfg.question_relays.is_empty() {
            return Err(Error::Config("question_relays must not be empty".into()));
        }
        let keys = Keypair::from_secret_hex(&cfg.expert_privkey)
            .map_err(|_| Error::Config("expert_privkey must be 32-byte hex".into()))?;
        let relays = Arc::new(RelayMultiplexer::new(cfg.tor_socks.clone()));
        let wallet = NwcClient::connect(&cfg.nwc_string, relays.clone())?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(AgentInner {
                cfg,
                keys,
                relays,
                wallet,
                on_ask,
                on_question,
                registry: Mutex::new(HashMap::new()),
                shutdown,
            }),
            listener: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// The expert's long-term public key (x-only hex).
    pub fn public_key(&self) -> String {
        self.inner.keys.public_hex()
    }

    /// Snapshots of every armed conversation, keyed state included.
    pub fn armed_conversations(&self) -> Vec<ConversationSnapshot> {
        self.inner.registry.lock().unwrap().values().cloned().collect()
    }

    /// Open the ask subscription and begin bidding.
    pub async fn start(&self) {
        if self.listener.lock().unwrap().is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let since = unix_now().saturating_sub(ASK_BACKFILL_SECS);
        let mut filters = Vec::new();
        if !inner.cfg.hashtags.is_empty() {
            let tags: Vec<&str> = inner.cfg.hashtags.iter().map(String::as_str).collect();
            filters.push(
                Filter::new()
                    .kinds(&[KIND_ASK])
                    .since(since)
                    .tag('t', &tags)
                    .to_json(),
            );
        }
        let pubkey = inner.keys.public_hex();
        filters.push(
            Filter::new()
                .kinds(&[KIND_ASK])
                .since(since)
                .tag('p', &[pubkey.as_str()])
                .to_json(),
        );
        let sub = inner.relays.subscribe(&inner.cfg.ask_relays, filters).await;
        let handle = tokio::spawn(listen_asks(inner, sub));
        *self.listener.lock().unwrap() = Some(handle);
        info!(expert = %pubkey, "expert agent started");
    }

    /// Close every subscription, clear the registry, and release relay
    /// connections. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        let listener = self.listener.lock().unwrap().take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
        self.inner.registry.lock().unwrap().clear();
        let mut relays: Vec<String> = self
            .inner
            .cfg
            .ask_relays
            .iter()
            .chain(self.inner.cfg.question_relays.iter())
            .chain(self.inner.wallet.relays().iter())
            .cloned()
            .collect();
        relays.sort();
        relays.dedup();
        self.inner.relays.close_all(&relays).await;
        info!("expert agent stopped");
    }
}

/// Consume the ask subscription, dispatching each ask to the bid pipeline.
async fn listen_asks(inner: Arc<AgentInner>, mut sub: Subscription) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = sub.recv() => match msg {
                Some(SubscriptionMessage::Event(ev)) => {
                    if ev.kind != KIND_ASK {
                        debug!(event = %ev.id, kind = ev.kind, "ignoring non-ask event");
                        continue;
                    }
                    if let Err(e) = verify_event(&ev) {
                        warn!(event = %ev.id, "rejecting unverifiable ask: {e}");
                        continue;
                    }
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let ask_id = ev.id.clone();
                        if let Err(e) = place_bid(inner, ev).await {
                            warn!(ask = %ask_id, "bid pipeline: {e}");
                        }
                    });
                }
                Some(SubscriptionMessage::EndOfStored(relay)) => {
                    debug!(relay = %relay, "ask backlog drained");
                }
                None => break,
            }
        }
    }
    sub.close().await;
}

/// Run the bid pipeline for one ask event.
async fn place_bid(inner: Arc<AgentInner>, ask_event: Event) -> Result<()> {
    let ask = Ask::from_event(&ask_event);
    let bid = match inner.on_ask.on_ask(&ask).await {
        Ok(Some(bid)) => bid,
        Ok(None) => {
            debug!(ask = %ask.id, "declined");
            return Ok(());
        }
        Err(e) => return Err(Error::Handler(format!("on_ask: {e}"))),
    };
    let receipt = inner
        .wallet
        .make_invoice(bid.amount_sats * 1000, &format!("Bid for ask {}", ask.id))
        .await?;

    // Inner offer, signed by the long-term key so the client can bind it to
    // the expert's public identity.
    let mut tags = vec![Tag::pair("invoice", &receipt.invoice)];
    for relay in &inner.cfg.question_relays {
        tags.push(Tag::pair("relay", relay));
    }
    tags.extend(bid.tags.iter().cloned());
    let payload_event = finalize(
        EventTemplate {
            kind: KIND_BID_PAYLOAD,
            created_at: unix_now(),
            tags,
            content: bid.content.clone(),
        },
        &inner.keys,
    )?;

    // Outer envelope under a throwaway identity; discarded after signing.
    let bid_keys = Keypair::generate();
    let ciphertext = crypto::encrypt(
        &serde_json::to_string(&payload_event)?,
        &bid_keys,
        &ask.pubkey,
    )?;
    let bid_event = finalize(
        EventTemplate {
            kind: KIND_BID,
            created_at: unix_now(),
            tags: vec![Tag::pair("e", &ask.id)],
            content: ciphertext,
        },
        &bid_keys,
    )?;

    let report = inner.relays.publish(&inner.cfg.ask_relays, &bid_event).await;
    info!(
        ask = %ask.id,
        accepted = report.accepted,
        failed = report.failed,
        "bid published"
    );
    if !report.accepted_any() {
        return Err(Error::Publish(bid_event.id));
    }

    let session_pubkey = ask.pubkey.clone();
    let convo = Conversation {
        ask,
        bid,
        session_pubkey,
        payment_hash: receipt.payment_hash,
        created_at: unix_now(),
        history: Vec::new(),
    };
    arm(inner, convo, payload_event.id).await;
    Ok(())
}

/// Subscribe for questions tagging `context_id`, register the conversation,
/// and hand it to its owning task.
async fn arm(inner: Arc<AgentInner>, convo: Conversation, context_id: String) {
    let sub = question_subscription(&inner, &context_id).await;
    register(&inner, &context_id, &convo);
    tokio::spawn(run_conversation(inner, convo, context_id, sub));
}

async fn question_subscription(inner: &Arc<AgentInner>, context_id: &str) -> Subscription {
    inner
        .relays
        .subscribe(
            &inner.cfg.question_relays,
            vec![Filter::new()
                .kinds(&[KIND_QUESTION])
                .tag('e', &[context_id])
                .to_json()],
        )
        .await
}

fn register(inner: &AgentInner, context_id: &str, convo: &Conversation) {
    inner.registry.lock().unwrap().insert(
        context_id.to_string(),
        ConversationSnapshot {
            context_id: context_id.to_string(),
            session_pubkey: convo.session_pubkey.clone(),
            payment_hash: convo.payment_hash.clone(),
            turns: convo.history.len(),
            created_at: convo.created_at,
        },
    );
}

/// Own one conversation across its turns until it resolves or expires.
async fn run_conversation(
    inner: Arc<AgentInner>,
    mut convo: Conversation,
    mut context_id: String,
    mut sub: Subscription,
) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let timer = tokio::time::sleep(Duration::from_secs(inner.cfg.bid_timeout));
        tokio::pin!(timer);
        let mut drained = false;
        let question_event = loop {
            tokio::select! {
                _ = &mut timer => {
                    debug!(context = %context_id, "conversation expired");
                    inner.registry.lock().unwrap().remove(&context_id);
                    sub.close().await;
                    return;
                }
                _ = shutdown.changed() => {
                    sub.close().await;
                    return;
                }
                msg = sub.recv(), if !drained => match msg {
                    Some(SubscriptionMessage::Event(ev)) => {
                        // Traffic for another context keeps this turn armed.
                        if ev.tag_value("e") != Some(context_id.as_str()) {
                            debug!(context = %context_id, event = %ev.id, "ignoring foreign context");
                            continue;
                        }
                        break ev;
                    }
                    Some(SubscriptionMessage::EndOfStored(_)) => continue,
                    None => drained = true,
                }
            }
        };

        // Single shot per turn: disarm before the handler runs so a second
        // question cannot race it.
        inner.registry.lock().unwrap().remove(&context_id);
        sub.close().await;

        match answer_turn(&inner, &mut convo, question_event).await {
            Ok(Some(next_context)) => {
                if *inner.shutdown.borrow() {
                    return;
                }
                sub = question_subscription(&inner, &next_context).await;
                register(&inner, &next_context, &convo);
                context_id = next_context;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(context = %context_id, "turn abandoned: {e}");
                return;
            }
        }
    }
}

/// Validate, verify payment, consult the handler, and publish the answer for
/// one question. Returns the next context id when a follow-up was armed.
async fn answer_turn(
    inner: &Arc<AgentInner>,
    convo: &mut Conversation,
    question_event: Event,
) -> Result<Option<String>> {
    if question_event.kind != KIND_QUESTION {
        return Err(Error::Validation(format!(
            "expected question kind, got {}",
            question_event.kind
        )));
    }
    let plaintext = crypto::decrypt(
        &question_event.content,
        &inner.keys,
        &convo.session_pubkey,
    )?;
    let payload: Payload = serde_json::from_str(&plaintext)
        .map_err(|e| Error::Validation(format!("question payload: {e}")))?;
    let preimage = payload
        .tag_value("preimage")
        .ok_or_else(|| Error::Validation("missing preimage tag".into()))?
        .to_string();
    if !crypto::preimage_matches(&preimage, &convo.payment_hash) {
        return Err(Error::PaymentHashMismatch);
    }
    // The preimage alone proves knowledge, not settlement at this wallet.
    let status = inner.wallet.lookup_invoice(&convo.payment_hash).await?;
    if !status.is_settled() {
        return Err(Error::PaymentUnsettled);
    }

    let question = Question {
        id: question_event.id.clone(),
        content: payload.content,
        tags: payload.tags,
    };
    let answer = inner
        .on_question
        .on_question(&convo.ask, &convo.bid, &question, &convo.history)
        .await
        .map_err(|e| Error::Handler(format!("on_question: {e}")))?;

    let followup = if answer.followup_sats > 0 {
        Some(
            inner
                .wallet
                .make_invoice(
                    answer.followup_sats * 1000,
                    &format!("Follow-up for ask {}", convo.ask.id),
                )
                .await?,
        )
    } else {
        None
    };

    let mut tags = answer.tags.clone();
    if let Some(receipt) = &followup {
        tags.push(Tag::pair("invoice", &receipt.invoice));
    }
    let body = serde_json::to_string(&Payload {
        content: answer.content.clone(),
        tags,
    })?;
    let ciphertext = crypto::encrypt(&body, &inner.keys, &convo.session_pubkey)?;
    let answer_keys = Keypair::generate();
    let answer_event = finalize(
        EventTemplate {
            kind: KIND_ANSWER,
            created_at: unix_now(),
            tags: vec![Tag::pair("e", &question.id)],
            content: ciphertext,
        },
        &answer_keys,
    )?;

    let report = inner
        .relays
        .publish(&inner.cfg.question_relays, &answer_event)
        .await;
    info!(
        question = %question.id,
        accepted = report.accepted,
        failed = report.failed,
        "answer published"
    );
    if !report.accepted_any() {
        return Err(Error::Publish(answer_event.id));
    }

    convo.history.push((question, answer));
    match followup {
        Some(receipt) => {
            convo.payment_hash = receipt.payment_hash;
            Ok(Some(answer_event.id))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Answer;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl AskHandler for Silent {
        async fn on_ask(&self, _ask: &Ask) -> Result<Option<Bid>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl QuestionHandler for Silent {
        async fn on_question(
            &self,
            _ask: &Ask,
            _bid: &Bid,
            _question: &Question,
            _history: &[Turn],
        ) -> Result<Answer> {
            Ok(Answer::new(""))
        }
    }

    fn config(privkey: &str) -> ExpertConfig {
        ExpertConfig {
            nwc_string: format!(
                "nostr+walletconnect://{}?relay=ws://127.0.0.1:1&secret={}",
                "ab".repeat(32),
                "cd".repeat(32)
            ),
            expert_privkey: privkey.into(),
            ask_relays: vec!["ws://127.0.0.1:1".into()],
            question_relays: vec!["ws://127.0.0.1:2".into()],
            hashtags: vec![],
            bid_timeout: 600,
            tor_socks: None,
        }
    }

    #[test]
    fn new_validates_config() {
        let keys = Keypair::generate();
        let privkey = hex::encode(keys.secret_bytes());
        let agent = ExpertAgent::new(config(&privkey), Arc::new(Silent), Arc::new(Silent)).unwrap();
        assert_eq!(agent.public_key(), keys.public_hex());
        assert!(agent.armed_conversations().is_empty());
    }

    #[test]
    fn new_rejects_bad_privkey() {
        let err =
            ExpertAgent::new(config("zz"), Arc::new(Silent), Arc::new(Silent)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn new_rejects_empty_relays() {
        let keys = Keypair::generate();
        let mut cfg = config(&hex::encode(keys.secret_bytes()));
        cfg.ask_relays.clear();
        assert!(ExpertAgent::new(cfg, Arc::new(Silent), Arc::new(Silent)).is_err());

        let mut cfg = config(&hex::encode(keys.secret_bytes()));
        cfg.question_relays.clear();
        assert!(ExpertAgent::new(cfg, Arc::new(Silent), Arc::new(Silent)).is_err());
    }

    #[test]
    fn new_rejects_bad_nwc_string() {
        let keys = Keypair::generate();
        let mut cfg = config(&hex::encode(keys.secret_bytes()));
        cfg.nwc_string = "http://not-a-wallet".into();
        assert!(ExpertAgent::new(cfg, Arc::new(Silent), Arc::new(Silent)).is_err());
    }
}
