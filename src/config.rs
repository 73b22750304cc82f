//! Agent configuration and `.env` loading.

use std::env;

use anyhow::{Context, Result};

/// Seconds an armed turn waits for a question before expiring.
pub const DEFAULT_BID_TIMEOUT: u64 = 600;

/// Options consumed by the expert agent.
#[derive(Debug, Clone)]
pub struct ExpertConfig {
    /// Nostr Wallet Connect connection string.
    pub nwc_string: String,
    /// 32-byte hex secret for the expert's long-term keypair.
    pub expert_privkey: String,
    /// Relays to listen on for asks.
    pub ask_relays: Vec<String>,
    /// Relays advertised in bid payloads, used for questions and answers.
    pub question_relays: Vec<String>,
    /// Topic tags to bid on; empty disables the topic subscription.
    pub hashtags: Vec<String>,
    /// Seconds before an armed turn expires.
    pub bid_timeout: u64,
    /// Optional SOCKS5 proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
}

impl ExpertConfig {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let nwc_string = env::var("NWC_STRING").context("NWC_STRING")?;
        let expert_privkey = env::var("EXPERT_PRIVKEY").context("EXPERT_PRIVKEY")?;
        let ask_relays = csv_strings(env::var("ASK_RELAYS").context("ASK_RELAYS")?);
        let question_relays = csv_strings(env::var("QUESTION_RELAYS").context("QUESTION_RELAYS")?);
        let hashtags = csv_strings(env::var("HASHTAGS").unwrap_or_default());
        let bid_timeout = env::var("BID_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BID_TIMEOUT);
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        Ok(Self {
            nwc_string,
            expert_privkey,
            ask_relays,
            question_relays,
            hashtags,
            bid_timeout,
            tor_socks,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
