//! Nostr Wallet Connect client: invoice minting and settlement lookup.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::crypto;
use crate::error::{Error, Result};
use crate::event::{finalize, unix_now, EventTemplate, Keypair, Tag};
use crate::relay::{Filter, RelayMultiplexer, SubscriptionMessage};

/// NIP-47 wallet request kind.
pub const KIND_NWC_REQUEST: u32 = 23194;
/// NIP-47 wallet response kind.
pub const KIND_NWC_RESPONSE: u32 = 23195;

/// How long to wait for the wallet's response event.
const WALLET_TIMEOUT: Duration = Duration::from_secs(30);

/// Freshly minted invoice and its payment hash.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceReceipt {
    pub invoice: String,
    pub payment_hash: String,
}

/// Settlement state of a previously minted invoice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceStatus {
    /// Settlement timestamp, positive iff paid.
    #[serde(default)]
    pub settled_at: Option<i64>,
    #[serde(default)]
    pub preimage: Option<String>,
}

impl InvoiceStatus {
    /// Whether the wallet reports the invoice as paid.
    pub fn is_settled(&self) -> bool {
        self.settled_at.map_or(false, |t| t > 0)
    }
}

/// Client for one `nostr+walletconnect://` connection.
pub struct NwcClient {
    wallet_pubkey: String,
    relays: Vec<String>,
    keys: Keypair,
    mux: Arc<RelayMultiplexer>,
}

impl NwcClient {
    /// Parse a connection string and bind the client to a relay multiplexer.
    pub fn connect(nwc_string: &str, mux: Arc<RelayMultiplexer>) -> Result<Self> {
        let url =
            Url::parse(nwc_string).map_err(|e| Error::Config(format!("nwc_string: {e}")))?;
        if url.scheme() != "nostr+walletconnect" {
            return Err(Error::Config(format!(
                "nwc_string: unexpected scheme {}",
                url.scheme()
            )));
        }
        let wallet_pubkey = url
            .host_str()
            .ok_or_else(|| Error::Config("nwc_string: missing wallet pubkey".into()))?
            .to_lowercase();
        match hex::decode(&wallet_pubkey) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => {
                return Err(Error::Config(
                    "nwc_string: wallet pubkey must be 32-byte hex".into(),
                ))
            }
        }
        let mut relays = Vec::new();
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => relays.push(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                _ => {}
            }
        }
        if relays.is_empty() {
            return Err(Error::Config("nwc_string: missing relay".into()));
        }
        let secret =
            secret.ok_or_else(|| Error::Config("nwc_string: missing secret".into()))?;
        let keys = Keypair::from_secret_hex(&secret)
            .map_err(|_| Error::Config("nwc_string: secret must be 32-byte hex".into()))?;
        Ok(Self {
            wallet_pubkey,
            relays,
            keys,
            mux,
        })
    }

    /// Relay URLs this connection talks to.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Mint an invoice for `amount_msat` millisatoshis.
    pub async fn make_invoice(&self, amount_msat: u64, description: &str) -> Result<InvoiceReceipt> {
        let result = self
            .request(
                "make_invoice",
                json!({ "amount": amount_msat, "description": description }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::PaymentBackend(format!("malformed make_invoice result: {e}")))
    }

    /// Look up settlement state by payment hash.
    pub async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus> {
        let result = self
            .request("lookup_invoice", json!({ "payment_hash": payment_hash }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::PaymentBackend(format!("malformed lookup_invoice result: {e}")))
    }

    /// One encrypted request/response round trip with the wallet service.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({ "method": method, "params": params }).to_string();
        let content = crypto::encrypt(&body, &self.keys, &self.wallet_pubkey)
            .map_err(|e| Error::PaymentBackend(format!("request encrypt: {e}")))?;
        let request = finalize(
            EventTemplate {
                kind: KIND_NWC_REQUEST,
                created_at: unix_now(),
                tags: vec![
                    Tag::pair("p", &self.wallet_pubkey),
                    Tag::pair("encryption", "nip44_v2"),
                ],
                content,
            },
            &self.keys,
        )?;
        // Listen for the response before the wallet can see the request.
        let mut sub = self
            .mux
            .subscribe(
                &self.relays,
                vec![Filter::new()
                    .kinds(&[KIND_NWC_RESPONSE])
                    .tag('e', &[request.id.as_str()])
                    .to_json()],
            )
            .await;
        let report = self.mux.publish(&self.relays, &request).await;
        if !report.accepted_any() {
            sub.close().await;
            return Err(Error::PaymentBackend("wallet relay rejected request".into()));
        }
        debug!(method, request = %request.id, "wallet request published");
        let response = tokio::time::timeout(WALLET_TIMEOUT, async {
            while let Some(msg) = sub.recv().await {
                if let SubscriptionMessage::Event(ev) = msg {
                    return Some(ev);
                }
            }
            None
        })
        .await;
        sub.close().await;
        let response = match response {
            Ok(Some(ev)) => ev,
            _ => return Err(Error::PaymentBackend(format!("no wallet response to {method}"))),
        };
        let plain = crypto::decrypt(&response.content, &self.keys, &self.wallet_pubkey)
            .map_err(|e| Error::PaymentBackend(format!("response decrypt: {e}")))?;
        let val: Value = serde_json::from_str(&plain)
            .map_err(|e| Error::PaymentBackend(format!("malformed response: {e}")))?;
        if let Some(err) = val.get("error").filter(|e| !e.is_null()) {
            return Err(Error::PaymentBackend(format!(
                "{}: {}",
                err["code"].as_str().unwrap_or("unknown"),
                err["message"].as_str().unwrap_or("")
            )));
        }
        Ok(val.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn nwc_uri(wallet: &Keypair, relay: &str, client: &Keypair) -> String {
        format!(
            "nostr+walletconnect://{}?relay={}&secret={}",
            wallet.public_hex(),
            relay,
            hex::encode(client.secret_bytes())
        )
    }

    #[test]
    fn connect_parses_uri() {
        let wallet = Keypair::generate();
        let client = Keypair::generate();
        let mux = Arc::new(RelayMultiplexer::new(None));
        let nwc = NwcClient::connect(
            &nwc_uri(&wallet, "ws://127.0.0.1:4848", &client),
            mux,
        )
        .unwrap();
        assert_eq!(nwc.wallet_pubkey, wallet.public_hex());
        assert_eq!(nwc.relays(), ["ws://127.0.0.1:4848"]);
        assert_eq!(nwc.keys.public_hex(), client.public_hex());
    }

    #[test]
    fn connect_rejects_malformed_uris() {
        let mux = Arc::new(RelayMultiplexer::new(None));
        let uris = vec![
            "http://example.com".to_string(),
            "nostr+walletconnect://nothex?relay=ws://r&secret=00".to_string(),
            format!(
                "nostr+walletconnect://{}?secret={}",
                "ab".repeat(32),
                "cd".repeat(32)
            ),
            format!("nostr+walletconnect://{}?relay=ws://r", "ab".repeat(32)),
        ];
        for uri in uris {
            assert!(NwcClient::connect(&uri, mux.clone()).is_err(), "{uri}");
        }
    }

    /// Wallet service speaking one request/response over a raw socket.
    async fn serve_wallet(
        listener: tokio::net::TcpListener,
        wallet: Keypair,
        response_body: Value,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // response subscription
        let req = ws.next().await.unwrap().unwrap();
        let val: Value = serde_json::from_str(req.to_text().unwrap()).unwrap();
        assert_eq!(val[0], "REQ");
        let sub_id = val[1].as_str().unwrap().to_string();
        assert_eq!(val[2]["kinds"][0], KIND_NWC_RESPONSE);
        // the request event itself
        let frame = ws.next().await.unwrap().unwrap();
        let val: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(val[0], "EVENT");
        let request: Event = serde_json::from_value(val[1].clone()).unwrap();
        ws.send(TMsg::Text(
            serde_json::json!(["OK", &request.id, true, ""]).to_string(),
        ))
        .await
        .unwrap();
        let plain =
            crypto::decrypt(&request.content, &wallet, &request.pubkey).unwrap();
        let body: Value = serde_json::from_str(&plain).unwrap();
        let reply = json!({
            "result_type": body["method"],
            "error": response_body.get("error").cloned().unwrap_or(Value::Null),
            "result": response_body.get("result").cloned().unwrap_or(Value::Null),
        });
        let content =
            crypto::encrypt(&reply.to_string(), &wallet, &request.pubkey).unwrap();
        let response = finalize(
            EventTemplate {
                kind: KIND_NWC_RESPONSE,
                created_at: unix_now(),
                tags: vec![
                    Tag::pair("e", &request.id),
                    Tag::pair("p", &request.pubkey),
                ],
                content,
            },
            &wallet,
        )
        .unwrap();
        ws.send(TMsg::Text(
            serde_json::json!(["EVENT", sub_id, response]).to_string(),
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn make_invoice_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = format!("ws://{}", listener.local_addr().unwrap());
        let wallet = Keypair::generate();
        let client = Keypair::generate();
        let server = tokio::spawn(serve_wallet(
            listener,
            wallet.clone(),
            json!({ "result": { "invoice": "lnbc10n1...", "payment_hash": "ab".repeat(32) } }),
        ));

        let mux = Arc::new(RelayMultiplexer::new(None));
        let nwc = NwcClient::connect(&nwc_uri(&wallet, &relay, &client), mux).unwrap();
        let receipt = nwc.make_invoice(10_000, "Bid for ask abc").await.unwrap();
        assert_eq!(receipt.invoice, "lnbc10n1...");
        assert_eq!(receipt.payment_hash, "ab".repeat(32));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lookup_invoice_reports_settlement() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = format!("ws://{}", listener.local_addr().unwrap());
        let wallet = Keypair::generate();
        let client = Keypair::generate();
        let server = tokio::spawn(serve_wallet(
            listener,
            wallet.clone(),
            json!({ "result": { "settled_at": 1_700_000_123, "preimage": "00ff" } }),
        ));

        let mux = Arc::new(RelayMultiplexer::new(None));
        let nwc = NwcClient::connect(&nwc_uri(&wallet, &relay, &client), mux).unwrap();
        let status = nwc.lookup_invoice(&"ab".repeat(32)).await.unwrap();
        assert!(status.is_settled());
        assert_eq!(status.preimage.as_deref(), Some("00ff"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unsettled_invoice_is_not_settled() {
        assert!(!InvoiceStatus::default().is_settled());
        assert!(!InvoiceStatus {
            settled_at: Some(0),
            preimage: None
        }
        .is_settled());
    }

    #[tokio::test]
    async fn wallet_error_surfaces_as_payment_backend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = format!("ws://{}", listener.local_addr().unwrap());
        let wallet = Keypair::generate();
        let client = Keypair::generate();
        let server = tokio::spawn(serve_wallet(
            listener,
            wallet.clone(),
            json!({ "error": { "code": "INSUFFICIENT_BALANCE", "message": "nope" } }),
        ));

        let mux = Arc::new(RelayMultiplexer::new(None));
        let nwc = NwcClient::connect(&nwc_uri(&wallet, &relay, &client), mux).unwrap();
        let err = nwc.make_invoice(1_000, "x").await.unwrap_err();
        assert!(matches!(err, Error::PaymentBackend(_)));
        assert!(err.to_string().contains("INSUFFICIENT_BALANCE"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_wallet_relay_errors() {
        let wallet = Keypair::generate();
        let client = Keypair::generate();
        let mux = Arc::new(RelayMultiplexer::new(None));
        let nwc =
            NwcClient::connect(&nwc_uri(&wallet, "ws://127.0.0.1:1", &client), mux).unwrap();
        let err = nwc.make_invoice(1_000, "x").await.unwrap_err();
        assert!(matches!(err, Error::PaymentBackend(_)));
    }
}
