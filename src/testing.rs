//! Shared test fixtures: a fully wired in-process module with a seeded
//! design, a loopback bus, and helpers that drive the real lifecycle
//! operations end to end.

use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::AppState;
use crate::config::Config;
use crate::identity::StaticIdentityProvider;
use crate::ledger::StaticLedger;
use crate::lifecycle;
use crate::nostr::event::{kinds, public_key_for, topics};
use crate::nostr::{Event, EventTemplate, nip26};
use crate::outbox::LoopbackBus;
use crate::store::memory::MemoryStore;
use crate::store::model::{Card, Ntag};
use crate::sun;
use crate::timestamp::UnixTimestamp;
use crate::types::{CardId, PublicKey, TokenAmounts};

/// Fixed wall-clock for deterministic tests.
pub const NOW: u64 = 1_700_000_000;

/// Delegation window containing [`NOW`].
pub const CONDITIONS: &str = "kind=1112&created_at>1690000000&created_at<1710000000";

pub const DEFAULT_CID: &str = "f0da0000000010";
pub const DEFAULT_OTC: &str = "weirdcode";

/// A holder identity together with its provisioned card.
pub struct TestHolder {
    pub secret: SecretKey,
    pub pubkey: PublicKey,
    pub ntag: Ntag,
    pub card: Card,
}

pub struct Harness {
    pub state: AppState,
    pub bus: Arc<LoopbackBus>,
    pub writer_secret: SecretKey,
    pub admin_secret: SecretKey,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_balances(TokenAmounts::from([("BTC".to_string(), 100_000_000)])).await
    }

    pub async fn with_balances(balances: TokenAmounts) -> Self {
        let module_secret = SecretKey::from_slice(&[0x77; 32]).unwrap();
        let writer_secret = SecretKey::from_slice(&[0x88; 32]).unwrap();
        let admin_secret = SecretKey::from_slice(&[0xad; 32]).unwrap();
        let vars: HashMap<&str, String> = HashMap::from([
            ("SERVER_AES_KEY_HEX", "0f0e0d0c0b0a09080706050403020100".to_string()),
            ("NOSTR_PRIVATE_KEY", "77".repeat(32)),
            ("NOSTR_PUBLIC_KEY", public_key_for(&module_secret).to_hex()),
            ("CARD_WRITER_PUBKEY", public_key_for(&writer_secret).to_hex()),
            ("ADMIN_PUBKEYS", public_key_for(&admin_secret).to_hex()),
            ("LAWALLET_FEDERATION_ID", "lawallet.ar".to_string()),
            ("LAWALLET_API_BASE_URL", "https://api.lawallet.ar".to_string()),
            ("IDENTITY_PROVIDER_API_BASE", "https://lawallet.ar".to_string()),
            ("LEDGER_PUBLIC_KEY", "aa".repeat(32)),
            ("BTC_GATEWAY_PUBLIC_KEY", "bb".repeat(32)),
            (
                "DEFAULT_LIMITS",
                "Daily;Default daily window;BTC;1000000;86400".to_string(),
            ),
            ("DEFAULT_TRUSTED_MERCHANTS", String::new()),
            ("PAYMENT_REQUEST_EXPIRY_IN_SECONDS", "300".to_string()),
            ("CARD_DESIGNS", "To the moon;Rocket artwork".to_string()),
        ]);
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
        let bus = Arc::new(LoopbackBus::new());
        let state = AppState {
            config: Arc::new(config),
            store: Arc::new(MemoryStore::new()),
            outbox: bus.clone(),
            ledger: Arc::new(StaticLedger::new(balances)),
            identity: Arc::new(StaticIdentityProvider::default()),
        };
        state.seed().await.unwrap();
        Harness {
            state,
            bus,
            writer_secret,
            admin_secret,
        }
    }

    pub fn now(&self) -> UnixTimestamp {
        UnixTimestamp(NOW)
    }

    pub fn module_pubkey(&self) -> PublicKey {
        self.state.config.nostr_public_key
    }

    /// Sign a request event (kind 1112) as the given author.
    pub fn request_event(&self, author: &SecretKey, topic: &str, content: String) -> Event {
        Event::finalize(
            EventTemplate {
                created_at: self.now(),
                kind: kinds::TRANSACTION,
                tags: vec![
                    vec!["t".to_string(), topic.to_string()],
                    vec!["p".to_string(), self.module_pubkey().to_hex()],
                ],
                content,
            },
            author,
        )
    }

    /// Delegation token authorizing the module to sign for `holder`.
    pub fn delegation_json(&self, holder: &SecretKey) -> serde_json::Value {
        let token = nip26::sign_token(holder, &self.module_pubkey(), CONDITIONS);
        serde_json::json!({ "conditions": CONDITIONS, "token": token })
    }

    /// Drive Initialize with a writer-signed event; returns the NTAG with
    /// its freshly generated keys, exactly as the card writer would see it.
    pub async fn initialize_ntag(&self, cid: &str, ctr: u32) -> Ntag {
        let content = serde_json::json!({
            "cid": cid,
            "ctr": ctr,
            "design": { "name": "To the moon" },
        });
        let event = self.request_event(&self.writer_secret, "card-init-request", content.to_string());
        let response = lifecycle::initialize(&self.state, &event, self.now())
            .await
            .unwrap();
        serde_json::from_str(&response.content).unwrap()
    }

    /// The `(p, c)` pair this NTAG would emit at `counter`.
    pub fn tap(&self, ntag: &Ntag, counter: u32) -> (String, String) {
        sun::generate_pc(
            &self.state.config.server_aes_key,
            &ntag.k2,
            &ntag.cid,
            counter,
            &[0u8; 5],
        )
    }

    /// A fresh tap one counter step past the stored value.
    pub async fn next_tap(&self, cid: &CardId) -> (String, String) {
        let ntag = self.state.store.ntag_by_cid(cid).await.unwrap().unwrap();
        self.tap(&ntag, ntag.ctr + 1)
    }

    /// Drive Associate for `ntag` with a fresh tap.
    pub async fn associate(&self, ntag: &Ntag, otc: &str) {
        let (p, c) = self.next_tap(&ntag.cid).await;
        let event = self.request_event(
            &self.writer_secret,
            "card-association-request",
            serde_json::json!({ "otc": otc }).to_string(),
        );
        lifecycle::associate(&self.state, &p, &c, &event, self.now())
            .await
            .unwrap();
    }

    /// Drive Activate for a holder key against an associated otc.
    pub async fn activate(&self, holder: &SecretKey, otc: &str) -> Card {
        let content = serde_json::json!({
            "otc": otc,
            "delegation": self.delegation_json(holder),
        });
        let event = self.request_event(holder, topics::CARD_ACTIVATION_REQUEST, content.to_string());
        let (_response, card) = lifecycle::activate(&self.state, &event, self.now())
            .await
            .unwrap();
        card
    }

    /// Initialize, associate, and activate one card for a fresh holder.
    pub async fn activate_default_card(&self) -> TestHolder {
        self.provision_card(DEFAULT_CID, DEFAULT_OTC, &[0x21; 32]).await
    }

    /// Full provisioning flow for an arbitrary cid/otc/holder key.
    pub async fn provision_card(&self, cid: &str, otc: &str, holder_seed: &[u8; 32]) -> TestHolder {
        let secret = SecretKey::from_slice(holder_seed).unwrap();
        let ntag = self.initialize_ntag(cid, 0).await;
        self.associate(&ntag, otc).await;
        let card = self.activate(&secret, otc).await;
        TestHolder {
            pubkey: public_key_for(&secret),
            secret,
            ntag,
            card,
        }
    }

    pub async fn only_card(&self, holder: &PublicKey) -> Card {
        let cards = self.state.store.cards_by_holder(holder).await.unwrap();
        assert_eq!(cards.len(), 1, "expected exactly one card");
        cards.into_iter().next().unwrap()
    }
}
