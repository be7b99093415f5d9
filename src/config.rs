//! Process-wide configuration, loaded once at startup and immutable after.
//!
//! Everything comes from the environment (`.env` honored); `HOST`/`PORT`
//! may also be given on the command line. Key material is parsed into typed
//! wrappers here so the rest of the module never touches raw hex.

use clap::Parser;
use secp256k1::SecretKey;
use std::net::IpAddr;

use crate::nostr::event::public_key_for;
use crate::store::model::NewLimit;
use crate::types::{AesKey, PublicKey};

/// CLI arguments for the card module server.
#[derive(Parser, Debug)]
#[command(name = "lawallet-card")]
#[command(about = "LaWallet card module HTTP server")]
pub struct CliArgs {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to bind.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Immutable module configuration.
#[derive(Clone)]
pub struct Config {
    /// Module-wide SUN decryption key (the `k1` every card shares).
    pub server_aes_key: AesKey,
    /// Module signing key for events and NIP-04.
    pub nostr_secret_key: SecretKey,
    /// x-only public key matching [`Config::nostr_secret_key`].
    pub nostr_public_key: PublicKey,
    /// The only authority allowed to initialize and associate NTAGs.
    pub card_writer_pubkey: PublicKey,
    /// Holders whose cards may drive admin resets.
    pub admin_pubkeys: Vec<PublicKey>,
    /// Federation this module answers extended-scan actions for.
    pub federation_id: String,
    /// Public base URL of the LaWallet API (scan callbacks, balances).
    pub api_base_url: String,
    /// Base URL of the external identity provider.
    pub identity_provider_base_url: String,
    /// Ledger module key, first `p` tag of every transfer event.
    pub ledger_pubkey: PublicKey,
    /// BTC gateway key, second `p` tag of LNURL-withdraw transfers.
    pub btc_gateway_pubkey: PublicKey,
    /// Limits attached to every newly activated card.
    pub default_limits: Vec<NewLimit>,
    /// Merchants trusted by default for new holders.
    pub default_trusted_merchants: Vec<PublicKey>,
    /// TTL of scan payment requests, in seconds.
    pub payment_request_expiry_secs: u64,
    /// Seeded card designs (`name`, `description`).
    pub designs: Vec<(String, String)>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_aes_key = parse_var(&lookup, "SERVER_AES_KEY_HEX", |s| {
            s.parse::<AesKey>().map_err(|e| e.to_string())
        })?;
        let nostr_secret_key = parse_var(&lookup, "NOSTR_PRIVATE_KEY", |s| {
            let bytes = hex::decode(s).map_err(|e| e.to_string())?;
            SecretKey::from_slice(&bytes).map_err(|e| e.to_string())
        })?;
        let nostr_public_key = parse_var(&lookup, "NOSTR_PUBLIC_KEY", |s| {
            s.parse::<PublicKey>().map_err(|e| e.to_string())
        })?;
        let derived = public_key_for(&nostr_secret_key);
        if derived != nostr_public_key {
            return Err(ConfigError::Invalid {
                var: "NOSTR_PUBLIC_KEY",
                reason: format!("does not match NOSTR_PRIVATE_KEY (derived {derived})"),
            });
        }
        Ok(Config {
            server_aes_key,
            nostr_secret_key,
            nostr_public_key,
            card_writer_pubkey: parse_var(&lookup, "CARD_WRITER_PUBKEY", |s| {
                s.parse::<PublicKey>().map_err(|e| e.to_string())
            })?,
            admin_pubkeys: parse_var(&lookup, "ADMIN_PUBKEYS", parse_pubkey_list)?,
            federation_id: required(&lookup, "LAWALLET_FEDERATION_ID")?,
            api_base_url: required(&lookup, "LAWALLET_API_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())?,
            identity_provider_base_url: required(&lookup, "IDENTITY_PROVIDER_API_BASE")?,
            ledger_pubkey: parse_var(&lookup, "LEDGER_PUBLIC_KEY", |s| {
                s.parse::<PublicKey>().map_err(|e| e.to_string())
            })?,
            btc_gateway_pubkey: parse_var(&lookup, "BTC_GATEWAY_PUBLIC_KEY", |s| {
                s.parse::<PublicKey>().map_err(|e| e.to_string())
            })?,
            default_limits: parse_var(&lookup, "DEFAULT_LIMITS", parse_limit_list)?,
            default_trusted_merchants: parse_var(
                &lookup,
                "DEFAULT_TRUSTED_MERCHANTS",
                parse_pubkey_list,
            )?,
            payment_request_expiry_secs: parse_var(
                &lookup,
                "PAYMENT_REQUEST_EXPIRY_IN_SECONDS",
                |s| s.parse::<u64>().map_err(|e| e.to_string()),
            )?,
            designs: lookup("CARD_DESIGNS")
                .map(|s| parse_design_list(&s))
                .transpose()
                .map_err(|reason| ConfigError::Invalid {
                    var: "CARD_DESIGNS",
                    reason,
                })?
                .unwrap_or_default(),
        })
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or(ConfigError::Missing(name))
}

fn parse_var<F, T, P>(lookup: &F, name: &'static str, parse: P) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: FnOnce(&str) -> Result<T, String>,
{
    let raw = required(lookup, name)?;
    parse(&raw).map_err(|reason| ConfigError::Invalid { var: name, reason })
}

/// `:`-separated list of 64-char hex keys. Empty input is an empty list.
fn parse_pubkey_list(raw: &str) -> Result<Vec<PublicKey>, String> {
    raw.split(':')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<PublicKey>().map_err(|e| format!("{s:?}: {e}")))
        .collect()
}

/// `name;description;token;amount;delta` entries joined by `:`.
fn parse_limit_list(raw: &str) -> Result<Vec<NewLimit>, String> {
    raw.split(':')
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let fields: Vec<&str> = entry.split(';').collect();
            let [name, description, token, amount, delta] = fields.as_slice() else {
                return Err(format!("{entry:?}: expected 5 `;`-separated fields"));
            };
            let amount: u64 = amount
                .parse()
                .map_err(|_| format!("{entry:?}: amount is not a non-negative integer"))?;
            let delta: u64 = delta
                .parse()
                .map_err(|_| format!("{entry:?}: delta is not a positive integer"))?;
            if delta == 0 {
                return Err(format!("{entry:?}: delta must be positive"));
            }
            Ok(NewLimit {
                name: name.to_string(),
                description: description.to_string(),
                token: token.to_string(),
                amount,
                delta,
            })
        })
        .collect()
}

/// `name;description` entries joined by `:`.
fn parse_design_list(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(':')
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(';') {
            Some((name, description)) if !name.is_empty() => {
                Ok((name.to_string(), description.to_string()))
            }
            _ => Err(format!("{entry:?}: expected name;description")),
        })
        .collect()
}
