//! AP2 spending mandates.
//!
//! A mandate is a signed authorization riding on the request as a base64
//! `X-Mandate` header: it names an owner key, an expiry, a daily USDC cap,
//! and the set of tool ids the agent may call. The gateway never stores
//! mandates; its authority is the EIP-191 signature over the canonical
//! payload, recovered and compared against `owner_pubkey`.
//!
//! Verification runs a fixed check order, each failure short-circuiting:
//! expiry, allowlist, confirmation threshold, daily budget, signature.
//! A passing mandate is `APPROVED`; the verifier records no spend — the
//! pipeline charges only around settlement.

use alloy::hex;
use alloy::primitives::{Address, Signature};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::usd::UsdAmount;
use crate::util::hash::sha256_hex;

/// A 65-byte EIP-191 personal-message signature, hex-encoded on the wire as
/// `0x` plus 130 hex characters.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MandateSignature(pub [u8; 65]);

static SIG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid signature regex"));

impl fmt::Debug for MandateSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MandateSignature(0x{})", hex::encode(self.0))
    }
}

impl Serialize for MandateSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for MandateSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !SIG_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom(
                "signature must be 0x-prefixed and 130 hex chars",
            ));
        }
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| serde::de::Error::custom("invalid hex in signature"))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be exactly 65 bytes"))?;
        Ok(MandateSignature(array))
    }
}

/// A spending mandate as decoded from the `X-Mandate` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mandate {
    pub mandate_id: String,
    pub owner_pubkey: String,
    pub expires_at: DateTime<Utc>,
    pub max_spend_usdc_per_day: UsdAmount,
    pub allowlisted_tool_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_user_confirm_for_price_over: Option<UsdAmount>,
    pub signature: MandateSignature,
}

/// Why a mandate was denied. Each variant maps to one receipt reason code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MandateDenial {
    #[error("mandate expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("tool {0:?} is not allowlisted by the mandate")]
    NotAllowlisted(String),
    #[error("price {price} exceeds confirmation threshold {threshold} and no confirmation header was sent")]
    ConfirmRequired {
        price: UsdAmount,
        threshold: UsdAmount,
    },
    #[error("daily budget exhausted: spent {spent} + price {price} > cap {cap}")]
    BudgetExceeded {
        spent: UsdAmount,
        price: UsdAmount,
        cap: UsdAmount,
    },
    #[error("signature does not recover to owner_pubkey: {0}")]
    InvalidSignature(String),
}

/// Request-side facts the verifier checks the mandate against.
#[derive(Debug, Clone)]
pub struct MandateContext {
    pub tool_id: String,
    pub price: UsdAmount,
    pub spent_today: UsdAmount,
    /// Whether the request carried an explicit user-confirmation header.
    pub user_confirmed: bool,
    pub now: DateTime<Utc>,
}

impl Mandate {
    /// The canonical signing payload.
    ///
    /// Byte-exact canonicalization: newline-joined `key:value` lines in this
    /// fixed order, with `signature` excluded, the owner address lowercased,
    /// `expires_at` rendered as RFC 3339 UTC with whole seconds and a `Z`
    /// suffix, amounts in normalized decimal form, and the allowlist sorted
    /// and comma-joined. Two semantically equal mandates therefore produce
    /// identical payload bytes.
    pub fn signing_payload(&self) -> String {
        let allowlist: Vec<&str> = self
            .allowlisted_tool_ids
            .iter()
            .map(|s| s.as_str())
            .collect();
        let confirm_over = self
            .require_user_confirm_for_price_over
            .map(|a| a.to_string())
            .unwrap_or_default();
        [
            format!("mandate_id:{}", self.mandate_id),
            format!("owner_pubkey:{}", self.owner_pubkey.to_lowercase()),
            format!(
                "expires_at:{}",
                self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            format!("max_spend_usdc_per_day:{}", self.max_spend_usdc_per_day),
            format!("allowlisted_tool_ids:{}", allowlist.join(",")),
            format!("require_user_confirm_for_price_over:{confirm_over}"),
        ]
        .join("\n")
    }

    /// SHA-256 digest of the canonical payload, reported in receipts.
    pub fn mandate_hash(&self) -> String {
        sha256_hex(self.signing_payload().as_bytes())
    }

    /// Run the ordered mandate checks against the request context.
    pub fn verify(&self, ctx: &MandateContext) -> Result<(), MandateDenial> {
        if self.expires_at <= ctx.now {
            return Err(MandateDenial::Expired(self.expires_at));
        }
        if !self.allowlisted_tool_ids.contains(&ctx.tool_id) {
            return Err(MandateDenial::NotAllowlisted(ctx.tool_id.clone()));
        }
        if let Some(threshold) = self.require_user_confirm_for_price_over
            && ctx.price > threshold
            && !ctx.user_confirmed
        {
            return Err(MandateDenial::ConfirmRequired {
                price: ctx.price,
                threshold,
            });
        }
        if ctx.spent_today + ctx.price > self.max_spend_usdc_per_day {
            return Err(MandateDenial::BudgetExceeded {
                spent: ctx.spent_today,
                price: ctx.price,
                cap: self.max_spend_usdc_per_day,
            });
        }
        self.verify_signature()
    }

    /// Recover the signer from the EIP-191 personal-message signature over
    /// the canonical payload and compare it to `owner_pubkey`.
    fn verify_signature(&self) -> Result<(), MandateDenial> {
        let owner = Address::from_str(&self.owner_pubkey)
            .map_err(|e| MandateDenial::InvalidSignature(format!("bad owner_pubkey: {e}")))?;
        let signature = Signature::from_raw_array(&self.signature.0)
            .map_err(|e| MandateDenial::InvalidSignature(format!("malformed signature: {e}")))?;
        let recovered = signature
            .recover_address_from_msg(self.signing_payload().as_bytes())
            .map_err(|e| MandateDenial::InvalidSignature(format!("recovery failed: {e}")))?;
        if recovered == owner {
            Ok(())
        } else {
            Err(MandateDenial::InvalidSignature(format!(
                "recovered {recovered}, expected {owner}"
            )))
        }
    }
}
