//! Value-transfer transactions
//!
//! A transaction moves `amount` from `from_address` to `to_address`. A
//! transaction without a sender is a mining reward and needs no signature;
//! every other transaction must carry a signature by the sender's key over
//! its content hash.

use crate::{crypto, Amount, BlockchainError, Result};
use serde::{Deserialize, Serialize};

/// Amount serialization matching `JSON.stringify` on the original nodes
pub(crate) mod amount_serde {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;

    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

    pub fn serialize<S>(amount: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if !amount.is_finite() {
            // JSON has no NaN or Infinity; stringify writes null
            return serializer.serialize_unit();
        }
        if amount.fract() == 0.0 && amount.abs() <= MAX_SAFE_INTEGER {
            return serializer.serialize_i64(*amount as i64);
        }

        let raw = RawValue::from_string(super::format_amount(*amount)).map_err(S::Error::custom)?;
        raw.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Largest magnitude rendered without an exponent
const PLAIN_DIGITS_LIMIT: i32 = 21;

/// Smallest decimal exponent rendered without an exponent
const PLAIN_FRACTION_LIMIT: i32 = -6;

/// Render an amount with ECMAScript `Number.prototype.toString` rules so
/// content hashes agree byte for byte with the original nodes.
pub fn format_amount(amount: Amount) -> String {
    if amount == 0.0 {
        // also covers -0
        return "0".to_string();
    }
    if amount.is_nan() {
        return "NaN".to_string();
    }
    if amount.is_infinite() {
        let rendered = if amount > 0.0 { "Infinity" } else { "-Infinity" };
        return rendered.to_string();
    }
    if amount < 0.0 {
        return format!("-{}", format_amount(-amount));
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "1.5e-7"
    let scientific = format!("{:e}", amount);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let exponent: i32 = exponent.parse().unwrap_or(0);

    let k = digits.len() as i32;
    let n = exponent + 1;

    if k <= n && n <= PLAIN_DIGITS_LIMIT {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= PLAIN_DIGITS_LIMIT {
        let (int_part, frac_part) = digits.split_at(n as usize);
        format!("{}.{}", int_part, frac_part)
    } else if PLAIN_FRACTION_LIMIT < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let sign = if n - 1 < 0 { '-' } else { '+' };
        let (lead, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{}e{}{}", lead, sign, (n - 1).abs())
        } else {
            format!("{}.{}e{}{}", lead, rest, sign, (n - 1).abs())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Sender public key, `None` for a mining reward
    pub from_address: Option<String>,
    pub to_address: String,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Transaction {
    /// Build an unsigned transfer. Nothing is validated here; admission
    /// checks happen when the ledger accepts it.
    pub fn new(from_address: impl Into<String>, to_address: impl Into<String>, amount: Amount) -> Self {
        Self {
            from_address: Some(from_address.into()),
            to_address: to_address.into(),
            amount,
            signature: None,
        }
    }

    /// Build a reward transaction credited by the system
    pub fn reward(to_address: impl Into<String>, amount: Amount) -> Self {
        Self {
            from_address: None,
            to_address: to_address.into(),
            amount,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn is_reward(&self) -> bool {
        self.from_address.is_none()
    }

    /// Content hash over sender, recipient and amount (no delimiter)
    pub fn compute_hash(&self) -> String {
        let from = self.from_address.as_deref().unwrap_or("null");
        crypto::sha256_hex(&format!(
            "{}{}{}",
            from,
            self.to_address,
            format_amount(self.amount)
        ))
    }

    /// Rewards are always valid; transfers need a signature that verifies
    /// against the sender key over `compute_hash()`.
    pub fn is_valid(&self) -> bool {
        let Some(from) = self.from_address.as_deref() else {
            return true;
        };
        match self.signature.as_deref() {
            Some(signature) if !signature.is_empty() => {
                crypto::verify(from, signature, &self.compute_hash())
            }
            _ => false,
        }
    }

    /// Whether this transaction moves funds out of or into `address`
    pub fn involves(&self, address: &str) -> bool {
        self.from_address.as_deref() == Some(address) || self.to_address == address
    }
}

/// Incoming submission as received at the system boundary.
///
/// Every field is optional so that a missing address can be reported as
/// `InvalidTransaction` instead of a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl TryFrom<TransactionRequest> for Transaction {
    type Error = BlockchainError;

    fn try_from(request: TransactionRequest) -> Result<Self> {
        let from_address = non_empty(request.from_address).ok_or_else(|| {
            BlockchainError::InvalidTransaction("Transaction must include from and to address".to_string())
        })?;
        let to_address = non_empty(request.to_address).ok_or_else(|| {
            BlockchainError::InvalidTransaction("Transaction must include from and to address".to_string())
        })?;
        let amount = request.amount.ok_or_else(|| {
            BlockchainError::InvalidTransaction("Transaction must include an amount".to_string())
        })?;

        Ok(Transaction {
            from_address: Some(from_address),
            to_address,
            amount,
            signature: request.signature,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn test_reward_is_valid_without_signature() {
        let tx = Transaction::reward("miner", 50.0);
        assert!(tx.is_reward());
        assert!(tx.is_valid());

        let tx = tx.with_signature("garbage");
        assert!(tx.is_valid());
    }

    #[test]
    fn test_unsigned_transfer_is_invalid() {
        let tx = Transaction::new("alice", "bob", 5.0);
        assert!(!tx.is_valid());
        assert!(!tx.clone().with_signature("").is_valid());
    }

    #[test]
    fn test_signed_transfer_round_trip() {
        let wallet = Wallet::new();
        let mut tx = Transaction::new(wallet.public_key(), "bob", 5.0);
        wallet.sign_transaction(&mut tx).unwrap();
        assert!(tx.is_valid());

        tx.amount = 500.0;
        assert!(!tx.is_valid(), "tampered amount must break the signature");
    }

    #[test]
    fn test_hash_renders_amount_like_original_nodes() {
        let tx = Transaction::new("a", "b", 5.0);
        assert_eq!(tx.compute_hash(), crypto::sha256_hex("ab5"));

        let tx = Transaction::new("a", "b", 0.5);
        assert_eq!(tx.compute_hash(), crypto::sha256_hex("ab0.5"));

        let reward = Transaction::reward("m", 50.0);
        assert_eq!(reward.compute_hash(), crypto::sha256_hex("nullm50"));
    }

    #[test]
    fn test_format_amount_edge_values() {
        assert_eq!(format_amount(-0.0), "0");
        assert_eq!(format_amount(-3.0), "-3");
        assert_eq!(format_amount(f64::NAN), "NaN");
        assert_eq!(format_amount(f64::INFINITY), "Infinity");
        assert_eq!(format_amount(1.25), "1.25");
    }

    #[test]
    fn test_format_amount_exponent_thresholds() {
        assert_eq!(format_amount(1e21), "1e+21");
        assert_eq!(format_amount(-1e21), "-1e+21");
        assert_eq!(format_amount(1.5e21), "1.5e+21");
        assert_eq!(format_amount(123456789012345680000.0), "123456789012345680000");
        assert_eq!(format_amount(1.5e-7), "1.5e-7");
        assert_eq!(format_amount(1e-7), "1e-7");
        assert_eq!(format_amount(123e-20), "1.23e-18");
        assert_eq!(format_amount(0.000001), "0.000001");
        assert_eq!(format_amount(0.0000015), "0.0000015");
        assert_eq!(format_amount(9007199254740993.0), "9007199254740992");
        assert_eq!(format_amount(0.1 + 0.2), "0.30000000000000004");
    }

    #[test]
    fn test_hash_uses_exponent_rendering() {
        let tx = Transaction::new("a", "b", 1e21);
        assert_eq!(tx.compute_hash(), crypto::sha256_hex("ab1e+21"));

        let tx = Transaction::new("a", "b", 1e-7);
        assert_eq!(tx.compute_hash(), crypto::sha256_hex("ab1e-7"));
    }

    #[test]
    fn test_wire_format_matches_stringify_for_extreme_amounts() {
        let tx = Transaction::new("a", "b", 1e21);
        let json = serde_json::to_string(&tx).unwrap();
        assert_eq!(json, r#"{"fromAddress":"a","toAddress":"b","amount":1e+21}"#);
        assert_eq!(serde_json::from_str::<Transaction>(&json).unwrap(), tx);

        let tx = Transaction::new("a", "b", 1.5e-7);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains(r#""amount":1.5e-7"#));
        assert_eq!(serde_json::from_str::<Transaction>(&json).unwrap(), tx);

        let tx = Transaction::new("a", "b", f64::NAN);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains(r#""amount":null"#));
        assert!(serde_json::from_str::<Transaction>(&json).unwrap().amount.is_nan());
    }

    #[test]
    fn test_wire_format() {
        let tx = Transaction::reward("miner", 50.0);
        assert_eq!(
            serde_json::to_string(&tx).unwrap(),
            r#"{"fromAddress":null,"toAddress":"miner","amount":50}"#
        );

        let tx = Transaction::new("a", "b", 2.5).with_signature("3044");
        assert_eq!(
            serde_json::to_string(&tx).unwrap(),
            r#"{"fromAddress":"a","toAddress":"b","amount":2.5,"signature":"3044"}"#
        );

        let parsed: Transaction =
            serde_json::from_str(r#"{"fromAddress":"a","toAddress":"b","amount":7}"#).unwrap();
        assert_eq!(parsed, Transaction::new("a", "b", 7.0));
    }

    #[test]
    fn test_request_requires_both_addresses() {
        let request = TransactionRequest {
            from_address: Some("alice".to_string()),
            to_address: None,
            amount: Some(1.0),
            signature: None,
        };
        let err = Transaction::try_from(request).unwrap_err();
        assert_eq!(err.code(), "invalid_transaction");

        let request = TransactionRequest {
            from_address: Some(String::new()),
            to_address: Some("bob".to_string()),
            amount: Some(1.0),
            signature: None,
        };
        assert!(Transaction::try_from(request).is_err());
    }

    #[test]
    fn test_request_preserves_signature() {
        let request: TransactionRequest = serde_json::from_str(
            r#"{"fromAddress":"a","toAddress":"b","amount":3,"signature":"abcd"}"#,
        )
        .unwrap();
        let tx = Transaction::try_from(request).unwrap();
        assert_eq!(tx.signature.as_deref(), Some("abcd"));
        assert_eq!(tx.amount, 3.0);
    }
}
