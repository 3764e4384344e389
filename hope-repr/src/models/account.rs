//! Financial account payloads
//!
//! Stored as a `kind` column plus a flat JSON object of fields. Each kind has
//! a fixed set of required and optional fields listed in [`CAPABILITIES`];
//! [`AccountDetails::from_fields`] is the only way stored data becomes a typed
//! value, so every account that is copied or merged has been validated.

use hope_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    BankTransfer,
    MobileMoney,
    DigitalWallet,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::BankTransfer => "bank_transfer",
            AccountKind::MobileMoney => "mobile_money",
            AccountKind::DigitalWallet => "digital_wallet",
        }
    }

    pub fn capability(&self) -> &'static Capability {
        // CAPABILITIES has one entry per kind, in declaration order
        match self {
            AccountKind::BankTransfer => &CAPABILITIES[0],
            AccountKind::MobileMoney => &CAPABILITIES[1],
            AccountKind::DigitalWallet => &CAPABILITIES[2],
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bank_transfer" => Ok(AccountKind::BankTransfer),
            "mobile_money" => Ok(AccountKind::MobileMoney),
            "digital_wallet" => Ok(AccountKind::DigitalWallet),
            other => Err(Error::InvalidInput(format!("Unknown account kind: {}", other))),
        }
    }
}

/// Fields a delivery mechanism needs from an account
#[derive(Debug)]
pub struct Capability {
    pub kind: AccountKind,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

pub static CAPABILITIES: [Capability; 3] = [
    Capability {
        kind: AccountKind::BankTransfer,
        required: &["bank_name", "account_number", "account_holder_name"],
        optional: &["bank_branch_name", "swift_code", "iban"],
    },
    Capability {
        kind: AccountKind::MobileMoney,
        required: &["provider", "phone_number"],
        optional: &["account_holder_name"],
    },
    Capability {
        kind: AccountKind::DigitalWallet,
        required: &["wallet_provider", "wallet_address"],
        optional: &["network"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountDetails {
    BankTransfer {
        bank_name: String,
        account_number: String,
        account_holder_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bank_branch_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        swift_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iban: Option<String>,
    },
    MobileMoney {
        provider: String,
        phone_number: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_holder_name: Option<String>,
    },
    DigitalWallet {
        wallet_provider: String,
        wallet_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network: Option<String>,
    },
}

impl AccountDetails {
    pub fn kind(&self) -> AccountKind {
        match self {
            AccountDetails::BankTransfer { .. } => AccountKind::BankTransfer,
            AccountDetails::MobileMoney { .. } => AccountKind::MobileMoney,
            AccountDetails::DigitalWallet { .. } => AccountKind::DigitalWallet,
        }
    }

    /// Validate stored fields against the capability table and build the
    /// typed value.
    ///
    /// Rejects non-object payloads, missing or blank required fields,
    /// non-string values and fields the kind does not know.
    pub fn from_fields(kind: AccountKind, data: &Value) -> Result<Self> {
        let fields = data
            .as_object()
            .ok_or_else(|| Error::InvalidInput(format!("{} account data is not an object", kind)))?;
        let capability = kind.capability();

        for name in capability.required {
            match fields.get(*name) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) | None | Some(Value::Null) => {
                    return Err(Error::InvalidInput(format!(
                        "{} account is missing '{}'",
                        kind, name
                    )));
                }
                Some(_) => {
                    return Err(Error::InvalidInput(format!(
                        "{} account field '{}' must be text",
                        kind, name
                    )));
                }
            }
        }

        let mut tagged = Map::with_capacity(fields.len() + 1);
        for (name, value) in fields {
            if !capability.required.contains(&name.as_str())
                && !capability.optional.contains(&name.as_str())
            {
                return Err(Error::InvalidInput(format!(
                    "{} account has unsupported field '{}'",
                    kind, name
                )));
            }
            if value.is_null() {
                continue;
            }
            if !value.is_string() {
                return Err(Error::InvalidInput(format!(
                    "{} account field '{}' must be text",
                    kind, name
                )));
            }
            tagged.insert(name.clone(), value.clone());
        }
        tagged.insert("kind".to_string(), Value::String(kind.as_str().to_string()));

        serde_json::from_value(Value::Object(tagged))
            .map_err(|e| Error::InvalidInput(format!("{} account data rejected: {}", kind, e)))
    }

    /// Flat field object for storage, without the `kind` tag
    pub fn to_fields(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("Serialize account failed: {}", e)))?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("kind");
        }
        Ok(value)
    }
}
