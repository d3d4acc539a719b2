use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Error returned when an identifier cannot be parsed from text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifierParseError {
    kind: &'static str,
    value: String,
}

impl IdentifierParseError {
    fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for IdentifierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} identifier '{}'", self.kind, self.value)
    }
}

impl std::error::Error for IdentifierParseError {}

macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $canon:path) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Borrow the canonical textual form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdentifierParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let canonical = $canon(s);
                if canonical.is_empty() {
                    return Err(IdentifierParseError::new($kind, s));
                }
                Ok(Self(Arc::from(canonical)))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(Arc::from($canon(value)))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from(value.as_str())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(D::Error::custom)
            }
        }
    };
}

string_identifier!(
    /// Venue identifier, normalized to lowercase (`binance`, `bybit_linear`, ...).
    ExchangeId,
    "exchange",
    canonicalize_exchange
);

string_identifier!(
    /// Asset code such as `USDT` or `BTC`, normalized to uppercase.
    AssetId,
    "asset",
    canonicalize_code
);

string_identifier!(
    /// Instrument code such as `BTCUSDT`, normalized to uppercase.
    Symbol,
    "symbol",
    canonicalize_code
);

fn canonicalize_exchange(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn canonicalize_code(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}
