//! Validated contact values carried by notification payloads.
//!
//! Value objects have **no identity**: two values with the same contents are
//! equal. They are validated once at construction so producers reject bad
//! recipients before anything is enqueued.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker trait for value objects.
pub trait ValueObject: Clone + PartialEq + fmt::Debug {}

/// A syntactically plausible e-mail address (`local@domain.tld`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let value = raw.as_ref().trim();
        let Some((local, domain)) = value.split_once('@') else {
            return Err(DomainError::validation(format!("email `{value}` is missing '@'")));
        };
        if local.is_empty() || domain.contains('@') {
            return Err(DomainError::validation(format!("email `{value}` is malformed")));
        }
        let has_dot = domain
            .split('.')
            .filter(|part| !part.is_empty())
            .count()
            >= 2;
        if !has_dot || domain.starts_with('.') || domain.ends_with('.') {
            return Err(DomainError::validation(format!(
                "email `{value}` has an invalid domain"
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A phone number normalized to digits with an optional leading `+`.
///
/// Separators (spaces, dashes, dots, parentheses) are stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    const MIN_DIGITS: usize = 8;
    const MAX_DIGITS: usize = 15;

    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let raw = raw.as_ref().trim();
        let (plus, rest) = match raw.strip_prefix('+') {
            Some(rest) => ("+", rest),
            None => ("", raw),
        };

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '.' | '(' | ')' => {}
                other => {
                    return Err(DomainError::validation(format!(
                        "phone `{raw}` contains invalid character `{other}`"
                    )));
                }
            }
        }

        if !(Self::MIN_DIGITS..=Self::MAX_DIGITS).contains(&digits.len()) {
            return Err(DomainError::validation(format!(
                "phone `{raw}` must have between {} and {} digits",
                Self::MIN_DIGITS,
                Self::MAX_DIGITS
            )));
        }

        Ok(Self(format!("{plus}{digits}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_string_value {
    ($t:ty) => {
        impl ValueObject for $t {}

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_value!(EmailAddress);
impl_string_value!(PhoneNumber);
