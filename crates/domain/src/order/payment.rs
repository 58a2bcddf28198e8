//! Payment information attached to a paid order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{Money, MoneyError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when building or validating [`PaymentInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentInfoError {
    #[error("Unknown payment method: {0}")]
    UnknownMethod(String),

    #[error("Unknown payment channel: {0}")]
    UnknownChannel(String),

    /// The paid amount must be greater than zero.
    #[error("Invalid payment amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: Money },

    /// The payment provider's trade reference is missing.
    #[error("Trade number is required")]
    MissingTradeNo,

    #[error("Invalid payment amount: {0}")]
    Money(#[from] MoneyError),
}

/// How the customer paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Alipay,
    Wechat,
    Bank,
    Balance,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Alipay => "alipay",
            PaymentMethod::Wechat => "wechat",
            PaymentMethod::Bank => "bank",
            PaymentMethod::Balance => "balance",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = PaymentInfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alipay" => Ok(PaymentMethod::Alipay),
            "wechat" => Ok(PaymentMethod::Wechat),
            "bank" => Ok(PaymentMethod::Bank),
            "balance" => Ok(PaymentMethod::Balance),
            _ => Err(PaymentInfoError::UnknownMethod(s.to_string())),
        }
    }
}

/// Where the payment was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentChannel {
    App,
    H5,
    Web,
    QrCode,
    Counter,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::App => "app",
            PaymentChannel::H5 => "h5",
            PaymentChannel::Web => "web",
            PaymentChannel::QrCode => "qrcode",
            PaymentChannel::Counter => "counter",
        }
    }
}

impl std::fmt::Display for PaymentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentChannel {
    type Err = PaymentInfoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(PaymentChannel::App),
            "h5" => Ok(PaymentChannel::H5),
            "web" => Ok(PaymentChannel::Web),
            "qrcode" => Ok(PaymentChannel::QrCode),
            "counter" => Ok(PaymentChannel::Counter),
            _ => Err(PaymentInfoError::UnknownChannel(s.to_string())),
        }
    }
}

/// Record of an accepted payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub amount: Money,
    pub method: PaymentMethod,
    pub channel: PaymentChannel,

    /// Reference assigned by the payment provider.
    pub trade_no: String,

    pub payment_time: DateTime<Utc>,

    /// Provider specific details (e.g. payer account, bank name).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl PaymentInfo {
    /// Creates payment info stamped with the current time.
    pub fn new(
        amount: Money,
        method: PaymentMethod,
        channel: PaymentChannel,
        trade_no: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            method,
            channel,
            trade_no: trade_no.into(),
            payment_time: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_payment_time(mut self, payment_time: DateTime<Utc>) -> Self {
        self.payment_time = payment_time;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Checks the amount is positive and the trade number is present.
    pub fn validate(&self) -> Result<(), PaymentInfoError> {
        self.amount.validate()?;
        if !self.amount.is_positive() {
            return Err(PaymentInfoError::InvalidAmount {
                amount: self.amount.clone(),
            });
        }
        if self.trade_no.trim().is_empty() {
            return Err(PaymentInfoError::MissingTradeNo);
        }
        Ok(())
    }
}
