//! Payment provider abstraction: create an invoice, verify a payment,
//! query invoice status. Backed by a mock in development and an LND REST
//! node in production; the factory refuses the mock outside development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::{Config, Environment};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned an unexpected response: {0}")]
    BadResponse(String),
    #[error("invoice not found")]
    InvoiceNotFound,
    #[error("provider is not configured: {0}")]
    NotConfigured(String),
}

/// Authoritative invoice status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceState {
    Pending,
    Paid { settled_at: Option<DateTime<Utc>> },
    Expired,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ProviderInvoice {
    pub payment_hash: String,
    pub payment_request: String,
    pub provider_invoice_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
    ) -> Result<ProviderInvoice, ProviderError>;

    async fn verify_payment(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<InvoiceState, ProviderError>;

    async fn get_invoice_status(&self, payment_hash: &str)
    -> Result<InvoiceState, ProviderError>;
}

/// Build the configured provider. Mock outside development is a
/// configuration error, not a silent fallback.
pub fn from_config(config: &Config) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
    match config.payment_provider.as_str() {
        "mock" => {
            if config.environment == Environment::Production {
                return Err(ProviderError::NotConfigured(
                    "mock payment provider is not allowed in production".to_string(),
                ));
            }
            Ok(Arc::new(MockPaymentProvider::new()))
        }
        "lnd" => {
            let rest_url = config.lnd_rest_url.clone().ok_or_else(|| {
                ProviderError::NotConfigured("WC_LND_REST_URL is required for lnd".to_string())
            })?;
            let macaroon_hex = config.lnd_macaroon_hex.clone().ok_or_else(|| {
                ProviderError::NotConfigured("WC_LND_MACAROON_HEX is required for lnd".to_string())
            })?;
            Ok(Arc::new(LndRestProvider::new(
                rest_url,
                macaroon_hex,
                Duration::from_millis(config.provider_timeout_ms),
            )?))
        }
        other => Err(ProviderError::NotConfigured(format!(
            "unknown payment provider '{other}'"
        ))),
    }
}

#[derive(Debug, Clone)]
struct MockInvoice {
    preimage_hex: String,
    state: InvoiceState,
}

/// Development/test provider. Invoices settle when `settle` is called or
/// when `verify_payment` is presented with the matching preimage.
#[derive(Default)]
pub struct MockPaymentProvider {
    invoices: Mutex<HashMap<String, MockInvoice>>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: flip an invoice to paid, returning the preimage.
    pub async fn settle(&self, payment_hash: &str) -> Option<String> {
        let mut invoices = self.invoices.lock().await;
        let invoice = invoices.get_mut(payment_hash)?;
        invoice.state = InvoiceState::Paid {
            settled_at: Some(Utc::now()),
        };
        Some(invoice.preimage_hex.clone())
    }

    /// Test hook: expire an invoice.
    pub async fn expire(&self, payment_hash: &str) -> bool {
        let mut invoices = self.invoices.lock().await;
        match invoices.get_mut(payment_hash) {
            Some(invoice) => {
                invoice.state = InvoiceState::Expired;
                true
            }
            None => false,
        }
    }

    /// Test hook: the preimage for a created invoice.
    pub async fn preimage_of(&self, payment_hash: &str) -> Option<String> {
        let invoices = self.invoices.lock().await;
        invoices
            .get(payment_hash)
            .map(|invoice| invoice.preimage_hex.clone())
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_invoice(
        &self,
        amount_sats: i64,
        _memo: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let mut preimage = [0u8; 32];
        rand::rng().fill_bytes(&mut preimage);
        let payment_hash = hex::encode(Sha256::digest(preimage));
        let preimage_hex = hex::encode(preimage);
        let payment_request = format!(
            "lnbcmock{amount_sats}s1{}",
            &payment_hash[..16.min(payment_hash.len())]
        );

        let mut invoices = self.invoices.lock().await;
        invoices.insert(
            payment_hash.clone(),
            MockInvoice {
                preimage_hex,
                state: InvoiceState::Pending,
            },
        );
        Ok(ProviderInvoice {
            payment_hash,
            payment_request,
            provider_invoice_id: None,
            expires_at: None,
        })
    }

    async fn verify_payment(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<InvoiceState, ProviderError> {
        let mut invoices = self.invoices.lock().await;
        let invoice = invoices
            .get_mut(payment_hash)
            .ok_or(ProviderError::InvoiceNotFound)?;
        if invoice.state == InvoiceState::Pending {
            if let Some(preimage) = preimage {
                if wordclaw_l402::verify_preimage(payment_hash, preimage) {
                    invoice.state = InvoiceState::Paid {
                        settled_at: Some(Utc::now()),
                    };
                }
            }
        }
        Ok(invoice.state.clone())
    }

    async fn get_invoice_status(
        &self,
        payment_hash: &str,
    ) -> Result<InvoiceState, ProviderError> {
        let invoices = self.invoices.lock().await;
        let invoice = invoices
            .get(payment_hash)
            .ok_or(ProviderError::InvoiceNotFound)?;
        Ok(invoice.state.clone())
    }
}

/// LND REST backend (`/v1/invoices`, `/v1/invoice/{hash}`).
pub struct LndRestProvider {
    base_url: String,
    macaroon_hex: String,
    http: reqwest::Client,
}

impl LndRestProvider {
    pub fn new(
        base_url: String,
        macaroon_hex: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ProviderError::Request(error.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            macaroon_hex,
            http,
        })
    }

    fn state_from_lnd(value: &serde_json::Value) -> InvoiceState {
        let state = value.get("state").and_then(|s| s.as_str()).unwrap_or("");
        match state {
            "SETTLED" => {
                let settled_at = value
                    .get("settle_date")
                    .and_then(|d| d.as_str())
                    .and_then(|d| d.parse::<i64>().ok())
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
                InvoiceState::Paid { settled_at }
            }
            "CANCELED" => InvoiceState::Expired,
            _ => InvoiceState::Pending,
        }
    }
}

#[async_trait]
impl PaymentProvider for LndRestProvider {
    fn name(&self) -> &'static str {
        "lnd"
    }

    async fn create_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
    ) -> Result<ProviderInvoice, ProviderError> {
        let response = self
            .http
            .post(format!("{}/v1/invoices", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(&serde_json::json!({ "value": amount_sats, "memo": memo }))
            .send()
            .await
            .map_err(|error| ProviderError::Request(error.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::BadResponse(format!(
                "invoice creation returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| ProviderError::BadResponse(error.to_string()))?;

        let r_hash_b64 = body
            .get("r_hash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| ProviderError::BadResponse("missing r_hash".to_string()))?;
        let payment_hash = {
            use base64::Engine as _;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(r_hash_b64)
                .map_err(|error| ProviderError::BadResponse(error.to_string()))?;
            hex::encode(bytes)
        };
        let payment_request = body
            .get("payment_request")
            .and_then(|r| r.as_str())
            .ok_or_else(|| ProviderError::BadResponse("missing payment_request".to_string()))?
            .to_string();

        Ok(ProviderInvoice {
            payment_hash,
            payment_request,
            provider_invoice_id: body
                .get("add_index")
                .and_then(|index| index.as_str())
                .map(ToString::to_string),
            expires_at: None,
        })
    }

    async fn verify_payment(
        &self,
        payment_hash: &str,
        preimage: Option<&str>,
    ) -> Result<InvoiceState, ProviderError> {
        // The preimage is proof on our side; the node remains authoritative
        // for settlement status.
        if let Some(preimage) = preimage {
            if !wordclaw_l402::verify_preimage(payment_hash, preimage) {
                return Ok(InvoiceState::Failed {
                    reason: "preimage does not match payment hash".to_string(),
                });
            }
        }
        self.get_invoice_status(payment_hash).await
    }

    async fn get_invoice_status(
        &self,
        payment_hash: &str,
    ) -> Result<InvoiceState, ProviderError> {
        let response = self
            .http
            .get(format!("{}/v1/invoice/{payment_hash}", self.base_url))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .send()
            .await
            .map_err(|error| ProviderError::Request(error.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::InvoiceNotFound);
        }
        if !response.status().is_success() {
            return Err(ProviderError::BadResponse(format!(
                "invoice lookup returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| ProviderError::BadResponse(error.to_string()))?;
        Ok(Self::state_from_lnd(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_invoice_settles_with_matching_preimage() {
        let provider = MockPaymentProvider::new();
        let invoice = provider.create_invoice(500, "offer").await.expect("invoice");
        assert_eq!(
            provider
                .get_invoice_status(&invoice.payment_hash)
                .await
                .expect("status"),
            InvoiceState::Pending
        );

        let preimage = provider
            .preimage_of(&invoice.payment_hash)
            .await
            .expect("preimage");
        let state = provider
            .verify_payment(&invoice.payment_hash, Some(&preimage))
            .await
            .expect("verify");
        assert!(matches!(state, InvoiceState::Paid { .. }));
    }

    #[tokio::test]
    async fn mock_rejects_wrong_preimage() {
        let provider = MockPaymentProvider::new();
        let invoice = provider.create_invoice(100, "x").await.expect("invoice");
        let state = provider
            .verify_payment(&invoice.payment_hash, Some(&"0".repeat(64)))
            .await
            .expect("verify");
        assert_eq!(state, InvoiceState::Pending);
    }

    #[tokio::test]
    async fn mock_factory_is_rejected_in_production() {
        let mut config = Config::for_tests();
        config.environment = Environment::Production;
        config.payment_provider = "mock".to_string();
        assert!(matches!(
            from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn lnd_state_mapping_covers_settled_and_canceled() {
        let settled = serde_json::json!({"state": "SETTLED", "settle_date": "1700000000"});
        assert!(matches!(
            LndRestProvider::state_from_lnd(&settled),
            InvoiceState::Paid { settled_at: Some(_) }
        ));
        let canceled = serde_json::json!({"state": "CANCELED"});
        assert_eq!(
            LndRestProvider::state_from_lnd(&canceled),
            InvoiceState::Expired
        );
        let open = serde_json::json!({"state": "OPEN"});
        assert_eq!(LndRestProvider::state_from_lnd(&open), InvoiceState::Pending);
    }
}
