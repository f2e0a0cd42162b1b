#![forbid(unsafe_code)]

use anyhow::Result;
use campaign_engine_domain::{hash_bytes, CampaignId, LeadId};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// One outbound delivery attempt. The idempotency key identifies the
/// logical send; the remaining fields are the message addressing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SendRequest {
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub email: String,
    pub channel: String,
    pub message_id: String,
    pub step_index: u32,
    pub idempotency_key: String,
}

/// Successful delivery result. `proof` is present when the channel
/// produced a verifiable proof-of-send artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_reference: String,
    pub proof: Option<String>,
}

/// Delivery channel seam. An `Err` is a failed attempt the caller may
/// retry; the sender itself never mutates campaign state.
pub trait SendCapability {
    fn channel_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn send(&self, request: &SendRequest) -> Result<SendReceipt>;
}

/// Deterministic in-process sender for tests and dry runs: the receipt is
/// a pure function of the request, so replays produce identical output.
#[derive(Debug, Clone)]
pub struct MockSender {
    adapter_version: String,
    with_proof: bool,
}

impl Default for MockSender {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
            with_proof: false,
        }
    }
}

impl MockSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Same deterministic sender, but receipts carry a proof artifact.
    #[must_use]
    pub fn with_proof() -> Self {
        Self {
            with_proof: true,
            ..Self::default()
        }
    }

    fn deterministic_token(&self, request: &SendRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.idempotency_key.as_bytes());
        hasher.update(request.channel.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl SendCapability for MockSender {
    fn channel_name(&self) -> &'static str {
        "mock"
    }

    fn send(&self, request: &SendRequest) -> Result<SendReceipt> {
        let token = self.deterministic_token(request);
        let provider_reference = format!(
            "mock:{}:{}",
            request.message_id,
            token.chars().take(16).collect::<String>()
        );
        let proof = self
            .with_proof
            .then(|| hash_bytes(format!("proof:{token}").as_bytes()));
        Ok(SendReceipt {
            provider_reference,
            proof,
        })
    }
}

/// HTTP delivery adapter: POSTs the send request as JSON to a configured
/// gateway and reads the provider reference out of the response body.
#[derive(Debug, Clone)]
pub struct HttpJsonSender {
    config: HttpSenderConfig,
}

impl HttpJsonSender {
    #[allow(clippy::missing_errors_doc)]
    pub fn from_params(params: &Value) -> Result<Self> {
        Ok(Self {
            config: HttpSenderConfig::from_params(params)?,
        })
    }
}

impl SendCapability for HttpJsonSender {
    fn channel_name(&self) -> &'static str {
        "http_json"
    }

    fn send(&self, request: &SendRequest) -> Result<SendReceipt> {
        let outbound = json!({
            "idempotency_key": request.idempotency_key,
            "campaign_id": request.campaign_id.to_string(),
            "lead_id": request.lead_id.to_string(),
            "to": request.email,
            "channel": request.channel,
            "message_id": request.message_id,
            "step_index": request.step_index,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json")
            .set("idempotency-key", &request.idempotency_key);
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow::anyhow!("send gateway returned http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow::anyhow!("send gateway transport failure: {err}"));
            }
        };

        let provider_reference = body
            .get("reference")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("http_json:{}", request.idempotency_key));
        let proof = body
            .get("proof")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(SendReceipt {
            provider_reference,
            proof,
        })
    }
}

#[derive(Debug, Clone)]
struct HttpSenderConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpSenderConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("http_json sender requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(30_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    anyhow::anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token = if let Some(env_name) =
            params.get("auth_bearer_env").and_then(Value::as_str)
        {
            Some(std::env::var(env_name).map_err(|_| {
                anyhow::anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
            })?)
        } else {
            None
        };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpJsonSender, MockSender, SendCapability, SendRequest};
    use campaign_engine_domain::{idempotency_key, CampaignId, LeadId};
    use serde_json::json;

    fn fixture_request() -> SendRequest {
        let campaign_id = CampaignId::new();
        let lead_id = LeadId::new();
        SendRequest {
            campaign_id,
            lead_id,
            email: "ada@example.com".to_string(),
            channel: "email".to_string(),
            message_id: "intro".to_string(),
            step_index: 0,
            idempotency_key: idempotency_key(campaign_id, lead_id, "intro", 0),
        }
    }

    #[test]
    fn mock_sender_receipt_is_stable_for_same_request() {
        let sender = MockSender::new();
        let request = fixture_request();

        let first = sender.send(&request);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let second = sender.send(&request);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());

        assert_eq!(first, second);
        assert!(first.proof.is_none());
        assert!(first.provider_reference.starts_with("mock:intro:"));
    }

    #[test]
    fn mock_sender_receipt_varies_with_the_idempotency_key() {
        let sender = MockSender::new();
        let first = fixture_request();
        let second = fixture_request();

        let receipt_a = sender.send(&first);
        let receipt_b = sender.send(&second);
        assert!(receipt_a.is_ok());
        assert!(receipt_b.is_ok());
        assert_ne!(
            receipt_a.unwrap_or_else(|_| unreachable!()),
            receipt_b.unwrap_or_else(|_| unreachable!())
        );
    }

    #[test]
    fn proof_mode_attaches_a_deterministic_proof() {
        let sender = MockSender::with_proof();
        let request = fixture_request();

        let first = sender.send(&request);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        assert!(first.proof.is_some());

        let second = sender.send(&request);
        assert!(second.is_ok());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert_eq!(first.proof, second.proof);
    }

    #[test]
    fn http_sender_requires_url() {
        let result = HttpJsonSender::from_params(&json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn http_sender_rejects_non_string_headers() {
        let result = HttpJsonSender::from_params(&json!({
            "url": "http://127.0.0.1:1/send",
            "headers": {"x-count": 3},
        }));
        assert!(result.is_err());
    }
}
