//! # Refinement Hook
//!
//! Optional post-processing of a decoded prediction by an external service.
//! Refinement is best-effort: every failure path hands back the original
//! prediction, so callers always have a usable answer.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Env var holding the refinement credential by default.
pub const DEFAULT_API_KEY_ENV: &str = "QUILL_REFINE_API_KEY";

/// Post-processes a decoded prediction.
pub trait Refiner: Send + Sync {
    /// Return a corrected prediction, or `prediction` unchanged on any failure.
    fn refine(&self, prediction: &str, image: &[u8]) -> String;

    /// Short identifier for logs and status reports.
    fn name(&self) -> &'static str;
}

/// Default refiner: returns the prediction untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefiner;

impl Refiner for NoopRefiner {
    fn refine(&self, prediction: &str, _image: &[u8]) -> String {
        prediction.to_string()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Where and how to reach the refinement service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerConfig {
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8089/v1/refine".into(),
            api_key_env: DEFAULT_API_KEY_ENV.into(),
            model: "default".into(),
            timeout_secs: 20,
        }
    }
}

#[derive(Serialize)]
struct RefineRequest<'a> {
    model: &'a str,
    prediction: &'a str,
    /// Base64-encoded source image.
    image: String,
}

#[derive(Deserialize)]
struct RefineResponse {
    text: String,
}

/// Refiner backed by an HTTP JSON endpoint.
pub struct HttpRefiner {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpRefiner {
    /// Build a client. Fails only if the HTTP client cannot be constructed.
    pub fn new(config: &RefinerConfig, api_key: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn try_refine(&self, prediction: &str, image: &[u8]) -> Result<String, String> {
        let body = RefineRequest {
            model: &self.model,
            prediction,
            image: base64::engine::general_purpose::STANDARD.encode(image),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("service returned {status}"));
        }

        let parsed: RefineResponse = response
            .json()
            .map_err(|e| format!("malformed response: {e}"))?;
        let text = parsed.text.trim();
        if text.is_empty() {
            return Err("service returned empty text".into());
        }
        Ok(text.to_string())
    }
}

impl Refiner for HttpRefiner {
    fn refine(&self, prediction: &str, image: &[u8]) -> String {
        match self.try_refine(prediction, image) {
            Ok(refined) => {
                debug!(original = prediction, refined = %refined, "prediction refined");
                refined
            }
            Err(reason) => {
                warn!(%reason, "refinement failed, keeping original prediction");
                prediction.to_string()
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Pick a refiner: HTTP when the credential variable is set, otherwise no-op.
#[must_use]
pub fn refiner_from_config(config: &RefinerConfig) -> Box<dyn Refiner> {
    let api_key = match std::env::var(&config.api_key_env) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            debug!(env = %config.api_key_env, "no refinement credential, refinement disabled");
            return Box::new(NoopRefiner);
        }
    };

    match HttpRefiner::new(config, api_key) {
        Ok(refiner) => Box::new(refiner),
        Err(e) => {
            warn!(error = %e, "could not build refinement client, refinement disabled");
            Box::new(NoopRefiner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_returns_input_unchanged() {
        let config = RefinerConfig {
            api_key_env: "QUILL_TEST_REFINE_KEY_THAT_IS_NEVER_SET".into(),
            ..RefinerConfig::default()
        };
        let refiner = refiner_from_config(&config);
        assert_eq!(refiner.name(), "none");
        assert_eq!(refiner.refine("AB12", b"png"), "AB12");
    }

    #[test]
    fn unreachable_service_falls_back() {
        let config = RefinerConfig {
            endpoint: "http://127.0.0.1:9/refine".into(),
            timeout_secs: 2,
            ..RefinerConfig::default()
        };
        let refiner = HttpRefiner::new(&config, "secret".into()).unwrap();
        assert_eq!(refiner.refine("helo", b"\x89PNG"), "helo");
    }
}
