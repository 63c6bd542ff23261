use minecloud_primitives::RetryPolicy;
use serde::Deserialize;

use crate::types::{
    ChallengeStatus, DonationReceipt, RegistrationReceipt, SolutionReceipt, TermsAndConditions,
};
use crate::{ApiError, ApiErrorKind};

/// Result of posting one nonce. Duplicates and transient failures are
/// ordinary branches of the submission flow, not exceptions.
#[derive(Clone, Debug)]
pub enum SubmitOutcome {
    Accepted(SolutionReceipt),
    /// The Mine API already holds a solution for this pair (HTTP 409 or
    /// an "already exists" body). Treated as success by callers.
    Duplicate,
    TransientError(String),
    Fatal(String),
}

/// The Mine API surface the coordinator consumes. Injected so tests
/// drive the orchestrator with a scripted fake.
#[allow(async_fn_in_trait)]
pub trait MineApi: Send + Sync {
    async fn fetch_challenge(&self) -> Result<ChallengeStatus, ApiError>;

    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str)
        -> SubmitOutcome;

    async fn fetch_terms(&self, version: &str) -> Result<TermsAndConditions, ApiError> {
        let _ = version;
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "terms endpoint not supported by this client",
        ))
    }

    async fn register(
        &self,
        address: &str,
        signature: &str,
        pubkey: &str,
    ) -> Result<RegistrationReceipt, ApiError> {
        let _ = (address, signature, pubkey);
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "registration endpoint not supported by this client",
        ))
    }

    async fn work_to_star_rate(&self) -> Result<Vec<f64>, ApiError> {
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "reward rate endpoint not supported by this client",
        ))
    }

    async fn donate_to(
        &self,
        destination: &str,
        original: &str,
        signature: &str,
    ) -> Result<DonationReceipt, ApiError> {
        let _ = (destination, original, signature);
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "donation endpoint not supported by this client",
        ))
    }
}

/// Source of the donation destination address. Kept separate from the
/// Mine API because it is an injected absolute URL that may simply be
/// unavailable, which only disables donation work items.
#[allow(async_fn_in_trait)]
pub trait DonationSource: Send + Sync {
    async fn donation_address(&self) -> Result<String, ApiError>;
}

impl<T: MineApi + ?Sized> MineApi for std::sync::Arc<T> {
    async fn fetch_challenge(&self) -> Result<ChallengeStatus, ApiError> {
        T::fetch_challenge(self).await
    }

    async fn submit_solution(
        &self,
        address: &str,
        challenge_id: &str,
        nonce: &str,
    ) -> SubmitOutcome {
        T::submit_solution(self, address, challenge_id, nonce).await
    }

    async fn fetch_terms(&self, version: &str) -> Result<TermsAndConditions, ApiError> {
        T::fetch_terms(self, version).await
    }

    async fn register(
        &self,
        address: &str,
        signature: &str,
        pubkey: &str,
    ) -> Result<RegistrationReceipt, ApiError> {
        T::register(self, address, signature, pubkey).await
    }

    async fn work_to_star_rate(&self) -> Result<Vec<f64>, ApiError> {
        T::work_to_star_rate(self).await
    }

    async fn donate_to(
        &self,
        destination: &str,
        original: &str,
        signature: &str,
    ) -> Result<DonationReceipt, ApiError> {
        T::donate_to(self, destination, original, signature).await
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SubmitClass {
    Accepted,
    Duplicate,
    Transient,
    Fatal,
}

/// Map an HTTP response to the submission outcome. Some deployments
/// answer duplicates with 409, others with a 4xx carrying an
/// "already exists" body; both collapse to `Duplicate`.
fn classify_submit(status: u16, body: &str) -> SubmitClass {
    if (200..300).contains(&status) {
        return SubmitClass::Accepted;
    }
    if status == 409 {
        return SubmitClass::Duplicate;
    }
    if body.to_lowercase().contains("already exists") {
        return SubmitClass::Duplicate;
    }
    if status >= 500 || status == 429 {
        return SubmitClass::Transient;
    }
    SubmitClass::Fatal
}

/// reqwest-backed Mine API client with bounded retry on transient
/// failures.
#[derive(Clone)]
pub struct HttpMineApi {
    base_url: String,
    client: reqwest::Client,
    pub retry: RetryPolicy,
}

impl HttpMineApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|err| ApiError::new(ApiErrorKind::Transient, err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::new(
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(10),
                3,
            ),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|err| {
                            ApiError::new(ApiErrorKind::Codec, format!("{url}: {err}"))
                        });
                    }
                    let body = response.text().await.unwrap_or_default();
                    if !status.is_server_error() {
                        return Err(ApiError::new(
                            ApiErrorKind::Http,
                            format!("{url}: HTTP {status} {body}"),
                        ));
                    }
                    last_error = format!("HTTP {status} {body}");
                }
                Err(err) => last_error = err.to_string(),
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
        Err(ApiError::transient(format!("{url}: {last_error}")))
    }

    async fn post_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|err| ApiError::transient(format!("{url}: {err}")))?;
        let status = response.status();
        if status.is_success() {
            // Some endpoints answer with an empty body on success.
            let body = response.text().await.unwrap_or_default();
            if body.trim().is_empty() {
                return Ok(T::default());
            }
            return serde_json::from_str(&body)
                .map_err(|err| ApiError::new(ApiErrorKind::Codec, format!("{url}: {err}")));
        }
        let body = response.text().await.unwrap_or_default();
        let kind = if status.is_server_error() {
            ApiErrorKind::Transient
        } else {
            ApiErrorKind::Http
        };
        Err(ApiError::new(kind, format!("{url}: HTTP {status} {body}")))
    }
}

impl MineApi for HttpMineApi {
    async fn fetch_challenge(&self) -> Result<ChallengeStatus, ApiError> {
        self.get_json("/challenge").await
    }

    async fn submit_solution(
        &self,
        address: &str,
        challenge_id: &str,
        nonce: &str,
    ) -> SubmitOutcome {
        let url = self.url(&format!("/solution/{address}/{challenge_id}/{nonce}"));
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            match self
                .client
                .post(&url)
                .json(&serde_json::json!({}))
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    match classify_submit(status, &body) {
                        SubmitClass::Accepted => {
                            let receipt =
                                serde_json::from_str::<SolutionReceipt>(&body).unwrap_or_default();
                            return SubmitOutcome::Accepted(receipt);
                        }
                        SubmitClass::Duplicate => return SubmitOutcome::Duplicate,
                        SubmitClass::Fatal => {
                            return SubmitOutcome::Fatal(format!("HTTP {status} {body}"))
                        }
                        SubmitClass::Transient => last_error = format!("HTTP {status} {body}"),
                    }
                }
                Err(err) => last_error = err.to_string(),
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
        SubmitOutcome::TransientError(last_error)
    }

    async fn fetch_terms(&self, version: &str) -> Result<TermsAndConditions, ApiError> {
        self.get_json(&format!("/TandC/{version}")).await
    }

    async fn register(
        &self,
        address: &str,
        signature: &str,
        pubkey: &str,
    ) -> Result<RegistrationReceipt, ApiError> {
        self.post_json(&format!("/register/{address}/{signature}/{pubkey}"))
            .await
    }

    async fn work_to_star_rate(&self) -> Result<Vec<f64>, ApiError> {
        self.get_json("/work_to_star_rate").await
    }

    async fn donate_to(
        &self,
        destination: &str,
        original: &str,
        signature: &str,
    ) -> Result<DonationReceipt, ApiError> {
        self.post_json(&format!("/donate_to/{destination}/{original}/{signature}"))
            .await
    }
}

/// Donation destination served from a configured absolute URL, as
/// either `{"address": "..."}` or a bare text body.
pub struct HttpDonationSource {
    url: String,
    client: reqwest::Client,
}

impl HttpDonationSource {
    pub fn new(url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| ApiError::new(ApiErrorKind::Transient, err.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct DonationAddressBody {
    address: String,
}

impl DonationSource for HttpDonationSource {
    async fn donation_address(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| ApiError::transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::transient(format!(
                "donation endpoint HTTP {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| ApiError::transient(err.to_string()))?;
        parse_donation_address(&body)
    }
}

fn parse_donation_address(body: &str) -> Result<String, ApiError> {
    if let Ok(parsed) = serde_json::from_str::<DonationAddressBody>(body) {
        return Ok(parsed.address);
    }
    let trimmed = body.trim().trim_matches('"');
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ApiErrorKind::Codec,
            "donation endpoint returned an empty body",
        ));
    }
    Ok(trimmed.to_string())
}
