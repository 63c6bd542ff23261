use crate::{ApiError, ApiErrorKind};

/// Identity a worker learns about itself on boot.
#[derive(Clone, Debug)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub region: String,
    pub public_endpoint: String,
}

#[allow(async_fn_in_trait)]
pub trait MetadataProvider: Send + Sync {
    async fn identity(&self) -> Result<WorkerIdentity, ApiError>;
}

/// Fixed identity from configuration; also serves tests and local runs.
#[derive(Clone, Debug)]
pub struct StaticMetadata {
    pub identity: WorkerIdentity,
}

impl StaticMetadata {
    pub fn new(worker_id: &str, region: &str, public_endpoint: &str) -> Self {
        Self {
            identity: WorkerIdentity {
                worker_id: worker_id.to_string(),
                region: region.to_string(),
                public_endpoint: public_endpoint.to_string(),
            },
        }
    }
}

impl MetadataProvider for StaticMetadata {
    async fn identity(&self) -> Result<WorkerIdentity, ApiError> {
        Ok(self.identity.clone())
    }
}

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// IMDSv2-style token-protected metadata endpoint.
pub struct ImdsMetadataProvider {
    base_url: String,
    client: reqwest::Client,
}

impl ImdsMetadataProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|err| ApiError::new(ApiErrorKind::Transient, err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn default_endpoint() -> Result<Self, ApiError> {
        Self::new("http://169.254.169.254")
    }

    async fn token(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .put(format!("{}/latest/api/token", self.base_url))
            .header(TOKEN_TTL_HEADER, "21600")
            .send()
            .await
            .map_err(|err| ApiError::transient(format!("metadata token: {err}")))?;
        if !response.status().is_success() {
            return Err(ApiError::transient(format!(
                "metadata token: HTTP {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|err| ApiError::transient(format!("metadata token: {err}")))
    }

    async fn fetch(&self, token: &str, path: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .get(format!("{}/latest/meta-data/{path}", self.base_url))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|err| ApiError::transient(format!("metadata {path}: {err}")))?;
        if !response.status().is_success() {
            return Err(ApiError::transient(format!(
                "metadata {path}: HTTP {}",
                response.status()
            )));
        }
        Ok(response
            .text()
            .await
            .map_err(|err| ApiError::transient(format!("metadata {path}: {err}")))?
            .trim()
            .to_string())
    }
}

impl MetadataProvider for ImdsMetadataProvider {
    async fn identity(&self) -> Result<WorkerIdentity, ApiError> {
        let token = self.token().await?;
        let worker_id = self.fetch(&token, "instance-id").await?;
        let region = self.fetch(&token, "placement/region").await?;
        // Workers behind NAT have no public hostname; the endpoint is
        // informational, so absence is fine.
        let public_endpoint = self
            .fetch(&token, "public-hostname")
            .await
            .unwrap_or_default();
        Ok(WorkerIdentity {
            worker_id,
            region,
            public_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_metadata_round_trips() {
        let provider = StaticMetadata::new("i-0abc", "eu-west-1", "http://w:8080");
        let identity = provider.identity().await.expect("identity");
        assert_eq!(identity.worker_id, "i-0abc");
        assert_eq!(identity.region, "eu-west-1");
    }
}
