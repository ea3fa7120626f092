use crate::error::{GenerationError, Result};
use crate::types::{GenerationRequest, GenerationResponse};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce the next simulated turn for the given context.
    ///
    /// Implementations should return [`GenerationError::Cancelled`] promptly
    /// once `cancel` fires.
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse>;
}

#[derive(Clone)]
pub struct HttpGenerationService {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerationService {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(GenerationError::InvalidInput(
                "generation endpoint is empty".to_string(),
            ));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(GenerationError::InvalidInput(format!(
                "generation endpoint must be http(s): {endpoint}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Http(format!(
                "generation status={status} body={body}"
            )));
        }
        parse_response(&body)
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(recipients = request.recipients.len(), history = request.message_history.len())
    )]
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse> {
        // Dropping the in-flight future aborts the underlying connection.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            result = self.post(request) => result,
        }
    }
}

fn parse_response(body: &str) -> Result<GenerationResponse> {
    let parsed: GenerationResponse = serde_json::from_str(body)?;
    parsed.validate()?;
    Ok(parsed)
}
