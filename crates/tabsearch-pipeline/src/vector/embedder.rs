//! Embedding providers
//!
//! | `EMBEDDING_PROVIDER` | Provider |
//! |----------------------|----------|
//! | `disabled` | [`DisabledEmbedder`], fails on use |
//! | `ollama` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `local` | `LocalEmbedder`, in-process fastembed model (feature `local-embeddings`) |
//!
//! Providers are built once per process by [`create_embedder`] and shared.
//! Every returned batch is checked with [`check_embeddings`] before use.

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Length of every vector this provider returns
    fn dims(&self) -> usize;

    /// One vector per input text, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Verify a provider answer has one vector of `dims` values per input
pub fn check_embeddings(inputs: usize, dims: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != inputs {
        return Err(PipelineError::Embedding(format!(
            "expected {} vectors, got {}",
            inputs,
            vectors.len()
        )));
    }
    if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
        return Err(PipelineError::Embedding(format!(
            "vector {} has {} dimensions, expected {}",
            i,
            v.len(),
            dims
        )));
    }
    Ok(())
}

/// Build the configured provider
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(PipelineError::Config(
            "the local embedding provider needs the `local-embeddings` feature".to_string(),
        )),
        other => Err(PipelineError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PipelineError::Embedding(
            "embedding provider is disabled".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings from an Ollama server
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Embedding(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Embedding(format!(
                "Ollama API error {}: {}",
                status,
                text.trim()
            )));
        }

        let parsed: OllamaResponse = response.json().await?;
        Ok(parsed.embeddings)
    }
}

#[cfg(feature = "local-embeddings")]
mod local {
    use super::Embedder;
    use crate::config::EmbeddingConfig;
    use crate::error::{PipelineError, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const LOCAL_BATCH_SIZE: usize = 256;

    fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm" | "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            other => Err(PipelineError::Config(format!(
                "unknown local embedding model: {}",
                other
            ))),
        }
    }

    /// In-process model, loaded once. Inference needs exclusive access, so
    /// calls are serialized on the mutex.
    pub struct LocalEmbedder {
        model: Arc<Mutex<fastembed::TextEmbedding>>,
        name: String,
        dims: usize,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model(&config.model)?)
                    .with_show_download_progress(false),
            )
            .map_err(|e| {
                PipelineError::Embedding(format!("failed to load local model: {}", e))
            })?;
            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                name: config.model.clone(),
                dims: config.dims,
            })
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = Arc::clone(&self.model);
            let texts = texts.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut model = model.lock().map_err(|_| {
                    PipelineError::Embedding("local model lock poisoned".to_string())
                })?;
                model
                    .embed(texts, Some(LOCAL_BATCH_SIZE))
                    .map_err(|e| PipelineError::Embedding(format!("local embedding failed: {}", e)))
            })
            .await?
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "ollama".to_string(),
            model: "all-minilm".to_string(),
            url: url.to_string(),
            dims: 3,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_check_embeddings() {
        assert!(check_embeddings(2, 3, &[vec![0.0; 3], vec![1.0; 3]]).is_ok());
        assert!(check_embeddings(2, 3, &[vec![0.0; 3]]).is_err());
        let err = check_embeddings(2, 3, &[vec![0.0; 3], vec![1.0; 4]]).unwrap_err();
        assert!(err.to_string().contains("vector 1 has 4 dimensions"));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut config = config("http://localhost:11434");
        config.provider = "word2vec".to_string();
        assert!(matches!(create_embedder(&config), Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_on_use() {
        let err = DisabledEmbedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_json(serde_json::json!({
                "model": "all-minilm",
                "input": ["first", "second"],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "all-minilm",
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&config(&server.uri())).unwrap();
        let vectors = embedder
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn test_ollama_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&config(&server.uri())).unwrap();
        let err = embedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("model not found"));
    }

    #[tokio::test]
    async fn test_ollama_empty_input_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(&config(&server.uri())).unwrap();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }
}
