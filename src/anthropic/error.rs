//! Tipos de erro para o cliente da API Anthropic.
//!
//! [`AnthropicError`] descreve as falhas do transporte; a conversão para
//! [`ServiceError`] decide como o orquestrador deve tratá-las.

use std::time::Duration;

use thiserror::Error;

use crate::error::ServiceError;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429. `retry_after` vem do cabeçalho
    /// `retry-after`, quando presente.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Qualquer outro status de erro (401 chave inválida, 529 sobrecarga...).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A resposta chegou, mas sem nenhum bloco de texto.
    #[error("empty response from model {model}")]
    EmptyResponse { model: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

impl From<AnthropicError> for ServiceError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { retry_after } => ServiceError::RateLimited {
                message: err.to_string(),
                retry_after,
            },
            AnthropicError::ApiError { status, message } => {
                ServiceError::from_status(status, message, None)
            }
            AnthropicError::EmptyResponse { .. } => ServiceError::Transient(err.to_string()),
            AnthropicError::NetworkError(e) => ServiceError::from(e),
        }
    }
}
