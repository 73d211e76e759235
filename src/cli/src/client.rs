//! HTTP client for the Lingua administrative API.

use anyhow::{Context, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Success envelope returned by the server.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
}

/// Error envelope returned by the server and by the permission guard.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    reason: Option<String>,
    message: String,
}

/// A non-2xx answer from the server.
#[derive(Debug, thiserror::Error)]
#[error("{status} {code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn from_body(status: StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => {
                let message = match envelope.error.reason {
                    Some(reason) => format!("{} ({})", envelope.error.message, reason),
                    None => envelope.error.message,
                };
                Self {
                    status,
                    code: envelope.error.code,
                    message,
                }
            }
            Err(_) => Self {
                status,
                code: "HTTP_ERROR".to_string(),
                message: if body.is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    body.to_string()
                },
            },
        }
    }
}

/// HTTP client for the Lingua API.
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `http://localhost:8080`).
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> (String, RequestBuilder) {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.request(method, &url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        (url, builder)
    }

    /// Send and unwrap the `data` field of the success envelope.
    async fn send<T: DeserializeOwned>(&self, url: String, builder: RequestBuilder) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_body(status, &body).into());
        }

        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        if !api_resp.success {
            anyhow::bail!("API reported failure without an error body");
        }
        api_resp
            .data
            .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (url, builder) = self.request(Method::GET, path);
        self.send(url, builder).await
    }

    pub async fn get_query<Q: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, query: &Q) -> Result<T> {
        let (url, builder) = self.request(Method::GET, path);
        self.send(url, builder.query(query)).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let (url, builder) = self.request(Method::POST, path);
        self.send(url, builder.json(body)).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let (url, builder) = self.request(Method::PUT, path);
        self.send(url, builder.json(body)).await
    }

    /// DELETE that may answer with an empty body (204) or an envelope.
    pub async fn delete(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let (url, builder) = self.request(Method::DELETE, path);
        let resp = builder
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_body(status, &body).into());
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let api_resp: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;
        Ok(api_resp.data)
    }

    /// GET returning the raw JSON body regardless of status (health reports
    /// 503 with a body when degraded).
    pub async fn get_raw(&self, path: &str) -> Result<(StatusCode, serde_json::Value)> {
        let (url, builder) = self.request(Method::GET, path);
        let resp = builder
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        let body = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;
        Ok((status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_from_guard_body() {
        let body = r#"{"success":false,"error":{"code":"FORBIDDEN","reason":"implicit_deny","message":"You do not have permission to access this resource."}}"#;
        let err = ApiError::from_body(StatusCode::FORBIDDEN, body);
        assert_eq!(err.code, "FORBIDDEN");
        assert!(err.message.ends_with("(implicit_deny)"));
    }

    #[test]
    fn test_api_error_from_plain_body() {
        let err = ApiError::from_body(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.code, "HTTP_ERROR");
        assert_eq!(err.message, "Bad Gateway");
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = ApiClient::new("http://localhost:8080/", Some(String::new())).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert!(client.token.is_none());
    }
}
