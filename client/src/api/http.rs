//! reqwest implementation of the remote API.

use super::{ApiError, ApiRequest, ApiResult, RemoteApi};
use crate::auth::{AuthToken, SharedToken};
use crate::config::{ConfigError, ConnectionConfig};
use async_trait::async_trait;
use listsync_engine::{ConflictType, List};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of a 409 response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    #[serde(default)]
    server_data: Option<Value>,
    #[serde(default)]
    conflict_type: Option<ConflictType>,
}

/// Error body of any other failure.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the lists API.
#[derive(Clone)]
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: Url,
    token: SharedToken,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.get())
            .finish()
    }
}

impl HttpRemoteApi {
    pub fn new(
        base_url: impl Into<String>,
        token: AuthToken,
        config: &ConnectionConfig,
    ) -> Result<Self, ConfigError> {
        let base_url = base_url.into();
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ConfigError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl(format!("{base_url}: not a base URL")));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: SharedToken::new(token),
        })
    }

    /// `segments` appended to the base URL, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.client
            .request(method, self.endpoint(segments))
            .bearer_auth(self.token.get().secret())
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn send_for_list(&self, builder: RequestBuilder) -> ApiResult<Option<List>> {
        let response = self.send(builder).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        List::from_value(&value)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::CONFLICT => {
            let parsed: Option<ConflictBody> = serde_json::from_str(body).ok();
            let (server_data, conflict_type) = match parsed {
                Some(body) => (
                    body.server_data.filter(|data| !data.is_null()),
                    body.conflict_type.unwrap_or(ConflictType::Update),
                ),
                None => (None, ConflictType::Update),
            };
            ApiError::Conflict {
                server_data,
                conflict_type,
            }
        }
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ApiError::Server {
            status: status.as_u16(),
            message: error_message(body),
        },
        status if status.is_server_error() => ApiError::Server {
            status: status.as_u16(),
            message: error_message(body),
        },
        status => ApiError::Rejected {
            status: status.as_u16(),
            message: error_message(body),
        },
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.error.or(body.message))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn execute(&self, request: &ApiRequest) -> ApiResult<Option<List>> {
        tracing::debug!(?request, "Sending remote write");
        let builder = match request {
            ApiRequest::CreateList { list } => self.request(Method::POST, &["lists"]).json(list),
            ApiRequest::UpdateList {
                id,
                patch,
                base_version,
            } => {
                let mut body = patch.clone();
                body.insert("baseVersion".into(), json!(base_version));
                self.request(Method::PATCH, &["lists", id.as_str()])
                    .json(&body)
            }
            ApiRequest::DeleteList { id, base_version } => self
                .request(Method::DELETE, &["lists", id.as_str()])
                .query(&[("baseVersion", base_version)]),
            ApiRequest::ShareList {
                id,
                share,
                base_version,
            } => self
                .request(Method::POST, &["lists", id.as_str(), "shares"])
                .json(&json!({
                    "userRef": share.user_ref,
                    "permission": share.permission,
                    "baseVersion": base_version,
                })),
            ApiRequest::UnshareList {
                id,
                user_ref,
                base_version,
            } => self
                .request(Method::DELETE, &["lists", id.as_str(), "shares", user_ref.as_str()])
                .query(&[("baseVersion", base_version)]),
            ApiRequest::AddItems {
                list_id,
                items,
                base_version,
            } => self
                .request(Method::POST, &["lists", list_id.as_str(), "items"])
                .json(&json!({"items": items, "baseVersion": base_version})),
            ApiRequest::UpdateItem {
                list_id,
                item_id,
                changes,
                base_version,
            } => {
                let mut body = changes.clone();
                body.insert("baseVersion".into(), json!(base_version));
                self.request(Method::PATCH, &["lists", list_id.as_str(), "items", item_id.as_str()])
                    .json(&body)
            }
            ApiRequest::DeleteItem {
                list_id,
                item_id,
                base_version,
            } => self
                .request(Method::DELETE, &["lists", list_id.as_str(), "items", item_id.as_str()])
                .query(&[("baseVersion", base_version)]),
            ApiRequest::ReorderItems {
                list_id,
                item_ids,
                base_version,
            } => self
                .request(Method::PUT, &["lists", list_id.as_str(), "items", "order"])
                .json(&json!({"itemIds": item_ids, "baseVersion": base_version})),
        };

        self.send_for_list(builder).await
    }

    async fn fetch_list(&self, id: &str) -> ApiResult<List> {
        self.send_for_list(self.request(Method::GET, &["lists", id]))
            .await?
            .ok_or(ApiError::NotFound)
    }

    async fn health(&self) -> ApiResult<()> {
        self.send(self.request(Method::GET, &["health"])).await?;
        Ok(())
    }

    fn set_token(&self, token: &AuthToken) {
        self.token.set(token.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_body_is_parsed() {
        let err = status_error(
            StatusCode::CONFLICT,
            r#"{"serverData": {"id": "l1", "version": 4}, "conflictType": "DELETE"}"#,
        );
        match err {
            ApiError::Conflict {
                server_data,
                conflict_type,
            } => {
                assert_eq!(conflict_type, ConflictType::Delete);
                assert_eq!(server_data.unwrap()["version"], 4);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert!(matches!(
            status_error(StatusCode::CONFLICT, "not json"),
            ApiError::Conflict {
                server_data: None,
                conflict_type: ConflictType::Update
            }
        ));
    }

    #[test]
    fn statuses_map_to_errors() {
        assert_eq!(status_error(StatusCode::NOT_FOUND, ""), ApiError::NotFound);
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, r#"{"error": "upstream"}"#),
            ApiError::Server {
                status: 502,
                message: "upstream".into()
            }
        );
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad"),
            ApiError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn path_segments_are_encoded() {
        let api = HttpRemoteApi::new(
            "http://localhost:8080/api/",
            AuthToken::new("t"),
            &ConnectionConfig::default(),
        )
        .unwrap();
        assert_eq!(
            api.endpoint(&["lists", "temp-abc_1.2~"]).as_str(),
            "http://localhost:8080/api/lists/temp-abc_1.2~"
        );
        assert_eq!(
            api.endpoint(&["lists", "a/b c", "items"]).as_str(),
            "http://localhost:8080/api/lists/a%2Fb%20c/items"
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        let result = HttpRemoteApi::new("not a url", AuthToken::new("t"), &ConnectionConfig::default());
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }
}
