// REST client for the to-do server
// Every call is one HTTP request; status codes are folded into SyncError

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::session::config::Config;
use crate::session::error::SyncError;
use crate::session::protocol::{
    AuthRequest, ListId, LoginResponse, ReorderRequest, Task, TaskDraft, TaskId, TaskPatch,
    TodoList,
};

/// Header the server reads the session token from
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Operations the sync runtime needs from the server
///
/// Authenticated calls take the session token explicitly so one client can
/// outlive a sign-out.
#[async_trait]
pub trait TodoApi: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> Result<String, SyncError>;
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, SyncError>;

    async fn lists(&self, token: &str) -> Result<Vec<TodoList>, SyncError>;
    async fn create_list(&self, token: &str, name: &str) -> Result<(), SyncError>;
    async fn delete_list(&self, token: &str, list: ListId) -> Result<(), SyncError>;

    async fn tasks(&self, token: &str, list: ListId) -> Result<Vec<Task>, SyncError>;
    async fn add_task(&self, token: &str, list: ListId, draft: &TaskDraft)
        -> Result<(), SyncError>;
    async fn update_task(&self, token: &str, task: TaskId, patch: &TaskPatch)
        -> Result<(), SyncError>;
    async fn delete_task(&self, token: &str, task: TaskId) -> Result<(), SyncError>;
    async fn reorder_tasks(&self, token: &str, request: &ReorderRequest)
        -> Result<(), SyncError>;

    /// Turn free text into a draft with priority and due date
    async fn parse_task(&self, token: &str, text: &str) -> Result<TaskDraft, SyncError>;
}

/// reqwest-backed [`TodoApi`]
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder
            .bearer_auth(token)
            .header(ACCESS_TOKEN_HEADER, token)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, SyncError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(%status, body = %body, "request rejected");
        Err(classify_failure(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SyncError> {
        Ok(self.send(builder).await?.json::<T>().await?)
    }

    async fn send_unit(&self, builder: RequestBuilder) -> Result<(), SyncError> {
        self.send(builder).await.map(|_| ())
    }

    fn post<B: Serialize + ?Sized>(&self, path: &str, token: &str, body: &B) -> RequestBuilder {
        self.authed(self.client.post(self.url(path)), token).json(body)
    }
}

#[derive(serde::Deserialize)]
struct MessageBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Map a non-success status and its body to the error taxonomy
///
/// 401 ends the session, any other 4xx is a rejected request, everything else
/// is a transport-level failure.
pub fn classify_failure(status: StatusCode, body: &str) -> SyncError {
    let message = serde_json::from_str::<MessageBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    if status == StatusCode::UNAUTHORIZED {
        SyncError::Auth(message)
    } else if status.is_client_error() {
        SyncError::Validation(message)
    } else {
        SyncError::Transport(format!("server returned {}: {}", status.as_u16(), message))
    }
}

#[async_trait]
impl TodoApi for HttpApi {
    async fn register(&self, username: &str, password: &str) -> Result<String, SyncError> {
        let body = AuthRequest { username, password };
        let reply: MessageBody = self
            .send_json(self.client.post(self.url("/register")).json(&body))
            .await?;
        Ok(reply
            .message
            .unwrap_or_else(|| "User registered successfully!".to_string()))
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, SyncError> {
        let body = AuthRequest { username, password };
        self.send_json(self.client.post(self.url("/login")).json(&body))
            .await
    }

    async fn lists(&self, token: &str) -> Result<Vec<TodoList>, SyncError> {
        self.send_json(self.authed(self.client.get(self.url("/lists")), token))
            .await
    }

    async fn create_list(&self, token: &str, name: &str) -> Result<(), SyncError> {
        self.send_unit(self.post("/lists", token, &serde_json::json!({ "name": name })))
            .await
    }

    async fn delete_list(&self, token: &str, list: ListId) -> Result<(), SyncError> {
        let url = self.url(&format!("/lists/{}", list));
        self.send_unit(self.authed(self.client.delete(url), token))
            .await
    }

    async fn tasks(&self, token: &str, list: ListId) -> Result<Vec<Task>, SyncError> {
        let url = self.url(&format!("/lists/{}/tasks", list));
        self.send_json(self.authed(self.client.get(url), token))
            .await
    }

    async fn add_task(
        &self,
        token: &str,
        list: ListId,
        draft: &TaskDraft,
    ) -> Result<(), SyncError> {
        self.send_unit(self.post(&format!("/lists/{}/tasks", list), token, draft))
            .await
    }

    async fn update_task(
        &self,
        token: &str,
        task: TaskId,
        patch: &TaskPatch,
    ) -> Result<(), SyncError> {
        let url = self.url(&format!("/tasks/{}", task));
        self.send_unit(self.authed(self.client.put(url), token).json(patch))
            .await
    }

    async fn delete_task(&self, token: &str, task: TaskId) -> Result<(), SyncError> {
        let url = self.url(&format!("/tasks/{}", task));
        self.send_unit(self.authed(self.client.delete(url), token))
            .await
    }

    async fn reorder_tasks(
        &self,
        token: &str,
        request: &ReorderRequest,
    ) -> Result<(), SyncError> {
        let url = self.url("/tasks/reorder");
        self.send_unit(self.authed(self.client.put(url), token).json(request))
            .await
    }

    async fn parse_task(&self, token: &str, text: &str) -> Result<TaskDraft, SyncError> {
        self.send_json(self.post("/parse-task", token, &serde_json::json!({ "text": text })))
            .await
    }
}
