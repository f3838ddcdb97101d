//! Typed REST client for the chat backend.
//!
//! `ChatApi` owns the pooled HTTP client and the injected credential. The
//! stream manager only sees the `ChatBackend` subset, so tests can swap in an
//! in-memory backend.

mod retry_policy;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::services::auth::CredentialProvider;
use crate::services::chat::ChatMessage;
use crate::services::config::{ClientConfig, load_client_config};
use crate::services::error::ClientError;
use crate::services::retry::RetryConfig;

use retry_policy::{should_retry_read, should_retry_submission};
use types::{
    ChatCreate, ChatDetail, ChatExport, ChatListQuery, ChatPatch, ChatSummary, EditMessage,
    FileUpload, KnowledgeCreate, KnowledgeItem, LoginRequest, LoginResponse, MessageRequest,
    Project, ProjectCreate, ProjectDetail, ProjectUpdate, SavedSystemPrompt, SystemPromptCreate,
};

/// Raw body of a message stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

/// The backend operations the stream manager depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// `POST /chats/{id}/messages`; resolves once response headers arrive.
    async fn open_message_stream(
        &self,
        chat_id: &str,
        request: &MessageRequest,
    ) -> Result<ByteStream, ClientError>;

    /// Messages of every pair of the chat, in order.
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ClientError>;

    async fn create_chat(&self, request: &ChatCreate) -> Result<ChatSummary, ClientError>;

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError>;

    async fn toggle_message_pair(&self, pair_id: &str, hidden: bool) -> Result<(), ClientError>;

    async fn delete_message_pair(&self, pair_id: &str) -> Result<(), ClientError>;
}

#[derive(Clone)]
pub struct ChatApi {
    http_client: reqwest::Client,
    config: Arc<ClientConfig>,
    credentials: Arc<CredentialProvider>,
    retry: RetryConfig,
}

impl ChatApi {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            http_client,
            retry: config.retry,
            config: Arc::new(config),
            credentials,
        })
    }

    /// Build from `.env`/environment, seeding the credential from `CHAT_API_TOKEN`.
    pub fn from_env() -> Result<Self, ClientError> {
        let config = load_client_config();
        let credentials = CredentialProvider::new(config.auth_scheme, config.access_token.clone());
        Self::new(config, credentials)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    // auth

    /// Exchange credentials for an access token and install it.
    ///
    /// Sent without an `Authorization` header, so it also works while signed out.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<LoginResponse, ClientError> {
        let builder = self
            .http_client
            .post(self.config.auth_endpoint("login"))
            .timeout(self.config.request_timeout)
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
                remember_me,
            });
        let response: LoginResponse = decode_json(self.execute(builder).await?).await?;
        self.credentials.issue(response.access_token.clone());
        log::info!("Signed in as {}", email);
        Ok(response)
    }

    // chats

    pub async fn list_chats(&self, query: &ChatListQuery) -> Result<Vec<ChatSummary>, ClientError> {
        self.read_json("chats", Some(query)).await
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<ChatDetail, ClientError> {
        self.read_json::<_, ()>(&format!("chats/{chat_id}"), None).await
    }

    pub async fn update_chat(
        &self,
        chat_id: &str,
        patch: &ChatPatch,
    ) -> Result<ChatSummary, ClientError> {
        let builder = self.request(Method::PUT, &format!("chats/{chat_id}"))?.json(patch);
        decode_json(self.execute(builder).await?).await
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &format!("chats/{chat_id}"))?;
        self.execute(builder).await.map(drop)
    }

    pub async fn export_chat(&self, chat_id: &str) -> Result<ChatExport, ClientError> {
        self.read_json::<_, ()>(&format!("chats/{chat_id}/export"), None)
            .await
    }

    pub async fn archive_chat(&self, chat_id: &str, archived: bool) -> Result<(), ClientError> {
        let builder = self
            .request(Method::POST, &format!("chats/{chat_id}/archive"))?
            .query(&[("archived", archived)]);
        self.execute(builder).await.map(drop)
    }

    // projects

    pub async fn list_projects(&self, include_archived: bool) -> Result<Vec<Project>, ClientError> {
        self.read_json("projects", Some(&[("include_archived", include_archived)]))
            .await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<ProjectDetail, ClientError> {
        self.read_json::<_, ()>(&format!("projects/{project_id}"), None)
            .await
    }

    pub async fn create_project(&self, project: &ProjectCreate) -> Result<Project, ClientError> {
        let builder = self.request(Method::POST, "projects")?.json(project);
        decode_json(self.execute(builder).await?).await
    }

    pub async fn update_project(
        &self,
        project_id: &str,
        update: &ProjectUpdate,
    ) -> Result<Project, ClientError> {
        let builder = self
            .request(Method::PUT, &format!("projects/{project_id}"))?
            .json(update);
        decode_json(self.execute(builder).await?).await
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &format!("projects/{project_id}"))?;
        self.execute(builder).await.map(drop)
    }

    pub async fn add_knowledge(
        &self,
        project_id: &str,
        item: &KnowledgeCreate,
    ) -> Result<KnowledgeItem, ClientError> {
        let builder = self
            .request(Method::POST, &format!("projects/{project_id}/knowledge"))?
            .json(item);
        decode_json(self.execute(builder).await?).await
    }

    pub async fn toggle_knowledge(&self, knowledge_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::POST, &format!("knowledge/{knowledge_id}/toggle"))?;
        self.execute(builder).await.map(drop)
    }

    pub async fn delete_knowledge(&self, knowledge_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &format!("knowledge/{knowledge_id}"))?;
        self.execute(builder).await.map(drop)
    }

    // system prompts

    pub async fn list_system_prompts(&self) -> Result<Vec<SavedSystemPrompt>, ClientError> {
        self.read_json::<_, ()>("system-prompts", None).await
    }

    pub async fn create_system_prompt(
        &self,
        prompt: &SystemPromptCreate,
    ) -> Result<SavedSystemPrompt, ClientError> {
        let builder = self.request(Method::POST, "system-prompts")?.json(prompt);
        decode_json(self.execute(builder).await?).await
    }

    // attachments

    pub async fn upload_file(
        &self,
        chat_id: &str,
        filename: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<FileUpload, ClientError> {
        let part = Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(mime_type)?;
        let builder = self
            .request(Method::POST, &format!("chats/{chat_id}/upload"))?
            .multipart(Form::new().part("file", part));
        decode_json(self.execute(builder).await?).await
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &format!("attachments/{attachment_id}"))?;
        self.execute(builder).await.map(drop)
    }

    /// Authorised request with the REST timeout applied.
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self
            .streaming_request(method, path)?
            .timeout(self.config.request_timeout))
    }

    /// Authorised request without a total timeout; streams may run indefinitely.
    fn streaming_request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let authorization = self.credentials.authorization()?;
        Ok(self
            .http_client
            .request(method, self.config.endpoint(path))
            .header(reqwest::header::AUTHORIZATION, authorization))
    }

    /// Send and map non-2xx responses. A 401 ends the session.
    async fn execute(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.credentials.invalidate();
            return Err(ClientError::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn read_json<T, Q>(&self, path: &str, query: Option<&Q>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=self.retry.max_attempts {
            let mut builder = self.request(Method::GET, path)?;
            if let Some(query) = query {
                builder = builder.query(query);
            }

            let result = match self.execute(builder).await {
                Ok(response) => decode_json(response).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < self.retry.max_attempts && should_retry_read(&err) {
                        log::warn!(
                            "Retry attempt {}/{} after error: {}",
                            attempt + 1,
                            self.retry.max_attempts,
                            err
                        );
                        last_error = Some(err);
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::Config("retry max_attempts must be at least 1".into())))
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ChatBackend for ChatApi {
    async fn open_message_stream(
        &self,
        chat_id: &str,
        request: &MessageRequest,
    ) -> Result<ByteStream, ClientError> {
        let path = format!("chats/{chat_id}/messages");
        let mut last_error: Option<ClientError> = None;

        for attempt in 1..=self.retry.max_attempts {
            let builder = self
                .streaming_request(Method::POST, &path)?
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(request);

            match self.execute(builder).await {
                Ok(response) => {
                    log::debug!("Message stream opened for chat {}", chat_id);
                    return Ok(response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(ClientError::from))
                        .boxed());
                }
                Err(err) => {
                    if attempt < self.retry.max_attempts && should_retry_submission(&err) {
                        log::warn!(
                            "Retry attempt {}/{} after error: {}",
                            attempt + 1,
                            self.retry.max_attempts,
                            err
                        );
                        last_error = Some(err);
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::Config("retry max_attempts must be at least 1".into())))
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
        Ok(self.get_chat(chat_id).await?.into_messages())
    }

    async fn create_chat(&self, request: &ChatCreate) -> Result<ChatSummary, ClientError> {
        let builder = self.request(Method::POST, "chats")?.json(request);
        decode_json(self.execute(builder).await?).await
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<(), ClientError> {
        let builder = self
            .request(Method::POST, &format!("messages/{message_id}/edit"))?
            .json(&EditMessage {
                text: text.to_string(),
            });
        self.execute(builder).await.map(drop)
    }

    async fn toggle_message_pair(&self, pair_id: &str, hidden: bool) -> Result<(), ClientError> {
        let builder = self
            .request(Method::POST, &format!("message-pairs/{pair_id}/toggle"))?
            .json(&serde_json::json!({ "hidden": hidden }));
        self.execute(builder).await.map(drop)
    }

    async fn delete_message_pair(&self, pair_id: &str) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &format!("message-pairs/{pair_id}/delete"))?;
        self.execute(builder).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::{AuthScheme, SessionState};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn api(token: Option<&str>) -> ChatApi {
        api_at("http://127.0.0.1:9", token)
    }

    fn api_at(base_url: &str, token: Option<&str>) -> ChatApi {
        let mut config = ClientConfig::default().with_base_url(base_url);
        config.retry = RetryConfig::disabled();
        let credentials = CredentialProvider::new(AuthScheme::Token, token.map(str::to_string));
        ChatApi::new(config, credentials).unwrap()
    }

    /// Answer one request on a loopback port with a canned response.
    /// The handle resolves to the raw request as received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });

        (format!("http://{addr}"), handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= head_end + 4 + content_length
    }

    #[test]
    fn test_request_targets_chat_prefix_with_scheme() {
        let api = api(Some("t0k"));
        let request = api
            .request(Method::GET, "chats/c1")
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            "http://127.0.0.1:9/api/v1/chat/chats/c1"
        );
        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Token t0k"
        );
        assert!(request.timeout().is_some());
    }

    #[test]
    fn test_streaming_request_has_no_total_timeout() {
        let api = api(Some("t0k"));
        let request = api
            .streaming_request(Method::POST, "chats/c1/messages")
            .unwrap()
            .build()
            .unwrap();
        assert!(request.timeout().is_none());
    }

    #[tokio::test]
    async fn test_requests_fail_before_io_without_credential() {
        let api = api(None);
        assert_eq!(api.credentials().session_state(), SessionState::SignedOut);

        let err = api
            .open_message_stream("c1", &MessageRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::NotAuthenticated));
        assert!(matches!(
            api.list_messages("c1").await,
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_response_signs_out() {
        let (base, server) = serve_once("401 Unauthorized", "").await;
        let api = api_at(&base, Some("stale"));
        assert_eq!(api.credentials().session_state(), SessionState::SignedIn);

        let result = api.list_messages("c1").await;
        assert!(matches!(result, Err(ClientError::Unauthorized)));
        assert_eq!(api.credentials().session_state(), SessionState::SignedOut);
        assert!(!api.credentials().is_authenticated());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/chat/chats/c1 HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: token stale"));

        // The next call fails locally instead of replaying the dropped token.
        assert!(matches!(
            api.list_messages("c1").await,
            Err(ClientError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_stream_open_signs_out() {
        let (base, server) = serve_once("401 Unauthorized", "").await;
        let api = api_at(&base, Some("stale"));

        let err = api
            .open_message_stream("c1", &MessageRequest::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Unauthorized));
        assert_eq!(api.credentials().session_state(), SessionState::SignedOut);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/chat/chats/c1/messages HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_login_issues_token_without_authorization() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"access_token":"fresh","user":{"email":"ada@example.com"}}"#,
        )
        .await;
        let api = api_at(&base, None);
        let mut session = api.credentials().subscribe();

        let response = api.login("ada@example.com", "hunter22", true).await.unwrap();
        assert_eq!(response.access_token, "fresh");
        assert_eq!(response.token_type, "bearer");
        assert_eq!(response.user["email"], "ada@example.com");

        assert!(session.has_changed().unwrap());
        assert_eq!(*session.borrow_and_update(), SessionState::SignedIn);
        assert_eq!(api.credentials().authorization().unwrap(), "Token fresh");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/auth/login HTTP/1.1"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        assert!(request.contains(r#""remember_me":true"#));
        assert!(request.contains(r#""email":"ada@example.com""#));
    }

    #[tokio::test]
    async fn test_export_chat_decodes_payload() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{
                "chat_id": "c1",
                "title": "Trip",
                "created_at": "2024-05-01T10:00:00",
                "project": {"id": null, "name": null},
                "messages": [
                    {"role": "user", "created_at": "2024-05-01T10:00:01",
                     "contents": [{"type": "text", "text": "hi", "file_path": null, "mime_type": null}]},
                    {"role": "assistant", "created_at": "2024-05-01T10:00:02",
                     "contents": [{"type": "image", "text": null, "file_path": "up/a.png", "mime_type": "image/png"}]}
                ]
            }"#,
        )
        .await;
        let api = api_at(&base, Some("t0k"));

        let export = api.export_chat("c1").await.unwrap();
        assert_eq!(export.chat_id, "c1");
        assert_eq!(export.project.id, None);
        assert_eq!(export.messages.len(), 2);
        assert_eq!(export.messages[0].contents[0].text.as_deref(), Some("hi"));
        assert_eq!(export.messages[1].contents[0].content_type, "image");
        assert_eq!(
            export.messages[1].contents[0].mime_type.as_deref(),
            Some("image/png")
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/chat/chats/c1/export HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_list_projects_sends_include_archived() {
        let (base, server) = serve_once("200 OK", "[]").await;
        let api = api_at(&base, Some("t0k"));

        assert!(api.list_projects(true).await.unwrap().is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/chat/projects?include_archived=true HTTP/1.1"));
    }
}
