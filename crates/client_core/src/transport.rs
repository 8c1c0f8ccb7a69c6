//! Boundary traits consumed by the sync engine and their HTTP implementation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use shared::{
    domain::{EventId, EventKind, RoomId, UserId},
    error::ApiError,
    protocol::{
        AuthData, CreateRoomRequest, Direction, EventIdResponse, InReplyTo, InviteRequest,
        JoinRequest, JoinedMembersResponse, LoginRequest, LoginResponse, MessageContent,
        MessagesResponse, ReadMarkersRequest, RegisterRequest, RelatesTo, RoomIdResponse,
        SpaceChildContent, WhoAmIResponse, HTML_FORMAT, LOGIN_TYPE_DUMMY, MSGTYPE_TEXT,
        SPACE_CHILD_EVENT,
    },
};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{
    error::{AuthError, SyncError, TransportError},
    parse::{history_from_messages, parse_sync_body},
    session::{SessionMode, SessionRequest},
    types::{Credential, RoomHistory, Snapshot},
};

pub const DEFAULT_API_PATH: &str = "/_matrix/client/v3";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &SessionRequest) -> Result<Credential, AuthError>;
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, credential: &Credential) -> Result<Snapshot, SyncError>;
}

/// The message a reply refers to; used for the quoted fallback body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub event_id: EventId,
    pub sender: UserId,
    pub body: String,
}

/// Outbound calls available to handlers. Each is one request, never retried.
#[async_trait]
pub trait RoomActions: Send + Sync {
    async fn accept_invite(
        &self,
        room_id: &RoomId,
        reason: Option<&str>,
    ) -> Result<RoomId, TransportError>;
    async fn decline_invite(&self, room_id: &RoomId) -> Result<(), TransportError>;
    async fn send_message(
        &self,
        room_id: &RoomId,
        content: MessageContent,
    ) -> Result<EventId, TransportError>;
    async fn reply(
        &self,
        room_id: &RoomId,
        in_reply_to: &ReplyTarget,
        body: &str,
    ) -> Result<EventId, TransportError>;
    async fn invite_user(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), TransportError>;
    async fn joined_members(
        &self,
        room_id: &RoomId,
    ) -> Result<JoinedMembersResponse, TransportError>;
}

/// Builds an `m.in_reply_to` message with plain and HTML quote fallbacks.
pub fn reply_content(room_id: &RoomId, target: &ReplyTarget, body: &str) -> MessageContent {
    let mut lines = target.body.lines();
    let first = lines.next().unwrap_or_default();
    let mut quoted_plain = format!("> <{}> {first}", target.sender);
    for line in lines {
        quoted_plain.push_str("\n> ");
        quoted_plain.push_str(line);
    }

    let formatted_body = format!(
        "<mx-reply><blockquote><a href=\"https://matrix.to/#/{room}/{event}\">In reply to</a> \
         <a href=\"https://matrix.to/#/{sender}\">{sender}</a><br>{quoted}</blockquote></mx-reply>{reply}",
        room = room_id,
        event = target.event_id,
        sender = target.sender,
        quoted = escape_html(&target.body),
        reply = escape_html(body),
    );

    MessageContent {
        msgtype: MSGTYPE_TEXT.to_string(),
        body: format!("{quoted_plain}\n\n{body}"),
        format: Some(HTML_FORMAT.to_string()),
        formatted_body: Some(formatted_body),
        relates_to: Some(RelatesTo {
            in_reply_to: InReplyTo {
                event_id: target.event_id.clone(),
            },
        }),
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\n' => escaped.push_str("<br>"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Parameters of a `/rooms/{room}/messages` page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEventsQuery {
    pub direction: Direction,
    pub limit: u32,
    pub from: Option<String>,
    pub to: Option<String>,
    /// JSON-encoded room event filter, passed through verbatim.
    pub filter: Option<String>,
    /// Event types kept from the page; empty keeps everything.
    pub only_types: Vec<String>,
}

impl Default for RoomEventsQuery {
    fn default() -> Self {
        Self {
            direction: Direction::Backward,
            limit: 10,
            from: None,
            to: None,
            filter: None,
            only_types: vec![EventKind::MESSAGE.to_string(), EventKind::MEMBER.to_string()],
        }
    }
}

impl RoomEventsQuery {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("dir", self.direction.as_str().to_string()),
            ("limit", self.limit.to_string()),
        ];
        let optional = [("from", &self.from), ("to", &self.to), ("filter", &self.filter)];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                pairs.push((name, value.to_string()));
            }
        }
        pairs
    }
}

/// reqwest-backed client for one homeserver.
///
/// After a successful [`Authenticator::authenticate`] the credential is kept
/// so room actions can be issued without threading it through handlers.
pub struct HomeserverClient {
    http: Client,
    base: Url,
    api_path: Vec<String>,
    request_timeout: Option<Duration>,
    session: RwLock<Option<Arc<Credential>>>,
}

impl HomeserverClient {
    pub fn new(homeserver: Url) -> Self {
        Self {
            http: Client::new(),
            base: homeserver,
            api_path: split_path(DEFAULT_API_PATH),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            session: RwLock::new(None),
        }
    }

    /// Bounds every request, `/sync` included; `None` waits indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_api_path(mut self, api_path: &str) -> Self {
        self.api_path = split_path(api_path);
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn homeserver(&self) -> &Url {
        &self.base
    }

    pub async fn credential(&self) -> Result<Arc<Credential>, TransportError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotAuthenticated)
    }

    /// Adopts a credential obtained elsewhere.
    pub async fn set_credential(&self, credential: Arc<Credential>) {
        *self.session.write().await = Some(credential);
    }

    pub async fn login(&self, request: &SessionRequest) -> Result<Credential, TransportError> {
        let body = LoginRequest::password(
            request.username.clone(),
            request.password(),
            request.device_id.clone(),
        );
        let response: LoginResponse =
            self.call_anonymous(Method::POST, &["login"], &body).await?;
        Ok(self.credential_from(response))
    }

    pub async fn register(&self, request: &SessionRequest) -> Result<Credential, TransportError> {
        let body = RegisterRequest {
            username: request.username.clone(),
            password: request.password().to_string(),
            auth: AuthData {
                kind: LOGIN_TYPE_DUMMY.to_string(),
            },
            device_id: request.device_id.clone(),
        };
        let response: LoginResponse =
            self.call_anonymous(Method::POST, &["register"], &body).await?;
        Ok(self.credential_from(response))
    }

    pub async fn sync(&self, credential: &Credential) -> Result<Snapshot, SyncError> {
        let (builder, endpoint) =
            self.request(Method::GET, &["sync"], Some(credential.access_token()))?;
        let body = self.send(builder, &endpoint).await?;
        Ok(parse_sync_body(&endpoint, &body)?)
    }

    pub async fn send_room_event<C: Serialize + Sync + ?Sized>(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &C,
    ) -> Result<EventId, TransportError> {
        let txn_id = Uuid::new_v4().simple().to_string();
        let response: EventIdResponse = self
            .call(
                Method::PUT,
                &["rooms", room_id.as_str(), "send", event_type, &txn_id],
                content,
            )
            .await?;
        Ok(response.event_id)
    }

    pub async fn send_message(
        &self,
        room_id: &RoomId,
        content: MessageContent,
    ) -> Result<EventId, TransportError> {
        self.send_room_event(room_id, "m.room.message", &content)
            .await
    }

    pub async fn reply(
        &self,
        room_id: &RoomId,
        in_reply_to: &ReplyTarget,
        body: &str,
    ) -> Result<EventId, TransportError> {
        self.send_message(room_id, reply_content(room_id, in_reply_to, body))
            .await
    }

    pub async fn join_room(
        &self,
        room_id: &RoomId,
        reason: Option<&str>,
    ) -> Result<RoomId, TransportError> {
        let body = JoinRequest {
            reason: reason.map(str::to_string),
        };
        let response: RoomIdResponse = self
            .call(Method::POST, &["rooms", room_id.as_str(), "join"], &body)
            .await?;
        Ok(response.room_id)
    }

    pub async fn leave_room(&self, room_id: &RoomId) -> Result<(), TransportError> {
        self.call_unit(Method::POST, &["rooms", room_id.as_str(), "leave"], &json!({}))
            .await
    }

    pub async fn forget_room(&self, room_id: &RoomId) -> Result<(), TransportError> {
        self.call_unit(Method::POST, &["rooms", room_id.as_str(), "forget"], &json!({}))
            .await
    }

    pub async fn invite_user(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(), TransportError> {
        let body = InviteRequest {
            user_id: user_id.clone(),
        };
        self.call_unit(Method::POST, &["rooms", room_id.as_str(), "invite"], &body)
            .await
    }

    pub async fn create_room(
        &self,
        request: &CreateRoomRequest,
    ) -> Result<RoomId, TransportError> {
        let response: RoomIdResponse = self.call(Method::POST, &["createRoom"], request).await?;
        Ok(response.room_id)
    }

    /// A space is a room whose creation content has type `m.space`.
    pub async fn create_space(
        &self,
        request: &CreateRoomRequest,
    ) -> Result<RoomId, TransportError> {
        let mut request = request.clone();
        request.creation_content = Some(json!({ "type": "m.space" }));
        self.create_room(&request).await
    }

    pub async fn whoami(&self) -> Result<WhoAmIResponse, TransportError> {
        self.call_get(&["account", "whoami"]).await
    }

    pub async fn joined_members(
        &self,
        room_id: &RoomId,
    ) -> Result<JoinedMembersResponse, TransportError> {
        self.call_get(&["rooms", room_id.as_str(), "joined_members"])
            .await
    }

    pub async fn resolve_alias(&self, alias: &str) -> Result<RoomId, TransportError> {
        let response: RoomIdResponse = self.call_get(&["directory", "room", alias]).await?;
        Ok(response.room_id)
    }

    /// One page of room history, filtered to `query.only_types`.
    pub async fn get_room_events(
        &self,
        room_id: &RoomId,
        query: &RoomEventsQuery,
    ) -> Result<RoomHistory, SyncError> {
        let credential = self.credential().await?;
        let mut url = self.endpoint(&["rooms", room_id.as_str(), "messages"])?;
        url.query_pairs_mut().extend_pairs(query.pairs());
        let (builder, endpoint) =
            self.request_url(Method::GET, url, Some(credential.access_token()));
        let bytes = self.send(builder, &endpoint).await?;
        let response: MessagesResponse = decode(&endpoint, &bytes)?;
        Ok(history_from_messages(room_id, response, &query.only_types)?)
    }

    /// Links `room_id` into `space_id` with an `m.space.child` state event.
    pub async fn add_room_to_space(
        &self,
        space_id: &RoomId,
        room_id: &RoomId,
        child: &SpaceChildContent,
    ) -> Result<EventId, TransportError> {
        let response: EventIdResponse = self
            .call(
                Method::PUT,
                &[
                    "rooms",
                    space_id.as_str(),
                    "state",
                    SPACE_CHILD_EVENT,
                    room_id.as_str(),
                ],
                child,
            )
            .await?;
        Ok(response.event_id)
    }

    pub async fn mark_as_read(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<(), TransportError> {
        let body = ReadMarkersRequest {
            fully_read: event_id.clone(),
            read: Some(event_id.clone()),
        };
        self.call_unit(Method::POST, &["rooms", room_id.as_str(), "read_markers"], &body)
            .await
    }

    fn credential_from(&self, response: LoginResponse) -> Credential {
        let homeserver = response
            .home_server
            .unwrap_or_else(|| self.base.to_string());
        Credential::new(
            response.access_token,
            response.user_id,
            response.device_id,
            homeserver,
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(self.api_path.iter().map(String::as_str))
            .extend(segments);
        Ok(url)
    }

    fn request(
        &self,
        method: Method,
        segments: &[&str],
        access_token: Option<&str>,
    ) -> Result<(RequestBuilder, String), TransportError> {
        let url = self.endpoint(segments)?;
        Ok(self.request_url(method, url, access_token))
    }

    fn request_url(
        &self,
        method: Method,
        url: Url,
        access_token: Option<&str>,
    ) -> (RequestBuilder, String) {
        let endpoint = format!("{method} {}", url.path());
        let mut builder = self.http.request(method, url);
        if let Some(limit) = self.request_timeout {
            builder = builder.timeout(limit);
        }
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        (builder, endpoint)
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let request_error = |source| TransportError::Request {
            endpoint: endpoint.to_string(),
            source,
        };
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(request_error)?;
        debug!(endpoint, status = status.as_u16(), bytes = body.len(), "homeserver response");

        if !status.is_success() {
            let api_error: ApiError = serde_json::from_slice(&body).unwrap_or_default();
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                errcode: api_error.errcode,
                error: api_error.error,
            });
        }
        Ok(body.to_vec())
    }

    async fn call_anonymous<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let (builder, endpoint) = self.request(method, segments, None)?;
        let bytes = self.send(builder.json(body), &endpoint).await?;
        decode(&endpoint, &bytes)
    }

    async fn call<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let credential = self.credential().await?;
        let (builder, endpoint) =
            self.request(method, segments, Some(credential.access_token()))?;
        let bytes = self.send(builder.json(body), &endpoint).await?;
        decode(&endpoint, &bytes)
    }

    async fn call_unit<B>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<(), TransportError>
    where
        B: Serialize + ?Sized,
    {
        let credential = self.credential().await?;
        let (builder, endpoint) =
            self.request(method, segments, Some(credential.access_token()))?;
        self.send(builder.json(body), &endpoint).await?;
        Ok(())
    }

    async fn call_get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, TransportError> {
        let credential = self.credential().await?;
        let (builder, endpoint) =
            self.request(Method::GET, segments, Some(credential.access_token()))?;
        let bytes = self.send(builder, &endpoint).await?;
        decode(&endpoint, &bytes)
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(body).map_err(|source| TransportError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

#[async_trait]
impl Authenticator for HomeserverClient {
    async fn authenticate(&self, request: &SessionRequest) -> Result<Credential, AuthError> {
        let credential = match request.mode {
            SessionMode::Login => self.login(request).await?,
            SessionMode::Register => self.register(request).await?,
        };
        self.set_credential(Arc::new(credential.clone())).await;
        Ok(credential)
    }
}

#[async_trait]
impl SnapshotSource for HomeserverClient {
    async fn fetch_snapshot(&self, credential: &Credential) -> Result<Snapshot, SyncError> {
        self.sync(credential).await
    }
}

#[async_trait]
impl RoomActions for HomeserverClient {
    async fn accept_invite(
        &self,
        room_id: &RoomId,
        reason: Option<&str>,
    ) -> Result<RoomId, TransportError> {
        self.join_room(room_id, reason).await
    }

    async fn decline_invite(&self, room_id: &RoomId) -> Result<(), TransportError> {
        self.leave_room(room_id).await
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        content: MessageContent,
    ) -> Result<EventId, TransportError> {
        HomeserverClient::send_message(self, room_id, content).await
    }

    async fn reply(
        &self,
        room_id: &RoomId,
        in_reply_to: &ReplyTarget,
        body: &str,
    ) -> Result<EventId, TransportError> {
        HomeserverClient::reply(self, room_id, in_reply_to, body).await
    }

    async fn invite_user(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<(), TransportError> {
        HomeserverClient::invite_user(self, room_id, user_id).await
    }

    async fn joined_members(
        &self,
        room_id: &RoomId,
    ) -> Result<JoinedMembersResponse, TransportError> {
        HomeserverClient::joined_members(self, room_id).await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
