//! Scripted in-memory platform for deterministic tests.
//!
//! [`MockPlatform`] holds conversations, accounts, sessions, reactions and
//! files. Clients opened through [`MockConnector`] share that state, record
//! every call (with a tokio timestamp) and pop injected failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::types::{
    AuthGrant, CodeRequest, LoginToken, PageRequest, RawConversation, RawItem, RawReaction,
    RawUser,
};
use crate::{ApiError, Connector, MessagingApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    Disconnect,
    Me,
    SendCode,
    SignIn,
    CheckPassword,
    ExportLoginToken,
    AcceptLoginToken,
    LogOut,
    Resolve,
    HistoryCount,
    HistoryPage,
    Reactions,
    Download,
    Thumbnail,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub op: MockOp,
    pub at: Instant,
    pub session: Option<String>,
    pub message_id: Option<i64>,
}

struct MockAccount {
    user: RawUser,
    code: String,
    password: Option<String>,
}

#[derive(Default)]
struct MockState {
    conversations: HashMap<i64, (RawConversation, Vec<RawItem>)>,
    accounts: HashMap<String, MockAccount>,
    sessions: HashMap<String, RawUser>,
    login_tokens: HashMap<String, Option<RawUser>>,
    reactions: HashMap<(i64, i64), Vec<RawReaction>>,
    files: HashMap<String, Vec<u8>>,
    thumbnails: HashMap<String, Vec<u8>>,
    failing_files: HashSet<String>,
    scripted: HashMap<MockOp, VecDeque<ApiError>>,
    hide_count: bool,
    calls: Vec<MockCall>,
    open_connections: usize,
    next_id: u64,
}

/// Shared platform state. Cheap to clone.
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            platform: self.clone(),
        }
    }

    pub fn add_conversation(&self, info: RawConversation, mut items: Vec<RawItem>) {
        items.sort_by_key(|i| (i.date, i.id));
        self.lock().conversations.insert(info.id, (info, items));
    }

    /// Append new history to an existing conversation.
    pub fn push_items(&self, conversation_id: i64, items: Vec<RawItem>) {
        let mut state = self.lock();
        if let Some((_, existing)) = state.conversations.get_mut(&conversation_id) {
            existing.extend(items);
            existing.sort_by_key(|i| (i.date, i.id));
        }
    }

    pub fn add_account(&self, phone: &str, user: RawUser, code: &str, password: Option<&str>) {
        self.lock().accounts.insert(
            phone.to_string(),
            MockAccount {
                user,
                code: code.to_string(),
                password: password.map(str::to_string),
            },
        );
    }

    /// Mint a valid session for `user` without a handshake.
    pub fn issue_session(&self, user: RawUser) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let session = format!("session-{}-{}", user.id, state.next_id);
        state.sessions.insert(session.clone(), user);
        session
    }

    pub fn revoke_session(&self, session: &str) {
        self.lock().sessions.remove(session);
    }

    /// Simulate the signed-in device scanning an exported token.
    pub fn scan_login_token(&self, token: &str, user: RawUser) {
        self.lock().login_tokens.insert(token.to_string(), Some(user));
    }

    pub fn set_reactions(&self, conversation_id: i64, message_id: i64, reactions: Vec<RawReaction>) {
        self.lock()
            .reactions
            .insert((conversation_id, message_id), reactions);
    }

    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.lock().files.insert(file_id.to_string(), bytes);
    }

    pub fn add_thumbnail(&self, file_id: &str, bytes: Vec<u8>) {
        self.lock().thumbnails.insert(file_id.to_string(), bytes);
    }

    /// Every download of `file_id` fails with a transient error.
    pub fn fail_file(&self, file_id: &str) {
        self.lock().failing_files.insert(file_id.to_string());
    }

    /// Queue an error returned by the next call of `op`.
    pub fn fail_next(&self, op: MockOp, err: ApiError) {
        self.lock().scripted.entry(op).or_default().push_back(err);
    }

    /// Make `history_count` answer `None`.
    pub fn hide_count(&self) {
        self.lock().hide_count = true;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[derive(Clone)]
pub struct MockConnector {
    platform: MockPlatform,
}

impl Connector for MockConnector {
    fn open(&self, session: Option<&str>) -> Arc<dyn MessagingApi> {
        Arc::new(MockApi {
            platform: self.platform.clone(),
            session: Mutex::new(session.map(str::to_string)),
            pending_phone: Mutex::new(None),
            connected: Mutex::new(false),
        })
    }
}

pub struct MockApi {
    platform: MockPlatform,
    session: Mutex<Option<String>>,
    pending_phone: Mutex<Option<String>>,
    connected: Mutex<bool>,
}

impl MockApi {
    fn session(&self) -> Option<String> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_session(&self, session: String) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    /// Log the call and pop a scripted failure, if any.
    fn enter(&self, op: MockOp, message_id: Option<i64>) -> Result<MutexGuard<'_, MockState>, ApiError> {
        let mut state = self.platform.lock();
        state.calls.push(MockCall {
            op,
            at: Instant::now(),
            session: self.session(),
            message_id,
        });
        if let Some(err) = state.scripted.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(state)
    }

    fn require_user(&self, state: &MockState) -> Result<RawUser, ApiError> {
        self.session()
            .and_then(|s| state.sessions.get(&s).cloned())
            .ok_or_else(|| ApiError::AuthExpired("AUTH_KEY_UNREGISTERED".to_string()))
    }

    fn grant(&self, state: &mut MockState, user: RawUser) -> AuthGrant {
        state.next_id += 1;
        let session = format!("session-{}-{}", user.id, state.next_id);
        state.sessions.insert(session.clone(), user.clone());
        self.set_session(session.clone());
        AuthGrant { session, user }
    }
}

fn in_window(date: DateTime<Utc>, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |s| date >= s) && until.map_or(true, |u| date <= u)
}

#[async_trait]
impl MessagingApi for MockApi {
    async fn connect(&self) -> Result<(), ApiError> {
        let mut state = self.enter(MockOp::Connect, None)?;
        let mut connected = self.connected.lock().unwrap_or_else(|e| e.into_inner());
        if !*connected {
            *connected = true;
            state.open_connections += 1;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ApiError> {
        let mut state = self.enter(MockOp::Disconnect, None)?;
        let mut connected = self.connected.lock().unwrap_or_else(|e| e.into_inner());
        if *connected {
            *connected = false;
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        Ok(())
    }

    async fn me(&self) -> Result<RawUser, ApiError> {
        let state = self.enter(MockOp::Me, None)?;
        self.require_user(&state)
    }

    async fn send_code(&self, phone: &str) -> Result<CodeRequest, ApiError> {
        let state = self.enter(MockOp::SendCode, None)?;
        if !state.accounts.contains_key(phone) {
            return Err(ApiError::Rejected {
                status: 400,
                message: "PHONE_NUMBER_INVALID".to_string(),
            });
        }
        *self.pending_phone.lock().unwrap_or_else(|e| e.into_inner()) = Some(phone.to_string());
        Ok(CodeRequest {
            phone_code_hash: format!("hash-{}", phone),
        })
    }

    async fn sign_in(
        &self,
        phone: &str,
        phone_code_hash: &str,
        code: &str,
    ) -> Result<AuthGrant, ApiError> {
        let mut state = self.enter(MockOp::SignIn, None)?;
        if phone_code_hash != format!("hash-{}", phone) {
            return Err(ApiError::InvalidCode("PHONE_CODE_EXPIRED".to_string()));
        }
        let (user, expected, password) = match state.accounts.get(phone) {
            Some(a) => (a.user.clone(), a.code.clone(), a.password.clone()),
            None => return Err(ApiError::InvalidCode("PHONE_NUMBER_INVALID".to_string())),
        };
        if code != expected {
            return Err(ApiError::InvalidCode("PHONE_CODE_INVALID".to_string()));
        }
        if password.is_some() {
            return Err(ApiError::PasswordRequired);
        }
        Ok(self.grant(&mut state, user))
    }

    async fn check_password(&self, password: &str) -> Result<AuthGrant, ApiError> {
        let mut state = self.enter(MockOp::CheckPassword, None)?;
        let phone = self
            .pending_phone
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ApiError::InvalidCode("no pending sign-in".to_string()))?;
        let (user, expected) = match state.accounts.get(&phone) {
            Some(a) => (a.user.clone(), a.password.clone()),
            None => return Err(ApiError::InvalidCode("PHONE_NUMBER_INVALID".to_string())),
        };
        if expected.as_deref() != Some(password) {
            return Err(ApiError::InvalidCode("PASSWORD_HASH_INVALID".to_string()));
        }
        Ok(self.grant(&mut state, user))
    }

    async fn export_login_token(&self) -> Result<LoginToken, ApiError> {
        let mut state = self.enter(MockOp::ExportLoginToken, None)?;
        state.next_id += 1;
        let token = STANDARD.encode(format!("token-{}", state.next_id));
        state.login_tokens.insert(token.clone(), None);
        Ok(LoginToken {
            token,
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        })
    }

    async fn accept_login_token(&self, token: &str) -> Result<AuthGrant, ApiError> {
        let mut state = self.enter(MockOp::AcceptLoginToken, None)?;
        match state.login_tokens.get(token).cloned() {
            Some(Some(user)) => {
                state.login_tokens.remove(token);
                Ok(self.grant(&mut state, user))
            }
            Some(None) => Err(ApiError::Pending),
            None => Err(ApiError::InvalidCode("AUTH_TOKEN_EXPIRED".to_string())),
        }
    }

    async fn log_out(&self) -> Result<(), ApiError> {
        let mut state = self.enter(MockOp::LogOut, None)?;
        if let Some(session) = self.session() {
            state.sessions.remove(&session);
        }
        Ok(())
    }

    async fn resolve_conversation(&self, reference: &str) -> Result<RawConversation, ApiError> {
        let state = self.enter(MockOp::Resolve, None)?;
        self.require_user(&state)?;
        let wanted = reference.trim_start_matches('@');
        state
            .conversations
            .values()
            .map(|(info, _)| info)
            .find(|info| {
                info.id.to_string() == wanted || info.username.as_deref() == Some(wanted)
            })
            .cloned()
            .ok_or_else(|| ApiError::Access("USERNAME_NOT_OCCUPIED".to_string()))
    }

    async fn history_count(
        &self,
        conversation_id: i64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>, ApiError> {
        let state = self.enter(MockOp::HistoryCount, None)?;
        self.require_user(&state)?;
        if state.hide_count {
            return Ok(None);
        }
        let (_, items) = state
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| ApiError::Access("CHANNEL_INVALID".to_string()))?;
        Ok(Some(
            items.iter().filter(|i| in_window(i.date, since, until)).count() as u64,
        ))
    }

    async fn history_page(
        &self,
        conversation_id: i64,
        request: &PageRequest,
    ) -> Result<Vec<RawItem>, ApiError> {
        let state = self.enter(MockOp::HistoryPage, request.offset_id)?;
        self.require_user(&state)?;
        let (_, items) = state
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| ApiError::Access("CHANNEL_INVALID".to_string()))?;
        Ok(items
            .iter()
            .filter(|i| in_window(i.date, request.since, request.until))
            .filter(|i| request.offset_id.map_or(true, |o| i.id > o))
            .take(request.limit.max(1) as usize)
            .cloned()
            .collect())
    }

    async fn reactions(
        &self,
        conversation_id: i64,
        message_id: i64,
    ) -> Result<Vec<RawReaction>, ApiError> {
        let state = self.enter(MockOp::Reactions, Some(message_id))?;
        self.require_user(&state)?;
        Ok(state
            .reactions
            .get(&(conversation_id, message_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn download(
        &self,
        _conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let state = self.enter(MockOp::Download, Some(message_id))?;
        self.require_user(&state)?;
        if state.failing_files.contains(file_id) {
            return Err(ApiError::Transient("connection reset".to_string()));
        }
        state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ApiError::Rejected {
                status: 404,
                message: format!("file {} not found", file_id),
            })
    }

    async fn download_thumbnail(
        &self,
        _conversation_id: i64,
        message_id: i64,
        file_id: &str,
    ) -> Result<Option<Vec<u8>>, ApiError> {
        let state = self.enter(MockOp::Thumbnail, Some(message_id))?;
        self.require_user(&state)?;
        Ok(state.thumbnails.get(file_id).cloned())
    }
}
