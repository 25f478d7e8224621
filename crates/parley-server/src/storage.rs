//! The relational-store collaborator behind a narrow command/query surface.
//!
//! The store is presumed blocking, so it lives on one dedicated worker
//! thread with a bounded task queue; async callers hand over a closure and
//! await a oneshot completion. Each call is atomic; nothing more is assumed.

use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use parley_protocol::types::{ChannelId, MessageId, PermBits, ServerId, Username};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success { username: Username, has_2fa: bool },
    Needs2Fa { username: Username },
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created(Username),
    Taken,
}

/// Everything the core asks of the relational store.
pub trait Storage: Send + 'static {
    fn register(&mut self, email: &str, display: &str, password: &str) -> RegisterOutcome;
    fn login(&mut self, email: &str, password: &str, hwid: &str) -> LoginOutcome;
    fn validate_session(&mut self, email: &str, password_hash: &str) -> Option<Username>;
    fn verify_totp_login(&mut self, email: &str, code: &str) -> Option<Username>;
    fn trust_device(&mut self, username: &Username, hwid: &str);

    fn add_user_to_default_server(&mut self, username: &Username);
    fn user_servers_json(&mut self, username: &Username) -> String;
    fn server_content_json(&mut self, sid: ServerId) -> String;
    fn create_server(&mut self, name: &str, owner: &Username);
    fn join_server(&mut self, username: &Username, code: &str) -> bool;
    fn create_channel(&mut self, sid: ServerId, name: &str, kind: &str);
    fn delete_channel(&mut self, cid: ChannelId, user: &Username) -> bool;

    fn message_history_json(&mut self, cid: ChannelId) -> String;
    fn save_message(
        &mut self,
        cid: ChannelId,
        sender: &Username,
        msg: &str,
        attachment_id: &str,
        reply_to: MessageId,
    ) -> MessageId;
    fn delete_message(&mut self, mid: MessageId, cid: ChannelId, user: &Username) -> bool;
    fn edit_message(&mut self, mid: MessageId, user: &Username, content: &str) -> bool;
    fn pin_message(&mut self, mid: MessageId, cid: ChannelId, user: &Username, pin: bool) -> bool;

    fn server_members(&mut self, sid: ServerId) -> Vec<Username>;
    fn users_in_server_by_channel(&mut self, cid: ChannelId) -> Vec<Username>;
    fn channel_server(&mut self, cid: ChannelId) -> Option<ServerId>;
    fn permissions(&mut self, sid: ServerId, user: &Username) -> PermBits;
}

type Job = Box<dyn FnOnce(&mut dyn Storage) + Send>;

/// Depth of the worker's task queue; posts beyond it apply backpressure to
/// the posting session instead of growing without bound.
pub const STORAGE_QUEUE_DEPTH: usize = 256;

/// The sole blocking-to-async bridge in the core.
#[derive(Clone)]
pub struct StorageBridge {
    tx: mpsc::Sender<Job>,
}

impl StorageBridge {
    pub fn spawn<S: Storage>(mut store: S) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(STORAGE_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("storage".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&mut store);
                }
            })
            .expect("failed to spawn storage worker thread");
        Self { tx }
    }

    /// Run a closure against the store on the worker thread and await its
    /// result. Errors only when the worker is gone; callers log and answer
    /// with a generic failure, never retry.
    pub async fn query<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Storage) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move |db| {
                let _ = done_tx.send(f(db));
            }))
            .await
            .map_err(|_| anyhow!("storage worker is gone"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("storage worker dropped the task"))
    }
}

// ---------------------------------------------------------------------------
// In-memory reference store
// ---------------------------------------------------------------------------

struct UserRecord {
    username: Username,
    /// Stored opaquely; the reference store compares credentials verbatim.
    password: String,
    /// When 2FA is enabled this holds the code the external authority
    /// currently considers valid.
    totp_code: Option<String>,
    trusted_hwids: HashSet<String>,
}

struct ChannelRecord {
    cid: ChannelId,
    name: String,
    kind: String,
}

struct ServerRecord {
    sid: ServerId,
    name: String,
    code: String,
    owner: Option<Username>,
    members: Vec<Username>,
    channels: Vec<ChannelRecord>,
}

struct MessageRecord {
    mid: MessageId,
    sender: Username,
    msg: String,
    attachment_id: String,
    reply_to: MessageId,
    pinned: bool,
}

/// In-process reference implementation used by the binary and the tests.
/// A production deployment substitutes a real relational store behind the
/// same trait.
pub struct MemoryStore {
    users: HashMap<String, UserRecord>,
    next_tag: HashMap<String, u16>,
    servers: HashMap<ServerId, ServerRecord>,
    channel_index: HashMap<ChannelId, ServerId>,
    messages: HashMap<ChannelId, Vec<MessageRecord>>,
    default_server: ServerId,
    next_server_id: ServerId,
    next_channel_id: ChannelId,
    next_message_id: MessageId,
    next_invite: u32,
}

impl MemoryStore {
    /// An empty store with the default "Global Hub" server every new account
    /// is added to.
    pub fn new() -> Self {
        let mut store = Self {
            users: HashMap::new(),
            next_tag: HashMap::new(),
            servers: HashMap::new(),
            channel_index: HashMap::new(),
            messages: HashMap::new(),
            default_server: 1,
            next_server_id: 1,
            next_channel_id: 1,
            next_message_id: 1,
            next_invite: 1,
        };
        let sid = store.insert_server("Global Hub", None);
        store.default_server = sid;
        store.insert_channel(sid, "general", "text");
        store.insert_channel(sid, "Voice Lounge", "voice");
        store
    }

    fn insert_server(&mut self, name: &str, owner: Option<Username>) -> ServerId {
        let sid = self.next_server_id;
        self.next_server_id += 1;
        let code = format!("INV{:05}", self.next_invite);
        self.next_invite += 1;
        let members = owner.iter().cloned().collect();
        self.servers.insert(
            sid,
            ServerRecord {
                sid,
                name: name.to_string(),
                code,
                owner,
                members,
                channels: Vec::new(),
            },
        );
        sid
    }

    fn insert_channel(&mut self, sid: ServerId, name: &str, kind: &str) -> Option<ChannelId> {
        let cid = self.next_channel_id;
        let server = self.servers.get_mut(&sid)?;
        self.next_channel_id += 1;
        server.channels.push(ChannelRecord {
            cid,
            name: name.to_string(),
            kind: kind.to_string(),
        });
        self.channel_index.insert(cid, sid);
        Some(cid)
    }

}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn register(&mut self, email: &str, display: &str, password: &str) -> RegisterOutcome {
        if email.is_empty() || display.is_empty() || self.users.contains_key(email) {
            return RegisterOutcome::Taken;
        }
        let tag = self.next_tag.entry(display.to_string()).or_insert(1);
        if *tag > 9999 {
            return RegisterOutcome::Taken;
        }
        let username = Username::new(display, *tag);
        *tag += 1;
        self.users.insert(
            email.to_string(),
            UserRecord {
                username: username.clone(),
                password: password.to_string(),
                totp_code: None,
                trusted_hwids: HashSet::new(),
            },
        );
        RegisterOutcome::Created(username)
    }

    fn login(&mut self, email: &str, password: &str, hwid: &str) -> LoginOutcome {
        let Some(user) = self.users.get(email) else {
            return LoginOutcome::Rejected;
        };
        if user.password != password {
            return LoginOutcome::Rejected;
        }
        if user.totp_code.is_some() && !user.trusted_hwids.contains(hwid) {
            return LoginOutcome::Needs2Fa {
                username: user.username.clone(),
            };
        }
        LoginOutcome::Success {
            username: user.username.clone(),
            has_2fa: user.totp_code.is_some(),
        }
    }

    fn validate_session(&mut self, email: &str, password_hash: &str) -> Option<Username> {
        let user = self.users.get(email)?;
        (user.password == password_hash).then(|| user.username.clone())
    }

    fn verify_totp_login(&mut self, email: &str, code: &str) -> Option<Username> {
        let user = self.users.get(email)?;
        let expected = user.totp_code.as_deref()?;
        (!code.is_empty() && expected == code).then(|| user.username.clone())
    }

    fn trust_device(&mut self, username: &Username, hwid: &str) {
        if hwid.is_empty() {
            return;
        }
        for user in self.users.values_mut() {
            if &user.username == username {
                user.trusted_hwids.insert(hwid.to_string());
            }
        }
    }

    fn add_user_to_default_server(&mut self, username: &Username) {
        let sid = self.default_server;
        if let Some(server) = self.servers.get_mut(&sid) {
            if !server.members.contains(username) {
                server.members.push(username.clone());
            }
        }
    }

    fn user_servers_json(&mut self, username: &Username) -> String {
        let mut list: Vec<&ServerRecord> = self
            .servers
            .values()
            .filter(|s| s.members.contains(username))
            .collect();
        list.sort_by_key(|s| s.sid);
        let out: Vec<_> = list
            .iter()
            .map(|s| json!({ "sid": s.sid, "name": s.name, "code": s.code }))
            .collect();
        serde_json::Value::Array(out).to_string()
    }

    fn server_content_json(&mut self, sid: ServerId) -> String {
        let Some(server) = self.servers.get(&sid) else {
            return json!({}).to_string();
        };
        let channels: Vec<_> = server
            .channels
            .iter()
            .map(|c| json!({ "cid": c.cid, "name": c.name, "type": c.kind }))
            .collect();
        json!({ "sid": server.sid, "name": server.name, "channels": channels }).to_string()
    }

    fn create_server(&mut self, name: &str, owner: &Username) {
        self.insert_server(name, Some(owner.clone()));
    }

    fn join_server(&mut self, username: &Username, code: &str) -> bool {
        for server in self.servers.values_mut() {
            if server.code == code {
                if !server.members.contains(username) {
                    server.members.push(username.clone());
                }
                return true;
            }
        }
        false
    }

    fn create_channel(&mut self, sid: ServerId, name: &str, kind: &str) {
        self.insert_channel(sid, name, kind);
    }

    fn delete_channel(&mut self, cid: ChannelId, user: &Username) -> bool {
        let Some(&sid) = self.channel_index.get(&cid) else {
            return false;
        };
        if !self.permissions(sid, user).contains(PermBits::ADMIN) {
            return false;
        }
        if let Some(server) = self.servers.get_mut(&sid) {
            server.channels.retain(|c| c.cid != cid);
        }
        self.channel_index.remove(&cid);
        self.messages.remove(&cid);
        true
    }

    fn message_history_json(&mut self, cid: ChannelId) -> String {
        let out: Vec<_> = self
            .messages
            .get(&cid)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| {
                        json!({
                            "mid": m.mid,
                            "cid": cid,
                            "u": m.sender,
                            "msg": m.msg,
                            "attachment_id": m.attachment_id,
                            "reply_to": m.reply_to,
                            "pinned": m.pinned,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        serde_json::Value::Array(out).to_string()
    }

    fn save_message(
        &mut self,
        cid: ChannelId,
        sender: &Username,
        msg: &str,
        attachment_id: &str,
        reply_to: MessageId,
    ) -> MessageId {
        let mid = self.next_message_id;
        self.next_message_id += 1;
        self.messages.entry(cid).or_default().push(MessageRecord {
            mid,
            sender: sender.clone(),
            msg: msg.to_string(),
            attachment_id: attachment_id.to_string(),
            reply_to,
            pinned: false,
        });
        mid
    }

    fn delete_message(&mut self, mid: MessageId, cid: ChannelId, user: &Username) -> bool {
        let Some(sender) = self
            .messages
            .get(&cid)
            .and_then(|msgs| msgs.iter().find(|m| m.mid == mid))
            .map(|m| m.sender.clone())
        else {
            return false;
        };
        let perms = self
            .channel_index
            .get(&cid)
            .copied()
            .map(|sid| self.permissions(sid, user))
            .unwrap_or(PermBits::NONE);
        let allowed = &sender == user || perms.contains(PermBits::DELETE_MESSAGES);
        if allowed {
            if let Some(msgs) = self.messages.get_mut(&cid) {
                msgs.retain(|m| m.mid != mid);
            }
        }
        allowed
    }

    fn edit_message(&mut self, mid: MessageId, user: &Username, content: &str) -> bool {
        for msgs in self.messages.values_mut() {
            if let Some(message) = msgs.iter_mut().find(|m| m.mid == mid) {
                if &message.sender != user {
                    return false;
                }
                message.msg = content.to_string();
                return true;
            }
        }
        false
    }

    fn pin_message(&mut self, mid: MessageId, cid: ChannelId, user: &Username, pin: bool) -> bool {
        let allowed = self
            .channel_index
            .get(&cid)
            .copied()
            .map(|sid| self.permissions(sid, user))
            .unwrap_or(PermBits::NONE)
            .contains(PermBits::PIN_MESSAGES);
        if !allowed {
            return false;
        }
        if let Some(message) = self
            .messages
            .get_mut(&cid)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.mid == mid))
        {
            message.pinned = pin;
            return true;
        }
        false
    }

    fn server_members(&mut self, sid: ServerId) -> Vec<Username> {
        self.servers
            .get(&sid)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    fn users_in_server_by_channel(&mut self, cid: ChannelId) -> Vec<Username> {
        self.channel_index
            .get(&cid)
            .and_then(|sid| self.servers.get(sid))
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    fn channel_server(&mut self, cid: ChannelId) -> Option<ServerId> {
        self.channel_index.get(&cid).copied()
    }

    fn permissions(&mut self, sid: ServerId, user: &Username) -> PermBits {
        match self.servers.get(&sid) {
            Some(server) if server.owner.as_ref() == Some(user) => PermBits::ADMIN,
            Some(_) => PermBits::NONE,
            None => PermBits::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user() -> (MemoryStore, Username) {
        let mut store = MemoryStore::new();
        let RegisterOutcome::Created(u) = store.register("a@x", "a", "pw") else {
            panic!("register failed");
        };
        store.add_user_to_default_server(&u);
        (store, u)
    }

    #[test]
    fn register_allocates_sequential_tags() {
        let mut store = MemoryStore::new();
        let a = store.register("one@x", "dave", "p");
        let b = store.register("two@x", "dave", "p");
        assert_eq!(a, RegisterOutcome::Created(Username::new("dave", 1)));
        assert_eq!(b, RegisterOutcome::Created(Username::new("dave", 2)));
    }

    #[test]
    fn register_duplicate_email_is_taken() {
        let mut store = MemoryStore::new();
        store.register("a@x", "a", "p");
        assert_eq!(store.register("a@x", "b", "p"), RegisterOutcome::Taken);
    }

    #[test]
    fn login_flows() {
        let (mut store, u) = store_with_user();
        assert_eq!(
            store.login("a@x", "pw", ""),
            LoginOutcome::Success {
                username: u.clone(),
                has_2fa: false
            }
        );
        assert_eq!(store.login("a@x", "wrong", ""), LoginOutcome::Rejected);
        assert_eq!(store.login("nobody@x", "pw", ""), LoginOutcome::Rejected);
    }

    #[test]
    fn login_with_2fa_gates_on_trusted_device() {
        let (mut store, u) = store_with_user();
        store.users.get_mut("a@x").unwrap().totp_code = Some("123456".into());

        assert_eq!(
            store.login("a@x", "pw", "laptop"),
            LoginOutcome::Needs2Fa {
                username: u.clone()
            }
        );
        assert_eq!(store.verify_totp_login("a@x", "000000"), None);
        assert_eq!(store.verify_totp_login("a@x", "123456"), Some(u.clone()));

        store.trust_device(&u, "laptop");
        assert_eq!(
            store.login("a@x", "pw", "laptop"),
            LoginOutcome::Success {
                username: u,
                has_2fa: true
            }
        );
    }

    #[test]
    fn validate_session_compares_stored_credential() {
        let (mut store, u) = store_with_user();
        assert_eq!(store.validate_session("a@x", "pw"), Some(u));
        assert_eq!(store.validate_session("a@x", "nope"), None);
    }

    #[test]
    fn default_server_is_global_hub() {
        let (mut store, u) = store_with_user();
        let json = store.user_servers_json(&u);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["name"], "Global Hub");
    }

    #[test]
    fn join_server_by_code() {
        let (mut store, owner) = store_with_user();
        store.create_server("Team", &owner);
        let RegisterOutcome::Created(guest) = store.register("g@x", "guest", "p") else {
            panic!()
        };
        let code = store
            .servers
            .values()
            .find(|s| s.name == "Team")
            .unwrap()
            .code
            .clone();
        assert!(store.join_server(&guest, &code));
        assert!(!store.join_server(&guest, "BAD"));
        let sid = store.servers.values().find(|s| s.name == "Team").unwrap().sid;
        assert!(store.server_members(sid).contains(&guest));
    }

    #[test]
    fn message_lifecycle_and_permissions() {
        let (mut store, owner) = store_with_user();
        store.create_server("Team", &owner);
        let sid = store.servers.values().find(|s| s.name == "Team").unwrap().sid;
        store.create_channel(sid, "chat", "text");
        let cid = store.channel_server_channels(sid)[0];

        let RegisterOutcome::Created(other) = store.register("o@x", "other", "p") else {
            panic!()
        };
        let mid = store.save_message(cid, &other, "hello", "", 0);

        // Author can edit, a different user cannot.
        assert!(store.edit_message(mid, &other, "hello!"));
        assert!(!store.edit_message(mid, &owner, "hax"));

        // Owner (admin) can pin; plain member cannot.
        assert!(!store.pin_message(mid, cid, &other, true));
        assert!(store.pin_message(mid, cid, &owner, true));

        // Owner can delete someone else's message via admin perms.
        assert!(store.delete_message(mid, cid, &owner));
        assert!(!store.delete_message(mid, cid, &owner)); // already gone
    }

    #[test]
    fn delete_channel_requires_admin() {
        let (mut store, owner) = store_with_user();
        store.create_server("Team", &owner);
        let sid = store.servers.values().find(|s| s.name == "Team").unwrap().sid;
        store.create_channel(sid, "chat", "text");
        let cid = store.channel_server_channels(sid)[0];

        let RegisterOutcome::Created(other) = store.register("o@x", "other", "p") else {
            panic!()
        };
        assert!(!store.delete_channel(cid, &other));
        assert!(store.delete_channel(cid, &owner));
        assert_eq!(store.channel_server(cid), None);
    }

    #[test]
    fn users_in_server_by_channel_resolves_members() {
        let (mut store, u) = store_with_user();
        // Channel 1 belongs to Global Hub.
        let members = store.users_in_server_by_channel(1);
        assert!(members.contains(&u));
        assert!(store.users_in_server_by_channel(999).is_empty());
    }

    impl MemoryStore {
        fn channel_server_channels(&self, sid: ServerId) -> Vec<ChannelId> {
            self.servers
                .get(&sid)
                .map(|s| s.channels.iter().map(|c| c.cid).collect())
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn bridge_round_trips_results() {
        let bridge = StorageBridge::spawn(MemoryStore::new());
        let outcome = bridge
            .query(|db| db.register("bridge@x", "bridge", "pw"))
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Created(Username::new("bridge", 1)));

        let servers = bridge
            .query(|db| {
                let u = Username::new("bridge", 1);
                db.add_user_to_default_server(&u);
                db.user_servers_json(&u)
            })
            .await
            .unwrap();
        assert!(servers.contains("Global Hub"));
    }
}
