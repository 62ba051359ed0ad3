//! Session lifecycle.
//!
//! A host shares its library or one collection; joiners reach the same rooms
//! through a join code, a QR payload or a bootstrap bundle. Per session the
//! manager walks `Idle → Hosting | Joining → Active → Ended`:
//!
//! - the session document carries metadata, the shared document list, the
//!   roster and presence, and is always bound first
//! - the host writes the session document; joiners watch it, bind shared
//!   documents as they appear and tear down when the host ends the session
//! - every document gets exactly one provider on this device, across all
//!   sessions; rebinding disconnects the previous one first
//! - updates a provider rejects are recorded as [`ConflictInfo`]

use super::code::{
    BootstrapPayload, JoinCode, QrPayload, SeedEntry, encode_song_data, room_name, room_namespace,
};
use super::store::{ConflictInfo, SessionStore};
use super::types::{
    Invitation, JoinRequest, LocalIdentity, SessionEvent, SessionRecord, SessionState, ShareKind,
};
use crate::config::SessionConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SubscriptionId};
use crate::transport::{
    ErrorCause, PeerInfo, ProviderEvent, ProviderEventKind, ProviderFactory, ProviderSpec, Role,
    SyncProvider, TransportKind,
};
use bandstand_crdt::{
    DocName, DocumentStore, Origin, Participant, PresenceState, SessionDoc, UpdateSubscription,
};
use bandstand_types::{SessionId, UserId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Origin of seed states applied from a bootstrap payload.
const BOOTSTRAP_ORIGIN: &str = "bootstrap";

/// Attempts at drawing a session id not already active here.
const CODE_ATTEMPTS: usize = 8;

const META_SESSION_ID: &str = "sessionId";
const META_HOST_ID: &str = "hostId";
const META_KIND: &str = "kind";
const META_CREATED_AT: &str = "createdAt";
const META_EXPIRES_AT: &str = "expiresAt";
const META_STATUS: &str = "status";
const STATUS_OPEN: &str = "open";

/// A provider plus the handlers the manager registered on it.
struct Binding {
    provider: Arc<dyn SyncProvider>,
    handlers: Vec<(ProviderEventKind, SubscriptionId)>,
}

impl Binding {
    async fn close(self) {
        for (kind, id) in &self.handlers {
            self.provider.events().unsubscribe(*kind, *id);
        }
        if let Err(e) = self.provider.disconnect().await {
            warn!("Failed to disconnect provider for {}: {}", self.provider.room(), e);
        }
    }
}

/// Joiner-side observer of the session document.
struct Watcher {
    _subscription: UpdateSubscription,
    task: JoinHandle<()>,
}

struct ActiveSession {
    record: SessionRecord,
    state: SessionState,
    namespace: String,
    local: PeerInfo,
    bindings: HashMap<DocName, Binding>,
    watcher: Option<Watcher>,
}

struct ManagerInner {
    documents: DocumentStore,
    factory: Arc<dyn ProviderFactory>,
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    identity: Mutex<Option<LocalIdentity>>,
    events: EventBus<SessionEvent>,
    sessions: Mutex<HashMap<SessionId, ActiveSession>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let sweeper = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(sweeper) = sweeper.take() {
            sweeper.abort();
        }
        let sessions = self.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values_mut() {
            if let Some(watcher) = session.watcher.take() {
                watcher.task.abort();
            }
        }
    }
}

/// Hosts, joins and tracks sharing sessions. Clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        documents: DocumentStore,
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn SessionStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                documents,
                factory,
                store,
                config,
                identity: Mutex::new(None),
                events: EventBus::new(),
                sessions: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn from_weak(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, ActiveSession>> {
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.inner.events
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.inner.documents
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ── Identity ────────────────────────────────────────────────

    pub fn set_identity(&self, identity: LocalIdentity) {
        *self.inner.identity.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    pub fn identity(&self) -> Option<LocalIdentity> {
        self.inner.identity.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The local identity, creating a transient guest if none is set.
    fn ensure_identity(&self) -> LocalIdentity {
        let mut identity = self.inner.identity.lock().unwrap_or_else(PoisonError::into_inner);
        identity
            .get_or_insert_with(|| {
                let guest = LocalIdentity::guest(&self.inner.config.guest_name_prefix);
                info!("Using guest identity {}", guest.display_name);
                guest
            })
            .clone()
    }

    // ── Queries ─────────────────────────────────────────────────

    /// State of a session on this device. Unknown sessions read as idle.
    pub fn state(&self, session_id: &SessionId) -> SessionState {
        self.sessions()
            .get(session_id)
            .map_or(SessionState::Idle, |s| s.state)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions().get(session_id).map(|s| s.record.clone())
    }

    /// Ids of the sessions currently running here, sorted.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The provider bound to `document` inside a session.
    pub fn provider(
        &self,
        session_id: &SessionId,
        document: &DocName,
    ) -> Option<Arc<dyn SyncProvider>> {
        self.sessions()
            .get(session_id)
            .and_then(|s| s.bindings.get(document))
            .map(|b| Arc::clone(&b.provider))
    }

    /// Documents with a bound provider, sorted.
    pub fn bound_documents(&self, session_id: &SessionId) -> Vec<DocName> {
        let mut names: Vec<DocName> = self
            .sessions()
            .get(session_id)
            .map(|s| s.bindings.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The session whose provider currently owns `document`.
    pub fn owner(&self, document: &DocName) -> Option<SessionId> {
        self.sessions()
            .iter()
            .find(|(_, s)| s.bindings.contains_key(document))
            .map(|(id, _)| id.clone())
    }

    fn session_doc(&self, session_id: &SessionId) -> SyncResult<SessionDoc> {
        if !self.sessions().contains_key(session_id) {
            return Err(SyncError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.inner.documents.session(&DocName::session(session_id)))
    }

    pub fn participants(
        &self,
        session_id: &SessionId,
    ) -> SyncResult<BTreeMap<String, Participant>> {
        Ok(self.session_doc(session_id)?.participants())
    }

    pub fn presence(&self, session_id: &SessionId) -> SyncResult<BTreeMap<String, PresenceState>> {
        Ok(self.session_doc(session_id)?.presence())
    }

    /// Publishes where the local user is in the set.
    pub fn set_presence(&self, session_id: &SessionId, presence: &PresenceState) -> SyncResult<()> {
        let doc = self.session_doc(session_id)?;
        let identity = self.ensure_identity();
        doc.set_presence(&identity.user_id.to_string(), presence)?;
        Ok(())
    }

    /// Rebuilds the invitation of a hosted session.
    pub fn invitation(&self, session_id: &SessionId) -> SyncResult<Invitation> {
        let record = self.hosted_record(session_id)?;
        let code = JoinCode::parse(&format!("{}-{}", record.id, record.join_secret))?;
        invitation(&code, record.transport)
    }

    /// Seed states of every shared document, for joiners without a round trip.
    pub fn bootstrap_payload(&self, session_id: &SessionId) -> SyncResult<BootstrapPayload> {
        let record = self.hosted_record(session_id)?;
        let mut names = vec![record.document()];
        names.extend(record.shared.iter().cloned());
        let seeds: Vec<SeedEntry> = names
            .into_iter()
            .map(|name| SeedEntry {
                state: self.inner.documents.replica(&name).encode_state_as_update(),
                name,
            })
            .collect();
        Ok(BootstrapPayload {
            session_id: record.id,
            join_secret: record.join_secret,
            song_data: encode_song_data(&seeds)?,
        })
    }

    fn hosted_record(&self, session_id: &SessionId) -> SyncResult<SessionRecord> {
        let record = self
            .session(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
        if !record.is_host() {
            return Err(SyncError::InvalidState(format!("not hosting session {session_id}")));
        }
        Ok(record)
    }

    // ── Host ────────────────────────────────────────────────────

    /// Hosts a session on the configured default transport.
    pub async fn host(&self, share: ShareKind) -> SyncResult<Invitation> {
        self.host_on(share, self.inner.config.default_transport).await
    }

    /// Hosts a session sharing `share` over `transport`.
    pub async fn host_on(
        &self,
        share: ShareKind,
        transport: TransportKind,
    ) -> SyncResult<Invitation> {
        let identity = self.ensure_identity();
        let collection_name = share.collection()?;
        let code = self.fresh_code()?;
        let session_id = code.session_id().clone();

        let song_ids = self.inner.documents.collection(&collection_name).song_ids().items();
        let mut shared = vec![collection_name];
        for song_id in song_ids {
            match DocName::song(song_id.as_str()) {
                Ok(name) if !shared.contains(&name) => shared.push(name),
                Ok(_) => {}
                Err(e) => warn!("Skipping song {:?} in shared collection: {}", song_id, e),
            }
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: session_id.clone(),
            host_id: Some(identity.user_id),
            kind: Some(share.clone()),
            created_at: now,
            expires_at: now + self.inner.config.ttl(),
            shared,
            join_secret: code.secret().to_string(),
            role: Role::Host,
            transport,
        };

        {
            let doc = self.inner.documents.session(&record.document());
            write_metadata(&doc, &record, &share)?;
            for name in &record.shared {
                doc.shared_documents().push_unique(&name.to_string());
            }
            doc.upsert_participant(
                &identity.user_id.to_string(),
                &Participant::joined_now(identity.display_name.clone()),
            )?;
        }

        self.inner.store.save_session(&record).await?;
        let shared = record.shared.clone();
        self.start(record, &identity, SessionState::Hosting);
        info!("Hosting session {} over {} with {} documents", session_id, transport, shared.len());

        let mut result = self.bind(&session_id, DocName::session(&session_id)).await;
        for name in shared {
            if result.is_err() {
                break;
            }
            result = self.bind(&session_id, name).await;
        }
        if let Err(e) = result {
            warn!("Failed to host session {}: {}", session_id, e);
            self.abandon(&session_id).await;
            return Err(e);
        }

        invitation(&code, transport)
    }

    fn fresh_code(&self) -> SyncResult<JoinCode> {
        for _ in 0..CODE_ATTEMPTS {
            let code = JoinCode::generate()?;
            if !self.sessions().contains_key(code.session_id()) {
                return Ok(code);
            }
        }
        Err(SyncError::InvalidState("could not allocate a session id".to_string()))
    }

    /// Shares one more document in a hosted session.
    ///
    /// Joiners bind it as soon as the session document reaches them.
    pub async fn add_shared_document(
        &self,
        session_id: &SessionId,
        document: DocName,
    ) -> SyncResult<()> {
        let doc = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
            if !session.record.is_host() {
                return Err(SyncError::InvalidState(format!("not hosting session {session_id}")));
            }
            if !session.record.shared.contains(&document) {
                session.record.shared.push(document.clone());
            }
            self.inner.documents.session(&session.record.document())
        };
        if doc.shared_documents().push_unique(&document.to_string()) {
            self.publish(SessionEvent::SharedDocumentAdded {
                session_id: session_id.clone(),
                document: document.clone(),
            });
        }
        self.persist(session_id).await?;
        self.bind(session_id, document).await
    }

    /// Ends a hosted session: clears the roster, marks the session ended so
    /// joiners leave, then disconnects every provider.
    pub async fn end(&self, session_id: &SessionId) -> SyncResult<()> {
        let record = self.hosted_record(session_id)?;
        {
            let doc = self.inner.documents.session(&record.document());
            doc.clear_participants();
            for user_id in doc.presence().keys() {
                doc.clear_presence(user_id);
            }
            doc.mark_ended();
        }
        info!("Ending session {}", session_id);
        self.finish(session_id, false).await;
        Ok(())
    }

    // ── Join ────────────────────────────────────────────────────

    /// Joins a session and returns its id.
    ///
    /// Shared documents are bound in the background as the session document
    /// lists them.
    pub async fn join(&self, request: JoinRequest) -> SyncResult<SessionId> {
        let (session_id, secret, transport, seeds) = match request {
            JoinRequest::Code { code, transport } => {
                let code = JoinCode::parse(&code)?;
                (code.session_id().clone(), code.secret().to_string(), transport, Vec::new())
            }
            JoinRequest::Qr(raw) => {
                let qr = QrPayload::decode(&raw)?;
                (qr.session_id, qr.join_secret, qr.transport, Vec::new())
            }
            JoinRequest::Bootstrap { payload, transport } => {
                let seeds = payload.seeds()?;
                (payload.session_id, payload.join_secret, transport, seeds)
            }
        };
        if self.sessions().contains_key(&session_id) {
            return Err(SyncError::InvalidState(format!("already in session {session_id}")));
        }

        let identity = self.ensure_identity();
        let origin = Origin::new(BOOTSTRAP_ORIGIN);
        for seed in &seeds {
            self.inner
                .documents
                .replica(&seed.name)
                .apply_update(&seed.state, &origin)?;
        }
        if !seeds.is_empty() {
            debug!("Applied {} seed documents for session {}", seeds.len(), session_id);
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: session_id.clone(),
            host_id: None,
            kind: None,
            created_at: now,
            expires_at: now + self.inner.config.ttl(),
            shared: Vec::new(),
            join_secret: secret,
            role: Role::Joiner,
            transport,
        };
        self.inner.store.save_session(&record).await?;
        self.start(record, &identity, SessionState::Joining);
        info!("Joining session {} over {} as {}", session_id, transport, identity.display_name);

        if let Err(e) = self.connect_joiner(&session_id).await {
            warn!("Failed to join session {}: {}", session_id, e);
            self.abandon(&session_id).await;
            return Err(e);
        }
        Ok(session_id)
    }

    async fn connect_joiner(&self, session_id: &SessionId) -> SyncResult<()> {
        self.bind(session_id, DocName::session(session_id)).await?;
        self.watch(session_id)
    }

    /// Leaves a joined session. Only local providers are disconnected.
    pub async fn leave(&self, session_id: &SessionId) -> SyncResult<()> {
        let record = self
            .session(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
        if record.is_host() {
            return Err(SyncError::InvalidState(format!(
                "host must end session {session_id} instead of leaving"
            )));
        }
        info!("Leaving session {}", session_id);
        self.finish(session_id, false).await;
        Ok(())
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Persisted sessions that have not expired and are not running here.
    pub async fn restorable_sessions(&self, now: DateTime<Utc>) -> SyncResult<Vec<SessionRecord>> {
        let records = self.inner.store.load_sessions().await?;
        let sessions = self.sessions();
        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired(now) && !sessions.contains_key(&r.id))
            .collect())
    }

    /// Reconnects a persisted session after a restart.
    pub async fn resume(&self, record: SessionRecord) -> SyncResult<()> {
        if record.is_expired(Utc::now()) {
            return Err(SyncError::InvalidState(format!("session {} has expired", record.id)));
        }
        if self.sessions().contains_key(&record.id) {
            return Err(SyncError::InvalidState(format!("already in session {}", record.id)));
        }
        let identity = self.ensure_identity();
        let session_id = record.id.clone();
        let host = record.is_host();
        let shared = record.shared.clone();
        let state = if host { SessionState::Hosting } else { SessionState::Joining };
        self.start(record, &identity, state);
        info!("Resuming session {}", session_id);

        let result = if host {
            let mut result = self.bind(&session_id, DocName::session(&session_id)).await;
            for name in shared {
                if result.is_err() {
                    break;
                }
                result = self.bind(&session_id, name).await;
            }
            result
        } else {
            self.connect_joiner(&session_id).await
        };
        if let Err(e) = result {
            warn!("Failed to resume session {}: {}", session_id, e);
            self.deactivate(&session_id).await;
            self.publish_state(&session_id, SessionState::Idle);
            return Err(e);
        }
        Ok(())
    }

    pub async fn record_conflict(&self, conflict: ConflictInfo) -> SyncResult<()> {
        warn!(
            "Conflict in {:?} from {:?}: {}",
            conflict.document, conflict.peer_id, conflict.reason
        );
        self.inner.store.record_conflict(conflict).await
    }

    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictInfo>> {
        self.inner.store.conflicts().await
    }

    async fn persist(&self, session_id: &SessionId) -> SyncResult<()> {
        match self.session(session_id) {
            Some(record) => self.inner.store.save_session(&record).await,
            None => Ok(()),
        }
    }

    // ── Expiry ──────────────────────────────────────────────────

    /// Ends or leaves every session expired at `now` and drops expired
    /// persisted records. Returns the ids removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SyncResult<Vec<SessionId>> {
        let expired: Vec<(SessionId, bool)> = self
            .sessions()
            .values()
            .filter(|s| s.record.is_expired(now))
            .map(|s| (s.record.id.clone(), s.record.is_host()))
            .collect();

        let mut removed = Vec::new();
        for (session_id, host) in expired {
            info!("Session {} expired", session_id);
            if host {
                match self.end(&session_id).await {
                    Ok(()) | Err(SyncError::SessionNotFound(_)) => {}
                    Err(e) => warn!("Failed to end expired session {}: {}", session_id, e),
                }
            } else {
                self.finish(&session_id, false).await;
            }
            removed.push(session_id);
        }

        for record in self.inner.store.load_sessions().await? {
            if record.is_expired(now) && !removed.contains(&record.id) {
                debug!("Dropping expired session record {}", record.id);
                self.inner.store.remove_session(&record.id).await?;
                removed.push(record.id);
            }
        }
        Ok(removed)
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) on the configured interval
    /// until [`shutdown`](Self::shutdown) or the last clone is dropped.
    pub fn start_sweeper(&self) {
        let period = self.inner.config.sweep_interval();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = SessionManager::from_weak(&weak) else {
                    break;
                };
                if let Err(e) = manager.sweep_expired(Utc::now()).await {
                    warn!("Session sweep failed: {}", e);
                }
            }
        });
        let mut sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sweeper.replace(task) {
            previous.abort();
        }
    }

    /// Disconnects every session without ending it; records stay
    /// persisted for [`resume`](Self::resume).
    pub async fn shutdown(&self) {
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        for session_id in self.active_sessions() {
            self.deactivate(&session_id).await;
            self.publish_state(&session_id, SessionState::Idle);
        }
    }

    // ── Internals ───────────────────────────────────────────────

    fn publish(&self, event: SessionEvent) {
        self.inner.events.publish(&event);
    }

    fn publish_state(&self, session_id: &SessionId, state: SessionState) {
        self.publish(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state,
        });
    }

    fn start(&self, record: SessionRecord, identity: &LocalIdentity, state: SessionState) {
        let session_id = record.id.clone();
        let session = ActiveSession {
            namespace: room_namespace(&record.id, &record.join_secret),
            local: PeerInfo::new(identity.user_id.to_string(), Some(identity.display_name.clone())),
            record,
            state,
            bindings: HashMap::new(),
            watcher: None,
        };
        self.sessions().insert(session_id.clone(), session);
        self.publish_state(&session_id, state);
    }

    /// Moves a hosting or joining session to active.
    fn activate(&self, session_id: &SessionId) {
        let changed = match self.sessions().get_mut(session_id) {
            Some(session)
                if matches!(session.state, SessionState::Hosting | SessionState::Joining) =>
            {
                session.state = SessionState::Active;
                true
            }
            _ => false,
        };
        if changed {
            info!("Session {} is active", session_id);
            self.publish_state(session_id, SessionState::Active);
        }
    }

    /// Removes a session and disconnects its providers. Returns whether it
    /// was running.
    async fn deactivate(&self, session_id: &SessionId) -> bool {
        let Some(mut session) = self.sessions().remove(session_id) else {
            return false;
        };
        if let Some(watcher) = session.watcher.take() {
            watcher.task.abort();
        }
        close_bindings(session.bindings).await;
        true
    }

    /// Tears down after a failed host or join.
    async fn abandon(&self, session_id: &SessionId) {
        self.deactivate(session_id).await;
        if let Err(e) = self.inner.store.remove_session(session_id).await {
            warn!("Failed to remove session {}: {}", session_id, e);
        }
        self.publish_state(session_id, SessionState::Idle);
    }

    /// Final teardown of an ended, left or expired session.
    ///
    /// `from_watcher` is set when the joiner's own watcher task calls in, so
    /// the task is detached instead of aborted mid-teardown.
    async fn finish(&self, session_id: &SessionId, from_watcher: bool) -> bool {
        let Some(mut session) = self.sessions().remove(session_id) else {
            return false;
        };
        if let Some(watcher) = session.watcher.take() {
            if !from_watcher {
                watcher.task.abort();
            }
        }
        close_bindings(session.bindings).await;
        if let Err(e) = self.inner.store.remove_session(session_id).await {
            warn!("Failed to remove session {}: {}", session_id, e);
        }
        self.publish_state(session_id, SessionState::Ended);
        self.publish(SessionEvent::Ended {
            session_id: session_id.clone(),
        });
        true
    }

    /// Binds a provider for `document`, disconnecting whichever binding held
    /// it before, in this session or another.
    async fn bind(&self, session_id: &SessionId, document: DocName) -> SyncResult<()> {
        let replica = self.inner.documents.replica(&document);
        let (spec, previous) = {
            let mut sessions = self.sessions();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;
            let spec = ProviderSpec {
                transport: session.record.transport,
                replica,
                room: room_name(&session.namespace, &document),
                role: session.record.role,
                local: session.local.clone(),
            };
            (spec, take_binding(&mut sessions, &document))
        };
        if let Some((owner, previous)) = previous {
            self.release(session_id, &document, owner, previous).await;
        }

        let role = spec.role;
        let provider = self.inner.factory.create(spec)?;
        let binding = Binding {
            handlers: self.attach_handlers(session_id, &document, role, &provider),
            provider,
        };
        if let Err(e) = binding.provider.connect().await {
            binding.close().await;
            return Err(e);
        }

        let outcome = {
            let mut sessions = self.sessions();
            let replaced = if sessions.contains_key(session_id) {
                take_binding(&mut sessions, &document)
            } else {
                None
            };
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.bindings.insert(document.clone(), binding);
                    Ok(replaced)
                }
                None => Err(binding),
            }
        };
        match outcome {
            Ok(replaced) => {
                debug!("Bound {} in session {}", document, session_id);
                if let Some((owner, replaced)) = replaced {
                    self.release(session_id, &document, owner, replaced).await;
                }
                Ok(())
            }
            Err(orphan) => {
                orphan.close().await;
                Err(SyncError::SessionNotFound(session_id.to_string()))
            }
        }
    }

    /// Closes a binding `session_id` took over from `owner`.
    async fn release(
        &self,
        session_id: &SessionId,
        document: &DocName,
        owner: SessionId,
        binding: Binding,
    ) {
        if owner == *session_id {
            debug!("Rebinding {} in session {}", document, session_id);
        } else {
            info!("Moving {} from session {} to {}", document, owner, session_id);
            self.publish(SessionEvent::Warning {
                session_id: owner,
                message: format!("{document} moved to session {session_id}"),
            });
        }
        binding.close().await;
    }

    /// Stores an update a provider could not apply.
    fn spawn_conflict(&self, conflict: ConflictInfo) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to record conflict: {}", conflict.reason);
            return;
        };
        let manager = self.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.record_conflict(conflict).await {
                warn!("Failed to record conflict: {}", e);
            }
        });
    }

    fn attach_handlers(
        &self,
        session_id: &SessionId,
        document: &DocName,
        role: Role,
        provider: &Arc<dyn SyncProvider>,
    ) -> Vec<(ProviderEventKind, SubscriptionId)> {
        let events = provider.events();
        let mut handlers = Vec::new();

        let weak = Arc::downgrade(&self.inner);
        let id = session_id.clone();
        let name = document.clone();
        let warning = events.subscribe(ProviderEventKind::Error, move |event| {
            let ProviderEvent::Error {
                message,
                cause,
                peer,
            } = event
            else {
                return Ok(());
            };
            let Some(manager) = SessionManager::from_weak(&weak) else {
                return Ok(());
            };
            warn!("Provider for {} in session {} failed: {}", name, id, message);
            manager.publish(SessionEvent::Warning {
                session_id: id.clone(),
                message: format!("{name}: {message}"),
            });
            if *cause == ErrorCause::RejectedUpdate {
                manager.spawn_conflict(ConflictInfo {
                    session_id: Some(id.clone()),
                    document: Some(name.clone()),
                    peer_id: peer.clone(),
                    reason: message.clone(),
                    at: Utc::now(),
                });
            }
            Ok(())
        });
        handlers.push((ProviderEventKind::Error, warning));

        if *document != DocName::session(session_id) {
            return handlers;
        }

        let weak = Arc::downgrade(&self.inner);
        let id = session_id.clone();
        let synced = events.subscribe(ProviderEventKind::Synced, move |_| {
            if let Some(manager) = SessionManager::from_weak(&weak) {
                manager.activate(&id);
            }
            Ok(())
        });
        handlers.push((ProviderEventKind::Synced, synced));

        if role != Role::Host {
            return handlers;
        }

        let weak = Arc::downgrade(&self.inner);
        let id = session_id.clone();
        let joined = events.subscribe(ProviderEventKind::PeerConnected, move |event| {
            if let (Some(manager), ProviderEvent::PeerConnected(peer)) =
                (SessionManager::from_weak(&weak), event)
            {
                manager.admit(&id, peer)?;
            }
            Ok(())
        });
        handlers.push((ProviderEventKind::PeerConnected, joined));

        let weak = Arc::downgrade(&self.inner);
        let id = session_id.clone();
        let left = events.subscribe(ProviderEventKind::PeerDisconnected, move |event| {
            if let (Some(manager), ProviderEvent::PeerDisconnected(peer)) =
                (SessionManager::from_weak(&weak), event)
            {
                manager.dismiss(&id, peer);
            }
            Ok(())
        });
        handlers.push((ProviderEventKind::PeerDisconnected, left));

        handlers
    }

    /// Host side: a peer reached the session room.
    fn admit(&self, session_id: &SessionId, peer: &PeerInfo) -> SyncResult<()> {
        let doc = self.session_doc(session_id)?;
        if doc.touch_participant(&peer.peer_id, Utc::now())? {
            return Ok(());
        }
        doc.upsert_participant(&peer.peer_id, &Participant::joined_now(peer.label()))?;
        info!("{} joined session {}", peer.label(), session_id);
        self.publish(SessionEvent::ParticipantJoined {
            session_id: session_id.clone(),
            user_id: peer.peer_id.clone(),
            display_name: peer.label().to_string(),
        });
        Ok(())
    }

    /// Host side: a peer left the session room.
    fn dismiss(&self, session_id: &SessionId, peer: &PeerInfo) {
        let Ok(doc) = self.session_doc(session_id) else {
            return;
        };
        doc.clear_presence(&peer.peer_id);
        if doc.remove_participant(&peer.peer_id) {
            info!("{} left session {}", peer.label(), session_id);
            self.publish(SessionEvent::ParticipantLeft {
                session_id: session_id.clone(),
                user_id: peer.peer_id.clone(),
            });
        }
    }

    /// Starts the joiner's watcher on the session document.
    fn watch(&self, session_id: &SessionId) -> SyncResult<()> {
        let replica = self.inner.documents.replica(&DocName::session(session_id));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        // Initial pass for state that arrived before the watcher.
        let _ = tx.send(());
        let subscription = replica.on_update(move |_| {
            let _ = tx.send(());
        })?;

        let weak = Arc::downgrade(&self.inner);
        let id = session_id.clone();
        let task = tokio::spawn(async move {
            let mut roster = BTreeMap::new();
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                let Some(manager) = SessionManager::from_weak(&weak) else {
                    break;
                };
                if !manager.follow(&id, &mut roster).await {
                    break;
                }
            }
        });

        let mut sessions = self.sessions();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.watcher = Some(Watcher {
                    _subscription: subscription,
                    task,
                });
                Ok(())
            }
            None => {
                task.abort();
                Err(SyncError::SessionNotFound(session_id.to_string()))
            }
        }
    }

    /// One watcher pass. Returns whether to keep watching.
    async fn follow(
        &self,
        session_id: &SessionId,
        roster: &mut BTreeMap<String, Participant>,
    ) -> bool {
        if !self.sessions().contains_key(session_id) {
            return false;
        }
        let Some(shared) = self.observe(session_id, roster) else {
            info!("Session {} was ended by the host", session_id);
            self.finish(session_id, true).await;
            return false;
        };
        if self.refresh_record(session_id, &shared) {
            if let Err(e) = self.persist(session_id).await {
                warn!("Failed to persist session {}: {}", session_id, e);
            }
        }

        for name in shared {
            // A document owned by another session here stays with it.
            let bound = {
                let sessions = self.sessions();
                if !sessions.contains_key(session_id) {
                    return false;
                }
                sessions.values().any(|s| s.bindings.contains_key(&name))
            };
            if bound {
                continue;
            }
            match self.bind(session_id, name.clone()).await {
                Ok(()) => self.publish(SessionEvent::SharedDocumentAdded {
                    session_id: session_id.clone(),
                    document: name,
                }),
                Err(SyncError::SessionNotFound(_)) => return false,
                Err(e) => {
                    warn!("Failed to bind {} in session {}: {}", name, session_id, e);
                    self.publish(SessionEvent::Warning {
                        session_id: session_id.clone(),
                        message: format!("{name}: {e}"),
                    });
                }
            }
        }
        true
    }

    /// Publishes roster changes and returns the shared documents, or `None`
    /// once the host has ended the session.
    fn observe(
        &self,
        session_id: &SessionId,
        roster: &mut BTreeMap<String, Participant>,
    ) -> Option<Vec<DocName>> {
        let doc = self.inner.documents.session(&DocName::session(session_id));
        if doc.is_ended() {
            return None;
        }

        let current = doc.participants();
        for (user_id, participant) in &current {
            if !roster.contains_key(user_id) {
                self.publish(SessionEvent::ParticipantJoined {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                    display_name: participant.display_name.clone(),
                });
            }
        }
        for user_id in roster.keys() {
            if !current.contains_key(user_id) {
                self.publish(SessionEvent::ParticipantLeft {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                });
            }
        }
        *roster = current;

        let shared = doc
            .shared_documents()
            .items()
            .iter()
            .filter_map(|raw| match DocName::parse(raw) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!("Ignoring shared document {:?}: {}", raw, e);
                    None
                }
            })
            .collect();
        Some(shared)
    }

    /// Copies host-written metadata into the joiner's record. Returns
    /// whether anything changed.
    fn refresh_record(&self, session_id: &SessionId, shared: &[DocName]) -> bool {
        let meta = self.inner.documents.session(&DocName::session(session_id)).metadata();
        let host_id = meta.get(META_HOST_ID).and_then(|raw| UserId::parse(&raw).ok());
        let kind = meta.get_json::<ShareKind>(META_KIND).ok().flatten();
        let created_at = meta.get(META_CREATED_AT).and_then(|raw| parse_time(&raw));
        let expires_at = meta.get(META_EXPIRES_AT).and_then(|raw| parse_time(&raw));

        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = session.record.clone();
        let record = &mut session.record;
        if host_id.is_some() {
            record.host_id = host_id;
        }
        if kind.is_some() {
            record.kind = kind;
        }
        if let Some(at) = created_at {
            record.created_at = at;
        }
        if let Some(at) = expires_at {
            record.expires_at = at;
        }
        record.shared = shared.to_vec();
        *record != before
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn write_metadata(doc: &SessionDoc, record: &SessionRecord, share: &ShareKind) -> SyncResult<()> {
    let meta = doc.metadata();
    meta.set(META_SESSION_ID, record.id.as_str());
    if let Some(host_id) = record.host_id {
        meta.set(META_HOST_ID, host_id.to_string());
    }
    meta.set_json(META_KIND, share)?;
    meta.set(META_CREATED_AT, record.created_at.to_rfc3339());
    meta.set(META_EXPIRES_AT, record.expires_at.to_rfc3339());
    meta.set(META_STATUS, STATUS_OPEN);
    Ok(())
}

fn invitation(code: &JoinCode, transport: TransportKind) -> SyncResult<Invitation> {
    Ok(Invitation {
        session_id: code.session_id().clone(),
        join_code: code.clone(),
        qr: QrPayload::new(code, transport).encode()?,
        transport,
        room_namespace: code.room_namespace(),
    })
}

/// Removes the binding of `document` from whichever session holds it.
fn take_binding(
    sessions: &mut HashMap<SessionId, ActiveSession>,
    document: &DocName,
) -> Option<(SessionId, Binding)> {
    sessions
        .iter_mut()
        .find_map(|(id, s)| s.bindings.remove(document).map(|b| (id.clone(), b)))
}

async fn close_bindings(bindings: HashMap<DocName, Binding>) {
    for (document, binding) in bindings {
        debug!("Unbinding {}", document);
        binding.close().await;
    }
}
