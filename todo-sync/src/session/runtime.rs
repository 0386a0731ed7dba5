// Sync runtime
// One task owns ClientState and applies events strictly one at a time. Effects
// that need I/O are spawned and report back through the same input queue, so
// completions are serialized with user actions and channel notifications.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::api::TodoApi;
use crate::session::channel::{ChannelConnector, ChannelEvent, ChannelHandle};
use crate::session::config::DEFAULT_REQUEST_TIMEOUT;
use crate::session::error::SyncError;
use crate::session::manager::SessionContext;
use crate::session::persistence::{CredentialStore, Credentials};
use crate::session::protocol::{ChangeAction, ChannelRequest, ListId, ReorderRequest, TaskDraft};
use crate::session::reducer::{reduce, ClientState, Effect, Event, Mutation, ViewUpdate};
use crate::session::view::TaskView;

/// Buffered view updates per subscriber before it starts lagging
const UPDATE_CAPACITY: usize = 256;

enum Input {
    SignIn(Credentials),
    Event(Event),
    Shutdown,
}

/// Point-in-time copy of the session for UIs that poll instead of subscribing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub context: SessionContext,
    pub view: Option<TaskView>,
}

pub struct SyncRuntime {
    api: Arc<dyn TodoApi>,
    connector: Arc<dyn ChannelConnector>,
    store: Option<CredentialStore>,
    timeout: Duration,
}

impl SyncRuntime {
    pub fn new(api: Arc<dyn TodoApi>, connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            api,
            connector,
            store: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Persist credentials on login and forget them when the session ends
    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Upper bound for each API call, on top of the HTTP client's own timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start the event loop on the current tokio runtime
    pub fn spawn(self) -> (SyncHandle, JoinHandle<()>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let handle = SyncHandle {
            inputs: inputs_tx.clone(),
            updates: updates.clone(),
            snapshot: snapshot_rx,
            api: Arc::clone(&self.api),
            store: self.store.clone(),
        };

        let event_loop = EventLoop {
            api: self.api,
            connector: self.connector,
            store: self.store,
            timeout: self.timeout,
            state: ClientState::new(),
            token: None,
            channel: None,
            inputs_tx: inputs_tx.downgrade(),
            inputs: inputs_rx,
            updates,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(event_loop.run());
        (handle, task)
    }
}

struct EventLoop {
    api: Arc<dyn TodoApi>,
    connector: Arc<dyn ChannelConnector>,
    store: Option<CredentialStore>,
    timeout: Duration,
    state: ClientState,
    token: Option<String>,
    channel: Option<ChannelHandle>,
    /// Weak so the loop ends once every handle is dropped
    inputs_tx: mpsc::WeakUnboundedSender<Input>,
    inputs: mpsc::UnboundedReceiver<Input>,
    updates: broadcast::Sender<ViewUpdate>,
    snapshot: watch::Sender<Snapshot>,
}

impl EventLoop {
    async fn run(mut self) {
        info!("sync runtime started");
        loop {
            let input = tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                Some(event) = next_channel_event(&mut self.channel) => Input::Event(event.into()),
            };

            match input {
                Input::Shutdown => break,
                Input::SignIn(credentials) => self.sign_in(credentials),
                Input::Event(event) => self.dispatch(event),
            }
        }

        // Release the subscription before the channel goes away
        if self.state.context().is_signed_in() {
            if let (Some(list), Some(channel)) =
                (self.state.context().subscribed(), self.channel.as_ref())
            {
                channel.send(ChannelRequest::LeaveList { list_id: list });
            }
        }
        info!("sync runtime stopped");
    }

    fn sign_in(&mut self, credentials: Credentials) {
        if self.state.context().is_signed_in() {
            debug!("replacing the current session");
            self.dispatch(Event::SessionReplaced);
        }
        self.channel = Some(self.connector.open(&credentials.token));
        self.token = Some(credentials.token);
        self.dispatch(Event::SignedIn {
            username: credentials.username,
        });
    }

    fn dispatch(&mut self, event: Event) {
        debug!(?event, "dispatch");
        let state = std::mem::take(&mut self.state);
        let (state, effects) = reduce(state, event);
        self.state = state;

        for effect in effects {
            self.execute(effect);
        }

        self.snapshot.send_replace(Snapshot {
            context: self.state.context().clone(),
            view: self.state.view().cloned(),
        });
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Join(list) => self.emit(ChannelRequest::JoinList { list_id: list }),
            Effect::Leave(list) => self.emit(ChannelRequest::LeaveList { list_id: list }),
            Effect::FetchLists(ticket) => self.spawn_request(
                |api, token| async move { api.lists(&token).await },
                move |result| Event::ListsFetched { ticket, result },
            ),
            Effect::FetchTasks(ticket) => self.spawn_request(
                move |api, token| async move { api.tasks(&token, ticket.list).await },
                move |result| Event::TasksFetched { ticket, result },
            ),
            Effect::Submit(mutation) => {
                let finished = mutation.clone();
                self.spawn_request(
                    move |api, token| async move { perform_mutation(api.as_ref(), &token, &mutation).await },
                    move |result| Event::MutationFinished {
                        mutation: finished,
                        result,
                    },
                )
            }
            Effect::CloseSession => {
                self.token = None;
                self.channel = None;
            }
            Effect::ClearCredentials => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.clear() {
                        warn!(error = %e, "failed to clear cached credentials");
                    }
                }
            }
            Effect::Render(update) => {
                // No subscribers is fine; snapshots still carry the state
                let _ = self.updates.send(update);
            }
        }
    }

    fn emit(&self, request: ChannelRequest) {
        match &self.channel {
            Some(channel) if channel.send(request.clone()) => {}
            _ => debug!(?request, "no channel, request dropped"),
        }
    }

    /// Run one API call in the background and feed its completion back as an event
    fn spawn_request<T, F, Fut>(&self, call: F, finish: impl FnOnce(Result<T, SyncError>) -> Event + Send + 'static)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn TodoApi>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let Some(token) = self.token.clone() else {
            debug!("not signed in, request skipped");
            return;
        };
        let Some(inputs) = self.inputs_tx.upgrade() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let timeout = self.timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, call(api, token)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Transport(format!(
                    "request timed out after {}s",
                    timeout.as_secs_f32()
                ))),
            };
            // The loop is gone on shutdown; nothing left to report to
            let _ = inputs.send(Input::Event(finish(result)));
        });
    }
}

async fn next_channel_event(channel: &mut Option<ChannelHandle>) -> Option<ChannelEvent> {
    match channel {
        Some(channel) => channel.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Execute one mutation against the server
pub async fn perform_mutation(
    api: &dyn TodoApi,
    token: &str,
    mutation: &Mutation,
) -> Result<(), SyncError> {
    match mutation {
        Mutation::AddTask { list, draft } => api.add_task(token, *list, draft).await,
        Mutation::AddParsedTask { list, text } => {
            let draft = match api.parse_task(token, text).await {
                Ok(draft) if !draft.text.trim().is_empty() => draft,
                Ok(_) => TaskDraft::new(text.clone()),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "task parsing unavailable, adding as plain text");
                    TaskDraft::new(text.clone())
                }
            };
            api.add_task(token, *list, &draft).await
        }
        Mutation::UpdateTask { task, patch, .. } => api.update_task(token, *task, patch).await,
        Mutation::DeleteTask { task, .. } => api.delete_task(token, *task).await,
        Mutation::ReorderTasks { list, task_ids } => {
            let request = ReorderRequest {
                list_id: *list,
                task_ids: task_ids.clone(),
            };
            api.reorder_tasks(token, &request).await
        }
        Mutation::CreateList { name } => api.create_list(token, name.trim()).await,
        Mutation::DeleteList { list } => api.delete_list(token, *list).await,
    }
}

/// Cloneable front door to a running [`SyncRuntime`]
#[derive(Clone)]
pub struct SyncHandle {
    inputs: mpsc::UnboundedSender<Input>,
    updates: broadcast::Sender<ViewUpdate>,
    snapshot: watch::Receiver<Snapshot>,
    api: Arc<dyn TodoApi>,
    store: Option<CredentialStore>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    fn send(&self, input: Input) -> Result<()> {
        self.inputs
            .send(input)
            .map_err(|_| anyhow::anyhow!("sync runtime has stopped"))
    }

    fn send_event(&self, event: Event) -> Result<()> {
        self.send(Input::Event(event))
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<String> {
        self.api
            .register(username, password)
            .await
            .with_context(|| format!("Failed to register '{}'", username))
    }

    /// Log in, cache the credentials and start the session
    pub async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        let reply = self
            .api
            .login(username, password)
            .await
            .with_context(|| format!("Failed to log in as '{}'", username))?;
        let credentials = Credentials {
            token: reply.token,
            username: reply.username,
        };
        if let Some(store) = &self.store {
            store.save(&credentials)?;
        }
        self.sign_in_with(credentials.clone())?;
        Ok(credentials)
    }

    /// Start a session with already known credentials
    pub fn sign_in_with(&self, credentials: Credentials) -> Result<()> {
        self.send(Input::SignIn(credentials))
    }

    /// Resume the cached session, if any. Returns the username.
    pub fn resume(&self) -> Result<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load()? {
            Some(credentials) => {
                let username = credentials.username.clone();
                self.sign_in_with(credentials)?;
                Ok(Some(username))
            }
            None => Ok(None),
        }
    }

    pub fn logout(&self) -> Result<()> {
        self.send_event(Event::SignedOut)
    }

    pub fn select_list(&self, list: ListId) -> Result<()> {
        self.send_event(Event::SelectList(list))
    }

    /// Mark a list's tasks as changed by something outside the push channel
    pub fn notify(&self, list: ListId, action: ChangeAction) -> Result<()> {
        self.send_event(Event::Notify { list, action })
    }

    pub fn submit(&self, mutation: Mutation) -> Result<()> {
        self.send_event(Event::Mutate(mutation))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Input::Shutdown)
    }
}
