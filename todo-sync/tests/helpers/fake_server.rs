//! In-memory stand-in for the to-do server and its push channel.
//!
//! `FakeServer` implements `TodoApi` against shared state and broadcasts a
//! notification through `FakeHub` after every task mutation, the way the real
//! server emits into a list's room. Task fetches can be held and released one
//! by one to force arbitrary response orderings.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use todo_sync_lib::session::{
    api::TodoApi,
    channel::{ChannelConnector, ChannelEvent, ChannelHandle},
    error::SyncError,
    protocol::{
        ChangeAction, ChannelNotification, ChannelRequest, ListId, LoginResponse, Priority,
        ReorderRequest, Task, TaskDraft, TaskId, TaskPatch, TodoList,
    },
};

// ============================================================================
// Push hub
// ============================================================================

struct HubClient {
    token: String,
    events: tokio::sync::mpsc::UnboundedSender<ChannelEvent>,
    room: Arc<Mutex<Option<ListId>>>,
    log: Arc<Mutex<Vec<ChannelRequest>>>,
    online: Arc<AtomicBool>,
}

/// Rooms and connections of the fake push channel
#[derive(Default)]
pub struct FakeHub {
    clients: Mutex<Vec<HubClient>>,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `task_update` to every online connection joined to `list`
    pub fn task_update(&self, list: ListId, action: ChangeAction) {
        for client in self.clients.lock().unwrap().iter() {
            if client.online.load(Ordering::SeqCst) && *client.room.lock().unwrap() == Some(list) {
                let _ = client.events.send(ChannelEvent::Notification(
                    ChannelNotification::TaskUpdate { action },
                ));
            }
        }
    }

    pub fn list_update(&self, action: ChangeAction) {
        for client in self.clients.lock().unwrap().iter() {
            if client.online.load(Ordering::SeqCst) {
                let _ = client
                    .events
                    .send(ChannelEvent::Notification(ChannelNotification::ListUpdate { action }));
            }
        }
    }

    /// Drop `token`'s connection; rooms do not survive
    pub fn disconnect(&self, token: &str) {
        for client in self.clients.lock().unwrap().iter() {
            if client.token == token {
                client.online.store(false, Ordering::SeqCst);
                *client.room.lock().unwrap() = None;
                let _ = client.events.send(ChannelEvent::Disconnected);
            }
        }
    }

    pub fn reconnect(&self, token: &str) {
        for client in self.clients.lock().unwrap().iter() {
            if client.token == token {
                client.online.store(true, Ordering::SeqCst);
                let _ = client.events.send(ChannelEvent::Connected);
            }
        }
    }

    /// Room currently joined by `token`'s latest connection
    pub fn room_of(&self, token: &str) -> Option<ListId> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.token == token)
            .and_then(|c| *c.room.lock().unwrap())
    }

    /// Every request `token`'s connections sent, in order
    pub fn requests_of(&self, token: &str) -> Vec<ChannelRequest> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.token == token)
            .flat_map(|c| c.log.lock().unwrap().clone())
            .collect()
    }
}

/// Connector that plugs runtimes into a shared [`FakeHub`]
pub struct HubConnector(pub Arc<FakeHub>);

impl ChannelConnector for HubConnector {
    fn open(&self, token: &str) -> ChannelHandle {
        let (handle, mut peer) = ChannelHandle::detached();
        let room = Arc::new(Mutex::new(None));
        let log = Arc::new(Mutex::new(Vec::new()));
        let online = Arc::new(AtomicBool::new(true));

        let _ = peer.events.send(ChannelEvent::Connected);
        self.0.clients.lock().unwrap().push(HubClient {
            token: token.to_string(),
            events: peer.events.clone(),
            room: Arc::clone(&room),
            log: Arc::clone(&log),
            online: Arc::clone(&online),
        });

        tokio::spawn(async move {
            while let Some(request) = peer.requests.recv().await {
                // Requests sent while offline never reach the server
                if !online.load(Ordering::SeqCst) {
                    continue;
                }
                log.lock().unwrap().push(request.clone());
                let mut joined = room.lock().unwrap();
                match request {
                    ChannelRequest::JoinList { list_id } => *joined = Some(list_id),
                    ChannelRequest::LeaveList { list_id } if *joined == Some(list_id) => {
                        *joined = None
                    }
                    ChannelRequest::LeaveList { .. } => {}
                }
            }
        });
        handle
    }
}

// ============================================================================
// REST server
// ============================================================================

#[derive(Default)]
struct Store {
    lists: Vec<TodoList>,
    tasks: HashMap<ListId, Vec<Task>>,
    next_id: i64,
}

struct HeldFetch {
    list: ListId,
    release: oneshot::Sender<()>,
}

/// In-memory REST server
pub struct FakeServer {
    hub: Arc<FakeHub>,
    store: Mutex<Store>,
    expired: AtomicBool,
    hold: Mutex<Option<ListId>>,
    held: Mutex<Vec<HeldFetch>>,
    /// Task fetches per (token, list)
    fetches: Mutex<HashMap<(String, ListId), usize>>,
}

impl FakeServer {
    pub fn new(hub: Arc<FakeHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            store: Mutex::new(Store {
                next_id: 100,
                ..Store::default()
            }),
            expired: AtomicBool::new(false),
            hold: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            fetches: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_list(&self, id: ListId, name: &str) {
        let mut store = self.store.lock().unwrap();
        store.lists.push(TodoList {
            id,
            name: name.to_string(),
        });
        store.tasks.entry(id).or_default();
    }

    pub fn put_task(&self, list: ListId, id: TaskId, text: &str, completed: bool) {
        let mut store = self.store.lock().unwrap();
        let tasks = store.tasks.entry(list).or_default();
        let position = tasks.len() as u32;
        tasks.push(Task {
            id,
            list_id: 0,
            text: text.to_string(),
            priority: Priority::Medium,
            due_date: None,
            completed,
            position: Some(position),
        });
    }

    /// Every call from now on answers 401
    pub fn expire_tokens(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    /// Hold task fetches of `list` until released
    pub fn hold_fetches(&self, list: ListId) {
        *self.hold.lock().unwrap() = Some(list);
    }

    pub fn stop_holding(&self) {
        *self.hold.lock().unwrap() = None;
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Let the `index`th held fetch (in arrival order) respond
    pub fn release(&self, index: usize) -> ListId {
        let held = self.held.lock().unwrap().remove(index);
        let _ = held.release.send(());
        held.list
    }

    pub fn fetch_count(&self, token: &str, list: ListId) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&(token.to_string(), list))
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, token: &str) -> Result<(), SyncError> {
        if token.is_empty() {
            return Err(SyncError::Auth("Token is missing!".into()));
        }
        if self.expired.load(Ordering::SeqCst) {
            return Err(SyncError::Auth("Token has expired!".into()));
        }
        Ok(())
    }

    fn list_of(&self, task: TaskId) -> Result<ListId, SyncError> {
        let store = self.store.lock().unwrap();
        store
            .tasks
            .iter()
            .find(|(_, tasks)| tasks.iter().any(|t| t.id == task))
            .map(|(list, _)| *list)
            .ok_or_else(|| SyncError::Validation("Not Found".into()))
    }
}

#[async_trait]
impl TodoApi for FakeServer {
    async fn register(&self, _username: &str, _password: &str) -> Result<String, SyncError> {
        Ok("User registered successfully!".into())
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, SyncError> {
        if password != "secret" {
            return Err(SyncError::Auth("Invalid credentials".into()));
        }
        Ok(LoginResponse {
            token: format!("token-{}", username),
            username: username.to_string(),
        })
    }

    async fn lists(&self, token: &str) -> Result<Vec<TodoList>, SyncError> {
        self.check(token)?;
        Ok(self.store.lock().unwrap().lists.clone())
    }

    async fn create_list(&self, token: &str, name: &str) -> Result<(), SyncError> {
        self.check(token)?;
        {
            let mut store = self.store.lock().unwrap();
            store.next_id += 1;
            let id = store.next_id;
            store.lists.push(TodoList {
                id,
                name: name.to_string(),
            });
        }
        self.hub.list_update(ChangeAction::Add);
        Ok(())
    }

    async fn delete_list(&self, token: &str, list: ListId) -> Result<(), SyncError> {
        self.check(token)?;
        {
            let mut store = self.store.lock().unwrap();
            store.lists.retain(|l| l.id != list);
            store.tasks.remove(&list);
        }
        self.hub.list_update(ChangeAction::Delete);
        Ok(())
    }

    async fn tasks(&self, token: &str, list: ListId) -> Result<Vec<Task>, SyncError> {
        self.check(token)?;
        *self
            .fetches
            .lock()
            .unwrap()
            .entry((token.to_string(), list))
            .or_default() += 1;

        // The response reflects the state when the request arrived
        let snapshot = self
            .store
            .lock()
            .unwrap()
            .tasks
            .get(&list)
            .cloned()
            .ok_or_else(|| SyncError::Validation("Not Found".into()))?;

        let hold = *self.hold.lock().unwrap() == Some(list);
        if hold {
            let (tx, rx) = oneshot::channel();
            self.held.lock().unwrap().push(HeldFetch { list, release: tx });
            let _ = rx.await;
        }
        Ok(snapshot)
    }

    async fn add_task(&self, token: &str, list: ListId, draft: &TaskDraft) -> Result<(), SyncError> {
        self.check(token)?;
        {
            let mut store = self.store.lock().unwrap();
            store.next_id += 1;
            let id = store.next_id;
            let tasks = store
                .tasks
                .get_mut(&list)
                .ok_or_else(|| SyncError::Validation("Not Found".into()))?;
            tasks.push(Task {
                id,
                list_id: 0,
                text: draft.text.clone(),
                priority: draft.priority,
                due_date: draft.due_date,
                completed: false,
                position: None,
            });
        }
        self.hub.task_update(list, ChangeAction::Add);
        Ok(())
    }

    async fn update_task(&self, token: &str, task: TaskId, patch: &TaskPatch) -> Result<(), SyncError> {
        self.check(token)?;
        let list = self.list_of(task)?;
        {
            let mut store = self.store.lock().unwrap();
            if let Some(t) = store
                .tasks
                .get_mut(&list)
                .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task))
            {
                if let Some(text) = &patch.text {
                    t.text = text.clone();
                }
                if let Some(completed) = patch.completed {
                    t.completed = completed;
                }
                if let Some(priority) = patch.priority {
                    t.priority = priority;
                }
                if let Some(due_date) = patch.due_date {
                    t.due_date = due_date;
                }
            }
        }
        self.hub.task_update(list, ChangeAction::Update);
        Ok(())
    }

    async fn delete_task(&self, token: &str, task: TaskId) -> Result<(), SyncError> {
        self.check(token)?;
        let list = self.list_of(task)?;
        if let Some(tasks) = self.store.lock().unwrap().tasks.get_mut(&list) {
            tasks.retain(|t| t.id != task);
        }
        self.hub.task_update(list, ChangeAction::Delete);
        Ok(())
    }

    async fn reorder_tasks(&self, token: &str, request: &ReorderRequest) -> Result<(), SyncError> {
        self.check(token)?;
        {
            let mut store = self.store.lock().unwrap();
            let tasks = store
                .tasks
                .get_mut(&request.list_id)
                .ok_or_else(|| SyncError::Validation("Not Found".into()))?;
            let mut reordered = Vec::with_capacity(tasks.len());
            for (position, id) in request.task_ids.iter().enumerate() {
                if let Some(mut task) = tasks.iter().find(|t| t.id == *id).cloned() {
                    task.position = Some(position as u32);
                    reordered.push(task);
                }
            }
            *tasks = reordered;
        }
        // Reorders are not broadcast; other clients catch up on their next fetch
        Ok(())
    }

    async fn parse_task(&self, token: &str, text: &str) -> Result<TaskDraft, SyncError> {
        self.check(token)?;
        let priority = if text.contains("urgent") {
            Priority::High
        } else {
            Priority::Medium
        };
        Ok(TaskDraft {
            text: text.replace("urgent", "").trim().to_string(),
            priority,
            due_date: None,
        })
    }
}
