//! Pure update function for the sync client.
//!
//! `reduce(state, event) -> (state, effects)` performs no I/O. The runtime
//! executes the returned effects and feeds their completions back in as
//! events, so every state change is visible and testable here.

use tracing::{debug, warn};

use crate::session::error::SyncError;
use crate::session::manager::{ListsTicket, SessionContext, SessionManager};
use crate::session::protocol::{
    ChangeAction, ChannelNotification, ListId, Task, TaskDraft, TaskId, TaskPatch, TodoList,
};
use crate::session::reconcile::{FetchOutcome, FetchTicket, ReconcileEngine};
use crate::session::view::TaskView;

/// A user-initiated change sent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddTask {
        list: ListId,
        draft: TaskDraft,
    },
    /// Natural-language add; parsed by the server before the task is created
    AddParsedTask {
        list: ListId,
        text: String,
    },
    UpdateTask {
        list: ListId,
        task: TaskId,
        patch: TaskPatch,
    },
    DeleteTask {
        list: ListId,
        task: TaskId,
    },
    /// Full proposed order of the list
    ReorderTasks {
        list: ListId,
        task_ids: Vec<TaskId>,
    },
    CreateList {
        name: String,
    },
    DeleteList {
        list: ListId,
    },
}

impl Mutation {
    /// Client-side checks; a rejected mutation never reaches the server
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Mutation::AddTask { draft, .. } if draft.text.trim().is_empty() => {
                Err(SyncError::Validation("task text is empty".into()))
            }
            Mutation::AddParsedTask { text, .. } if text.trim().is_empty() => {
                Err(SyncError::Validation("task text is empty".into()))
            }
            Mutation::UpdateTask { patch, .. } if patch.is_empty() => {
                Err(SyncError::Validation("update changes nothing".into()))
            }
            Mutation::UpdateTask { patch, .. }
                if patch.text.as_deref().is_some_and(|t| t.trim().is_empty()) =>
            {
                Err(SyncError::Validation("task text is empty".into()))
            }
            Mutation::ReorderTasks { task_ids, .. } => {
                if task_ids.is_empty() {
                    return Err(SyncError::Validation("reorder needs at least one task".into()));
                }
                let mut seen = std::collections::HashSet::new();
                if let Some(dup) = task_ids.iter().find(|id| !seen.insert(**id)) {
                    return Err(SyncError::Validation(format!(
                        "task {} appears twice in the new order",
                        dup
                    )));
                }
                Ok(())
            }
            Mutation::CreateList { name } if name.trim().is_empty() => {
                Err(SyncError::Validation("list name is empty".into()))
            }
            _ => Ok(()),
        }
    }

    /// List and change tag to notify once the server acknowledges a task mutation
    pub fn task_change(&self) -> Option<(ListId, ChangeAction)> {
        match self {
            Mutation::AddTask { list, .. } | Mutation::AddParsedTask { list, .. } => {
                Some((*list, ChangeAction::Add))
            }
            Mutation::UpdateTask { list, .. } | Mutation::ReorderTasks { list, .. } => {
                Some((*list, ChangeAction::Update))
            }
            Mutation::DeleteTask { list, .. } => Some((*list, ChangeAction::Delete)),
            Mutation::CreateList { .. } | Mutation::DeleteList { .. } => None,
        }
    }
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mutation::AddTask { list, draft } => write!(f, "add '{}' to list {}", draft.text, list),
            Mutation::AddParsedTask { list, text } => write!(f, "add '{}' to list {}", text, list),
            Mutation::UpdateTask { task, .. } => write!(f, "update task {}", task),
            Mutation::DeleteTask { task, .. } => write!(f, "delete task {}", task),
            Mutation::ReorderTasks { list, .. } => write!(f, "reorder list {}", list),
            Mutation::CreateList { name } => write!(f, "create list '{}'", name),
            Mutation::DeleteList { list } => write!(f, "delete list {}", list),
        }
    }
}

/// What the UI layer is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    SignedIn { username: String },
    /// Explicit logout
    SignedOut,
    /// The session was ended by an authentication failure
    AuthFailed(String),
    ListsChanged(Vec<TodoList>),
    ListSelected { list: ListId, name: Option<String> },
    SelectionCleared,
    /// A new authoritative task set for the selected list
    TasksChanged(TaskView),
    /// The server accepted a mutation; a re-fetch follows
    Acknowledged(Mutation),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SignedIn {
        username: String,
    },
    SignedOut,
    /// A new sign-in is taking over; the cached credentials already belong to it
    SessionReplaced,
    SelectList(ListId),
    Notify {
        list: ListId,
        action: ChangeAction,
    },
    /// Push notification scoped to the subscribed list
    Remote(ChannelNotification),
    ChannelConnected,
    ChannelDisconnected,
    ListsFetched {
        ticket: ListsTicket,
        result: Result<Vec<TodoList>, SyncError>,
    },
    TasksFetched {
        ticket: FetchTicket,
        result: Result<Vec<Task>, SyncError>,
    },
    Mutate(Mutation),
    MutationFinished {
        mutation: Mutation,
        result: Result<(), SyncError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Join(ListId),
    Leave(ListId),
    FetchLists(ListsTicket),
    FetchTasks(FetchTicket),
    Submit(Mutation),
    /// Drop the token and the push channel of the ended session
    CloseSession,
    ClearCredentials,
    Render(ViewUpdate),
}

/// Fetch tickets among a batch of effects, in order
pub fn fetch_tickets(effects: &[Effect]) -> Vec<FetchTicket> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::FetchTasks(ticket) => Some(*ticket),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ClientState {
    pub manager: SessionManager,
    pub engine: ReconcileEngine,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &SessionContext {
        self.manager.context()
    }

    /// Rendered tasks of the selected list, if any have been applied
    pub fn view(&self) -> Option<&TaskView> {
        self.engine.view(self.manager.context())
    }

    fn handle(&mut self, event: Event) -> Vec<Effect> {
        if !self.context().is_signed_in() && needs_session(&event) {
            debug!(?event, "ignoring event while signed out");
            return Vec::new();
        }

        match event {
            Event::SignedIn { username } => {
                self.manager.sign_in(&username);
                vec![
                    Effect::FetchLists(self.manager.request_lists()),
                    Effect::Render(ViewUpdate::SignedIn { username }),
                ]
            }

            Event::SignedOut => {
                let mut effects = self.end_session();
                effects.push(Effect::ClearCredentials);
                effects.push(Effect::Render(ViewUpdate::SignedOut));
                effects
            }

            Event::SessionReplaced => {
                let mut effects = self.end_session();
                effects.push(Effect::Render(ViewUpdate::SignedOut));
                effects
            }

            Event::SelectList(list) => {
                let before = self.manager.current_list();
                let mut effects = self.manager.select_list(&mut self.engine, list);
                if before != Some(list) {
                    let name = self.context().list_name(list).map(str::to_string);
                    effects.push(Effect::Render(ViewUpdate::ListSelected { list, name }));
                }
                effects
            }

            Event::Notify { list, action } => self.notify(list, action),

            Event::Remote(ChannelNotification::TaskUpdate { action }) => {
                match self.context().subscribed() {
                    Some(list) => self.notify(list, action),
                    None => {
                        debug!(%action, "task update without a subscription");
                        Vec::new()
                    }
                }
            }

            Event::Remote(ChannelNotification::ListUpdate { .. }) => {
                vec![Effect::FetchLists(self.manager.request_lists())]
            }

            Event::ChannelConnected => self.manager.on_connected(&mut self.engine),

            Event::ChannelDisconnected => {
                self.manager.on_disconnected();
                Vec::new()
            }

            Event::ListsFetched { ticket, .. } if !self.manager.is_current_lists(ticket) => {
                debug!(request = ticket.request, "dropping stale list set");
                Vec::new()
            }

            Event::ListsFetched {
                ticket,
                result: Ok(lists),
            } => {
                let Some(mut effects) = self.manager.apply_lists(ticket, lists.clone()) else {
                    return Vec::new();
                };
                if effects.iter().any(|e| matches!(e, Effect::Leave(_))) {
                    effects.push(Effect::Render(ViewUpdate::SelectionCleared));
                }
                effects.push(Effect::Render(ViewUpdate::ListsChanged(lists)));
                effects
            }

            // The list set is the root of the session; without it the view
            // would silently go stale, so any failure ends the session.
            Event::ListsFetched { result: Err(e), .. } => {
                self.fail_session(format!("Failed to fetch lists: {}", e))
            }

            Event::TasksFetched { ticket, result } => {
                let resolution = self
                    .engine
                    .resolve(self.manager.context(), ticket, result);
                let mut effects = match resolution.outcome {
                    FetchOutcome::Applied => match self.view() {
                        Some(view) => vec![Effect::Render(ViewUpdate::TasksChanged(view.clone()))],
                        None => Vec::new(),
                    },
                    FetchOutcome::Stale => Vec::new(),
                    FetchOutcome::Failed(e) if e.is_auth() => return self.fail_session(e.to_string()),
                    FetchOutcome::Failed(e) => vec![Effect::Render(ViewUpdate::Error(format!(
                        "Failed to fetch tasks for list {}: {}",
                        ticket.list, e
                    )))],
                };
                if let Some(follow_up) = resolution.follow_up {
                    effects.push(Effect::FetchTasks(follow_up));
                }
                effects
            }

            Event::Mutate(mutation) => match mutation.validate() {
                Ok(()) => vec![Effect::Submit(mutation)],
                Err(e) => vec![Effect::Render(ViewUpdate::Error(format!(
                    "Cannot {}: {}",
                    mutation, e
                )))],
            },

            Event::MutationFinished {
                mutation,
                result: Ok(()),
            } => self.acknowledge(mutation),

            Event::MutationFinished {
                result: Err(e), ..
            } if e.is_auth() => self.fail_session(e.to_string()),

            Event::MutationFinished {
                mutation,
                result: Err(e),
            } => {
                warn!(%mutation, error = %e, "mutation failed");
                vec![Effect::Render(ViewUpdate::Error(format!(
                    "Failed to {}: {}",
                    mutation, e
                )))]
            }
        }
    }

    fn notify(&mut self, list: ListId, action: ChangeAction) -> Vec<Effect> {
        self.engine
            .notify(self.manager.context(), list, action)
            .map(Effect::FetchTasks)
            .into_iter()
            .collect()
    }

    /// Server accepted a mutation: re-fetch instead of patching locally
    fn acknowledge(&mut self, mutation: Mutation) -> Vec<Effect> {
        let mut effects = vec![Effect::Render(ViewUpdate::Acknowledged(mutation.clone()))];

        if let Some((list, action)) = mutation.task_change() {
            effects.extend(self.notify(list, action));
            return effects;
        }

        if let Mutation::DeleteList { list } = mutation {
            if self.manager.current_list() == Some(list) {
                effects.extend(self.manager.clear_selection());
                effects.push(Effect::Render(ViewUpdate::SelectionCleared));
            }
        }
        effects.push(Effect::FetchLists(self.manager.request_lists()));
        effects
    }

    fn end_session(&mut self) -> Vec<Effect> {
        let mut effects = self.manager.sign_out();
        self.engine.reset();
        effects.push(Effect::CloseSession);
        effects
    }

    fn fail_session(&mut self, reason: String) -> Vec<Effect> {
        warn!(%reason, "ending session");
        let mut effects = self.end_session();
        effects.push(Effect::ClearCredentials);
        effects.push(Effect::Render(ViewUpdate::AuthFailed(reason)));
        effects
    }
}

/// Events that only make sense inside a signed-in session
fn needs_session(event: &Event) -> bool {
    !matches!(
        event,
        Event::SignedIn { .. } | Event::ChannelConnected | Event::ChannelDisconnected
    )
}

/// Pure reducer: apply one event and return the effects to execute
pub fn reduce(mut state: ClientState, event: Event) -> (ClientState, Vec<Effect>) {
    let effects = state.handle(event);
    (state, effects)
}
