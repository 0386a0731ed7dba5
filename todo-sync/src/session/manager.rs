// List session manager
// Owns which list is open and the push channel subscription for it.
// It is the only component that asks the reconciliation engine for refreshes
// on selection or reconnect.

use tracing::{debug, info};

use crate::session::protocol::{ListId, TodoList};
use crate::session::reconcile::{ReconcileEngine, RequestId};
use crate::session::reducer::Effect;

/// Correlation record for one list-set fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListsTicket {
    pub request: RequestId,
    /// Session generation at issue time
    pub session: u64,
}

/// Explicit session state, passed by reference to the reconciliation engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    user: Option<String>,
    /// Bumped on every sign-in and sign-out
    session: u64,
    selected: Option<ListId>,
    /// Bumped on every selection change and on sign-out
    epoch: u64,
    /// List whose room this connection has joined (or will re-join on reconnect)
    subscribed: Option<ListId>,
    connected: bool,
    lists: Vec<TodoList>,
}

impl SessionContext {
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is_signed_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn selected(&self) -> Option<ListId> {
        self.selected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn subscribed(&self) -> Option<ListId> {
        self.subscribed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn lists(&self) -> &[TodoList] {
        &self.lists
    }

    pub fn list_name(&self, list: ListId) -> Option<&str> {
        self.lists
            .iter()
            .find(|l| l.id == list)
            .map(|l| l.name.as_str())
    }
}

#[derive(Debug, Default)]
pub struct SessionManager {
    ctx: SessionContext,
    next_lists_request: RequestId,
    lists_applied: RequestId,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn current_list(&self) -> Option<ListId> {
        self.ctx.selected
    }

    pub fn sign_in(&mut self, username: &str) {
        info!(username, "session signed in");
        self.ctx.user = Some(username.to_string());
        self.ctx.session += 1;
    }

    /// Drop the session. Every pending fetch becomes stale.
    pub fn sign_out(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(old) = self.ctx.subscribed.take() {
            effects.push(Effect::Leave(old));
        }
        self.ctx.user = None;
        self.ctx.session += 1;
        self.ctx.selected = None;
        self.ctx.lists.clear();
        // The channel belongs to the session and is closed with it
        self.ctx.connected = false;
        self.ctx.epoch += 1;
        effects
    }

    /// Open `list`: release the old subscription, join the new one, fetch its tasks
    ///
    /// Re-selecting the open list does not leave/join again but still refreshes.
    pub fn select_list(&mut self, engine: &mut ReconcileEngine, list: ListId) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.ctx.selected != Some(list) {
            if let Some(old) = self.ctx.subscribed.take() {
                effects.push(Effect::Leave(old));
            }
            self.ctx.selected = Some(list);
            self.ctx.subscribed = Some(list);
            self.ctx.epoch += 1;
            effects.push(Effect::Join(list));
            info!(list, epoch = self.ctx.epoch, "selected list");
        } else {
            debug!(list, "list already selected, refreshing only");
        }

        if let Some(ticket) = engine.refresh(&self.ctx, list) {
            effects.push(Effect::FetchTasks(ticket));
        }
        effects
    }

    /// Close the open list (for example because it was deleted)
    pub fn clear_selection(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(old) = self.ctx.subscribed.take() {
            effects.push(Effect::Leave(old));
        }
        if self.ctx.selected.take().is_some() {
            self.ctx.epoch += 1;
        }
        effects
    }

    /// The transport came back; subscriptions do not survive a reconnect
    pub fn on_connected(&mut self, engine: &mut ReconcileEngine) -> Vec<Effect> {
        self.ctx.connected = true;
        let mut effects = Vec::new();

        if let Some(list) = self.ctx.selected {
            info!(list, "channel connected, re-joining selected list");
            self.ctx.subscribed = Some(list);
            effects.push(Effect::Join(list));
            // Notifications may have been missed while disconnected
            if let Some(ticket) = engine.refresh(&self.ctx, list) {
                effects.push(Effect::FetchTasks(ticket));
            }
        }
        effects
    }

    pub fn on_disconnected(&mut self) {
        info!("channel disconnected");
        self.ctx.connected = false;
    }

    /// Issue a ticket for a fetch of the list set
    pub fn request_lists(&mut self) -> ListsTicket {
        self.next_lists_request += 1;
        ListsTicket {
            request: self.next_lists_request,
            session: self.ctx.session,
        }
    }

    /// A list-set reply may be used only if it belongs to this session and
    /// nothing issued after it has been applied yet
    pub fn is_current_lists(&self, ticket: ListsTicket) -> bool {
        ticket.session == self.ctx.session && ticket.request > self.lists_applied
    }

    /// Apply the reply to `ticket`, or `None` if it is stale
    pub fn apply_lists(&mut self, ticket: ListsTicket, lists: Vec<TodoList>) -> Option<Vec<Effect>> {
        if !self.is_current_lists(ticket) {
            debug!(request = ticket.request, "dropping stale list set");
            return None;
        }
        self.lists_applied = ticket.request;
        Some(self.replace_lists(lists))
    }

    /// Swap in a freshly fetched list set
    ///
    /// If the open list no longer exists the selection is cleared.
    pub fn replace_lists(&mut self, lists: Vec<TodoList>) -> Vec<Effect> {
        self.ctx.lists = lists;
        match self.ctx.selected {
            Some(list) if !self.ctx.lists.iter().any(|l| l.id == list) => {
                info!(list, "selected list no longer exists");
                self.clear_selection()
            }
            _ => Vec::new(),
        }
    }
}
