//! Reconciliation engine: decides when to re-fetch a list's tasks and which
//! fetch results are allowed to replace the rendered set.
//!
//! Notifications carry no entity data, so every trigger results in a full
//! re-fetch. The engine guarantees:
//!
//! - at most one tracked fetch per list and selection epoch; triggers that
//!   arrive while it is pending are coalesced into a single follow-up
//! - a result is applied only if the selection epoch is unchanged, its list
//!   is still selected and no newer request for that list was applied
//! - failures return the list to idle without retrying
//!
//! Freshness is decided by issue order (the monotonic [`RequestId`]), never by
//! arrival order.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::session::error::SyncError;
use crate::session::manager::SessionContext;
use crate::session::protocol::{ChangeAction, ListId, Task};
use crate::session::view::TaskView;

/// Monotonic fetch correlation id
pub type RequestId = u64;

/// Correlation record for one issued task fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub list: ListId,
    pub request: RequestId,
    /// Selection epoch at issue time
    pub epoch: u64,
}

/// What happened to a fetch result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Replaced the rendered set
    Applied,
    /// No longer relevant; dropped without touching the rendered set
    Stale,
    /// The fetch failed; nothing was applied
    Failed(SyncError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: FetchOutcome,
    /// Fetch carrying triggers coalesced while the resolved one was pending
    pub follow_up: Option<FetchTicket>,
}

/// Per-list bookkeeping
#[derive(Debug, Default)]
struct ListSync {
    dirty: bool,
    last_action: Option<ChangeAction>,
    in_flight: Option<FetchTicket>,
    /// A trigger arrived while `in_flight` was pending
    rerun: bool,
    last_applied: RequestId,
}

#[derive(Debug, Default)]
pub struct ReconcileEngine {
    next_request: RequestId,
    lists: HashMap<ListId, ListSync>,
    rendered: Option<TaskView>,
}

impl ReconcileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `list`'s task set changed; schedule a fetch if it is in view
    pub fn notify(
        &mut self,
        ctx: &SessionContext,
        list: ListId,
        action: ChangeAction,
    ) -> Option<FetchTicket> {
        let sync = self.lists.entry(list).or_default();
        sync.dirty = true;
        sync.last_action = Some(action);

        if ctx.selected() != Some(list) {
            debug!(list, %action, "recorded change for list not in view");
            return None;
        }

        self.schedule(ctx, list)
    }

    /// Request a fetch of the selected list without a change tag
    pub fn refresh(&mut self, ctx: &SessionContext, list: ListId) -> Option<FetchTicket> {
        if ctx.selected() != Some(list) {
            return None;
        }
        self.schedule(ctx, list)
    }

    fn schedule(&mut self, ctx: &SessionContext, list: ListId) -> Option<FetchTicket> {
        let epoch = ctx.epoch();
        let sync = self.lists.entry(list).or_default();

        // A fetch issued under an older selection epoch can never be applied,
        // so it does not block a new one.
        if let Some(pending) = sync.in_flight {
            if pending.epoch == epoch {
                sync.rerun = true;
                debug!(list, request = pending.request, "coalesced into pending fetch");
                return None;
            }
        }

        self.next_request += 1;
        let ticket = FetchTicket {
            list,
            request: self.next_request,
            epoch,
        };
        sync.in_flight = Some(ticket);
        sync.rerun = false;
        debug!(list, request = ticket.request, epoch, "issuing task fetch");
        Some(ticket)
    }

    /// Settle a fetch result against the current session context
    pub fn resolve(
        &mut self,
        ctx: &SessionContext,
        ticket: FetchTicket,
        result: Result<Vec<Task>, SyncError>,
    ) -> Resolution {
        let sync = self.lists.entry(ticket.list).or_default();

        let tracked = sync.in_flight == Some(ticket);
        if tracked {
            sync.in_flight = None;
        }

        let relevant = ctx.epoch() == ticket.epoch
            && ctx.selected() == Some(ticket.list)
            && ticket.request > sync.last_applied;

        let outcome = match result {
            // Auth failures end the session even when the result is stale
            Err(e) if e.is_auth() => FetchOutcome::Failed(e),
            _ if !relevant => {
                debug!(
                    list = ticket.list,
                    request = ticket.request,
                    "discarding stale fetch result"
                );
                FetchOutcome::Stale
            }
            Ok(mut tasks) => {
                for task in &mut tasks {
                    task.list_id = ticket.list;
                }
                sync.last_applied = ticket.request;
                if !(tracked && sync.rerun) {
                    sync.dirty = false;
                }
                self.rendered = Some(TaskView {
                    list_id: ticket.list,
                    request: ticket.request,
                    tasks,
                });
                FetchOutcome::Applied
            }
            Err(e) => {
                warn!(list = ticket.list, request = ticket.request, error = %e, "task fetch failed");
                FetchOutcome::Failed(e)
            }
        };

        let wants_follow_up = tracked && sync.rerun;
        if tracked {
            sync.rerun = false;
        }

        let follow_up = match outcome {
            FetchOutcome::Failed(_) => None,
            _ if wants_follow_up => self.refresh(ctx, ticket.list),
            _ => None,
        };

        Resolution { outcome, follow_up }
    }

    /// The rendered set, if it belongs to the selected list
    pub fn view(&self, ctx: &SessionContext) -> Option<&TaskView> {
        self.rendered
            .as_ref()
            .filter(|view| ctx.selected() == Some(view.list_id))
    }

    pub fn is_dirty(&self, list: ListId) -> bool {
        self.lists.get(&list).map(|s| s.dirty).unwrap_or(false)
    }

    pub fn last_action(&self, list: ListId) -> Option<ChangeAction> {
        self.lists.get(&list).and_then(|s| s.last_action)
    }

    pub fn in_flight(&self, list: ListId) -> Option<FetchTicket> {
        self.lists.get(&list).and_then(|s| s.in_flight)
    }

    /// Forget all bookkeeping and the rendered set; request ids keep counting
    pub fn reset(&mut self) {
        self.lists.clear();
        self.rendered = None;
    }
}
