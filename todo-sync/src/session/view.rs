//! The rendered task set and the summaries derived from it.

use crate::session::protocol::{ListId, Priority, Task, TaskId};
use crate::session::reconcile::RequestId;

/// The authoritative task set of one list, as last applied by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskView {
    pub list_id: ListId,
    /// Fetch that produced this set
    pub request: RequestId,
    /// Tasks in server order
    pub tasks: Vec<Task>,
}

/// Completion progress and priority distribution of a task set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl ProgressSummary {
    pub fn count(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// Completed share in whole percent; 0 for an empty list
    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.completed * 100) / self.total) as u8
        }
    }
}

impl std::fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} Tasks Completed", self.completed, self.total)
    }
}

impl TaskView {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn find(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Task ids in render order
    pub fn order(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    /// Proposed full order after moving `task` to `index` (clamped to the end)
    ///
    /// Returns `None` if the task is not part of this view.
    pub fn order_with_move(&self, task: TaskId, index: usize) -> Option<Vec<TaskId>> {
        let mut order = self.order();
        let from = order.iter().position(|id| *id == task)?;
        let id = order.remove(from);
        let to = index.min(order.len());
        order.insert(to, id);
        Some(order)
    }

    pub fn summary(&self) -> ProgressSummary {
        self.tasks
            .iter()
            .fold(ProgressSummary::default(), |mut acc, task| {
                acc.total += 1;
                if task.completed {
                    acc.completed += 1;
                }
                match task.priority {
                    Priority::High => acc.high += 1,
                    Priority::Medium => acc.medium += 1,
                    Priority::Low => acc.low += 1,
                }
                acc
            })
    }
}

/// One line per task: `[x] 10 Milk (Medium, due 2026-10-20)`
pub fn render_task_line(task: &Task) -> String {
    let check = if task.completed { "x" } else { " " };
    match task.due_date {
        Some(due) => format!(
            "[{}] {} {} ({}, due {})",
            check, task.id, task.text, task.priority, due
        ),
        None => format!("[{}] {} {} ({})", check, task.id, task.text, task.priority),
    }
}
