// todo-sync: command line client for shared to-do lists
//
// Commands:
//   todo-sync register|login <username> [password]
//   todo-sync logout
//   todo-sync lists | new-list <name> | delete-list <id>
//   todo-sync tasks <list>
//   todo-sync add <list> <text...> [--priority <p>] [--due <YYYY-MM-DD>] [--parse]
//   todo-sync done|undo|rm <list> <task>
//   todo-sync edit <list> <task> [--text <t>] [--priority <p>] [--due <YYYY-MM-DD> | --no-due]
//   todo-sync reorder <list> <task ids...>
//   todo-sync move <list> <task> <index>
//   todo-sync watch [list]

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use todo_sync_lib::session::{
    api::HttpApi,
    channel::WebSocketConnector,
    config::Config,
    persistence::CredentialStore,
    protocol::{ListId, Priority, TaskDraft, TaskId, TaskPatch, TodoList},
    reducer::{Mutation, ViewUpdate},
    runtime::{SyncHandle, SyncRuntime},
    view::{render_task_line, TaskView},
};

#[derive(Parser)]
#[command(name = "todo-sync")]
#[command(about = "Realtime client for shared to-do lists", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Register {
        username: String,
        /// Prompted for when omitted
        password: Option<String>,
    },
    /// Log in and cache the session token
    Login {
        username: String,
        /// Prompted for when omitted
        password: Option<String>,
    },
    /// Forget the cached session
    Logout,
    /// Show your lists
    Lists,
    /// Create a list
    NewList {
        #[arg(required = true)]
        name: Vec<String>,
    },
    /// Delete a list and its tasks
    DeleteList { list: ListId },
    /// Show the tasks of a list
    Tasks { list: ListId },
    /// Add a task
    Add {
        list: ListId,
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Let the server extract priority and due date from the text
        #[arg(long, conflicts_with_all = ["priority", "due"])]
        parse: bool,
    },
    /// Mark a task completed
    Done { list: ListId, task: TaskId },
    /// Mark a task not completed
    Undo { list: ListId, task: TaskId },
    /// Delete a task
    Rm { list: ListId, task: TaskId },
    /// Change a task's text, priority or due date
    Edit {
        list: ListId,
        task: TaskId,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Remove the due date
        #[arg(long, conflicts_with = "due")]
        no_due: bool,
    },
    /// Set the full order of a list's tasks
    Reorder {
        list: ListId,
        #[arg(required = true)]
        tasks: Vec<TaskId>,
    },
    /// Move a task to a new position (0-based)
    Move {
        list: ListId,
        task: TaskId,
        index: usize,
    },
    /// Follow a list live and edit it interactively
    Watch { list: Option<ListId> },
}

/// How long one-shot commands wait for the server
const WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("todo_sync_lib=warn,todo_sync=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", config.state_dir().display()))?;

    let api = Arc::new(HttpApi::new(&config)?);
    let (handle, task) = SyncRuntime::new(api, Arc::new(WebSocketConnector::new(&config.channel_url)))
        .with_store(CredentialStore::new(&config))
        .with_timeout(config.request_timeout)
        .spawn();

    let result = run(cli.command, &handle).await;

    handle.shutdown().ok();
    task.await.ok();
    result
}

async fn run(command: Commands, handle: &SyncHandle) -> Result<()> {
    match command {
        Commands::Register { username, password } => {
            let password = password_or_prompt(password)?;
            let message = handle.register(&username, &password).await?;
            println!("{}", message);
        }

        Commands::Login { username, password } => {
            let password = password_or_prompt(password)?;
            let mut updates = handle.subscribe();
            let credentials = handle.login(&username, &password).await?;
            let lists = wait_for_lists(&mut updates).await?;
            println!("Logged in as {} ({} lists)", credentials.username, lists.len());
        }

        Commands::Logout => {
            let mut updates = handle.subscribe();
            if resume(handle)?.is_some() {
                handle.logout()?;
                // An already expired token ends the session on its own
                if let Err(e) =
                    wait_for(&mut updates, |u| matches!(u, ViewUpdate::SignedOut).then_some(()))
                        .await
                {
                    tracing::debug!(error = %e, "session ended before logout");
                }
            }
            println!("Logged out");
        }

        Commands::Lists => {
            let lists = start_session(handle).await?;
            print_lists(&lists);
        }

        Commands::NewList { name } => {
            let mut updates = start_session_keep(handle).await?;
            submit(handle, &mut updates, Mutation::CreateList { name: name.join(" ") }).await?;
            print_lists(&wait_for_lists(&mut updates).await?);
        }

        Commands::DeleteList { list } => {
            let mut updates = start_session_keep(handle).await?;
            submit(handle, &mut updates, Mutation::DeleteList { list }).await?;
            print_lists(&wait_for_lists(&mut updates).await?);
        }

        Commands::Tasks { list } => {
            let mut updates = start_session_keep(handle).await?;
            print_tasks(&open_list(handle, &mut updates, list).await?);
        }

        Commands::Add {
            list,
            text,
            priority,
            due,
            parse,
        } => {
            let text = text.join(" ");
            let mutation = if parse {
                Mutation::AddParsedTask { list, text }
            } else {
                Mutation::AddTask {
                    list,
                    draft: TaskDraft {
                        priority: priority.unwrap_or_default(),
                        due_date: due,
                        ..TaskDraft::new(text)
                    },
                }
            };
            edit_and_show(handle, list, mutation).await?;
        }

        Commands::Done { list, task } => {
            let patch = TaskPatch::completed(true);
            edit_and_show(handle, list, Mutation::UpdateTask { list, task, patch }).await?;
        }

        Commands::Undo { list, task } => {
            let patch = TaskPatch::completed(false);
            edit_and_show(handle, list, Mutation::UpdateTask { list, task, patch }).await?;
        }

        Commands::Rm { list, task } => {
            edit_and_show(handle, list, Mutation::DeleteTask { list, task }).await?;
        }

        Commands::Edit {
            list,
            task,
            text,
            priority,
            due,
            no_due,
        } => {
            let patch = TaskPatch {
                text,
                priority,
                due_date: if no_due { Some(None) } else { due.map(Some) },
                completed: None,
            };
            edit_and_show(handle, list, Mutation::UpdateTask { list, task, patch }).await?;
        }

        Commands::Reorder { list, tasks } => {
            edit_and_show(handle, list, Mutation::ReorderTasks { list, task_ids: tasks }).await?;
        }

        Commands::Move { list, task, index } => {
            let mut updates = start_session_keep(handle).await?;
            let view = open_list(handle, &mut updates, list).await?;
            let task_ids = view
                .order_with_move(task, index)
                .ok_or_else(|| anyhow!("Task {} is not in list {}", task, list))?;
            submit(handle, &mut updates, Mutation::ReorderTasks { list, task_ids }).await?;
            print_tasks(&wait_for_tasks(&mut updates).await?);
        }

        Commands::Watch { list } => watch(handle, list).await?,
    }
    Ok(())
}

// ============================================================================
// Session helpers
// ============================================================================

fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("Password: ");
    io::stderr().flush().ok();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn resume(handle: &SyncHandle) -> Result<Option<String>> {
    handle
        .resume()
        .context("Failed to load cached credentials")
}

/// Resume the cached session and wait for its lists
async fn start_session(handle: &SyncHandle) -> Result<Vec<TodoList>> {
    let mut updates = handle.subscribe();
    if resume(handle)?.is_none() {
        bail!("Not logged in. Run `todo-sync login <username>` first.");
    }
    wait_for_lists(&mut updates).await
}

/// Like [`start_session`] but hands back the update stream for follow-up waits
async fn start_session_keep(handle: &SyncHandle) -> Result<broadcast::Receiver<ViewUpdate>> {
    let mut updates = handle.subscribe();
    if resume(handle)?.is_none() {
        bail!("Not logged in. Run `todo-sync login <username>` first.");
    }
    wait_for_lists(&mut updates).await?;
    Ok(updates)
}

async fn open_list(
    handle: &SyncHandle,
    updates: &mut broadcast::Receiver<ViewUpdate>,
    list: ListId,
) -> Result<TaskView> {
    if !handle.snapshot().context.lists().iter().any(|l| l.id == list) {
        bail!("No list with id {}", list);
    }
    handle.select_list(list)?;
    wait_for_tasks(updates).await
}

/// Apply a task mutation to `list` and print the re-fetched tasks
async fn edit_and_show(handle: &SyncHandle, list: ListId, mutation: Mutation) -> Result<()> {
    let mut updates = start_session_keep(handle).await?;
    open_list(handle, &mut updates, list).await?;
    submit(handle, &mut updates, mutation).await?;
    print_tasks(&wait_for_tasks(&mut updates).await?);
    Ok(())
}

async fn submit(
    handle: &SyncHandle,
    updates: &mut broadcast::Receiver<ViewUpdate>,
    mutation: Mutation,
) -> Result<()> {
    handle.submit(mutation.clone())?;
    wait_for(updates, |update| match update {
        ViewUpdate::Acknowledged(m) if *m == mutation => Some(Ok(())),
        ViewUpdate::Error(message) => Some(Err(anyhow!("{}", message))),
        _ => None,
    })
    .await?
}

async fn wait_for_lists(updates: &mut broadcast::Receiver<ViewUpdate>) -> Result<Vec<TodoList>> {
    wait_for(updates, |update| match update {
        ViewUpdate::ListsChanged(lists) => Some(lists.clone()),
        _ => None,
    })
    .await
}

async fn wait_for_tasks(updates: &mut broadcast::Receiver<ViewUpdate>) -> Result<TaskView> {
    wait_for(updates, |update| match update {
        ViewUpdate::TasksChanged(view) => Some(Ok(view.clone())),
        ViewUpdate::Error(message) => Some(Err(anyhow!("{}", message))),
        _ => None,
    })
    .await?
}

/// Wait for the first update `pick` accepts; an ended session is always an error
async fn wait_for<T>(
    updates: &mut broadcast::Receiver<ViewUpdate>,
    mut pick: impl FnMut(&ViewUpdate) -> Option<T>,
) -> Result<T> {
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            match updates.recv().await {
                Ok(ViewUpdate::AuthFailed(reason)) => {
                    bail!("Session ended: {}. Log in again.", reason)
                }
                Ok(update) => {
                    if let Some(value) = pick(&update) {
                        return Ok(value);
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "update stream lagged"),
                Err(RecvError::Closed) => bail!("Sync runtime stopped"),
            }
        }
    })
    .await;

    waited.map_err(|_| anyhow!("Timed out waiting for the server"))?
}

// ============================================================================
// Output
// ============================================================================

fn print_lists(lists: &[TodoList]) {
    if lists.is_empty() {
        println!("No lists yet. Create one with `todo-sync new-list <name>`.");
        return;
    }
    for list in lists {
        println!("{:>4}  {}", list.id, list.name);
    }
}

fn print_tasks(view: &TaskView) {
    if view.is_empty() {
        println!("No tasks in this list yet.");
    }
    for task in &view.tasks {
        println!("{}", render_task_line(task));
    }
    let summary = view.summary();
    println!(
        "{} ({}%) | High {} Medium {} Low {}",
        summary,
        summary.percent_complete(),
        summary.count(Priority::High),
        summary.count(Priority::Medium),
        summary.count(Priority::Low)
    );
}

// ============================================================================
// Interactive watch
// ============================================================================

const WATCH_HELP: &str = "Commands: switch <list> | lists | add <text> | parse <text> | done <task> | undo <task> | rm <task> | mv <task> <index> | refresh | help | quit";

async fn watch(handle: &SyncHandle, list: Option<ListId>) -> Result<()> {
    let mut updates = start_session_keep(handle).await?;
    print_lists(handle.snapshot().context.lists());
    if let Some(list) = list {
        handle.select_list(list)?;
    }
    println!("{}", WATCH_HELP);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(ViewUpdate::AuthFailed(reason)) => bail!("Session ended: {}. Log in again.", reason),
                Ok(update) => print_update(&update),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "update stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    match parse_watch_command(handle, line.trim()) {
                        Ok(WatchCommand::Quit) => return Ok(()),
                        Ok(WatchCommand::Continue) => {}
                        Err(e) => eprintln!("{}", e),
                    }
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_update(update: &ViewUpdate) {
    match update {
        ViewUpdate::ListsChanged(lists) => {
            println!("-- lists");
            print_lists(lists);
        }
        ViewUpdate::ListSelected { list, name } => {
            println!("-- opened {}", name.as_deref().unwrap_or(&list.to_string()));
        }
        ViewUpdate::SelectionCleared => println!("-- list closed"),
        ViewUpdate::TasksChanged(view) => {
            println!("-- tasks");
            print_tasks(view);
        }
        ViewUpdate::Acknowledged(mutation) => println!("-- ok: {}", mutation),
        ViewUpdate::Error(message) => eprintln!("error: {}", message),
        ViewUpdate::SignedIn { username } => println!("-- signed in as {}", username),
        ViewUpdate::SignedOut | ViewUpdate::AuthFailed(_) => println!("-- signed out"),
    }
}

enum WatchCommand {
    Continue,
    Quit,
}

fn parse_watch_command(handle: &SyncHandle, line: &str) -> Result<WatchCommand> {
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let current = || {
        handle
            .snapshot()
            .context
            .selected()
            .ok_or_else(|| anyhow!("Open a list first: switch <list>"))
    };
    let task_id = |s: &str| -> Result<TaskId> {
        s.parse()
            .map_err(|_| anyhow!("'{}' is not a task id", s))
    };

    match verb {
        "" => {}
        "quit" | "exit" => return Ok(WatchCommand::Quit),
        "help" => println!("{}", WATCH_HELP),
        "lists" => print_lists(handle.snapshot().context.lists()),
        "switch" | "open" => handle.select_list(
            rest.parse()
                .map_err(|_| anyhow!("'{}' is not a list id", rest))?,
        )?,
        "refresh" => handle.select_list(current()?)?,
        "add" => handle.submit(Mutation::AddTask {
            list: current()?,
            draft: TaskDraft::new(rest),
        })?,
        "parse" => handle.submit(Mutation::AddParsedTask {
            list: current()?,
            text: rest.to_string(),
        })?,
        "done" | "undo" => {
            let list = current()?;
            let patch = TaskPatch::completed(verb == "done");
            handle.submit(Mutation::UpdateTask {
                list,
                task: task_id(rest)?,
                patch,
            })?
        }
        "rm" => handle.submit(Mutation::DeleteTask {
            list: current()?,
            task: task_id(rest)?,
        })?,
        "mv" | "move" => {
            let list = current()?;
            let (task, index) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("Usage: mv <task> <index>"))?;
            let task = task_id(task)?;
            let index: usize = index
                .trim()
                .parse()
                .map_err(|_| anyhow!("'{}' is not a position", index.trim()))?;
            let view = handle
                .snapshot()
                .view
                .ok_or_else(|| anyhow!("Tasks are still loading"))?;
            let task_ids = view
                .order_with_move(task, index)
                .ok_or_else(|| anyhow!("Task {} is not in this list", task))?;
            handle.submit(Mutation::ReorderTasks { list, task_ids })?
        }
        other => bail!("Unknown command '{}'. {}", other, WATCH_HELP),
    }
    Ok(WatchCommand::Continue)
}
