use std::collections::BTreeMap;

use {
    clap::Subcommand,
    wxrelay_listener::{FixedListener, ListenerStore},
};

#[derive(Subcommand)]
pub enum FixedAction {
    /// List fixed listeners.
    List,
    /// Add a conversation every instance should always listen to.
    Add {
        session_name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Store it disabled.
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a fixed listener.
    Remove { session_name: String },
}

#[derive(Subcommand)]
pub enum ListenersAction {
    /// List persisted subscriptions grouped by instance.
    List {
        /// Include evicted subscriptions.
        #[arg(long)]
        all: bool,
    },
}

pub async fn handle_fixed(action: FixedAction, store: &dyn ListenerStore) -> anyhow::Result<()> {
    for line in apply_fixed(action, store).await? {
        println!("{line}");
    }
    Ok(())
}

pub async fn handle_listeners(
    action: ListenersAction,
    store: &dyn ListenerStore,
) -> anyhow::Result<()> {
    let ListenersAction::List { all } = action;
    for line in list_subscriptions(store, all).await? {
        println!("{line}");
    }
    Ok(())
}

async fn apply_fixed(action: FixedAction, store: &dyn ListenerStore) -> anyhow::Result<Vec<String>> {
    Ok(match action {
        FixedAction::List => {
            let fixed = store.list_fixed().await?;
            if fixed.is_empty() {
                vec!["No fixed listeners.".into()]
            } else {
                fixed
                    .iter()
                    .map(|f| {
                        let state = if f.enabled { "on" } else { "off" };
                        if f.description.is_empty() {
                            format!("{} [{state}]", f.session_name)
                        } else {
                            format!("{} [{state}] {}", f.session_name, f.description)
                        }
                    })
                    .collect()
            }
        },
        FixedAction::Add {
            session_name,
            description,
            disabled,
        } => {
            let session_name = session_name.trim().to_string();
            anyhow::ensure!(!session_name.is_empty(), "session name is empty");
            let mut fixed = FixedListener::new(session_name.clone());
            fixed.description = description;
            fixed.enabled = !disabled;
            if store.insert_fixed(&fixed).await? {
                vec![format!("Added fixed listener '{session_name}'.")]
            } else {
                anyhow::bail!("fixed listener '{session_name}' already exists")
            }
        },
        FixedAction::Remove { session_name } => {
            if store.delete_fixed(&session_name).await? {
                vec![format!("Removed fixed listener '{session_name}'.")]
            } else {
                anyhow::bail!("no fixed listener named '{session_name}'")
            }
        },
    })
}

async fn list_subscriptions(store: &dyn ListenerStore, all: bool) -> anyhow::Result<Vec<String>> {
    let mut by_instance: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for sub in store.load_all().await? {
        if all || sub.active {
            by_instance
                .entry(sub.instance_id.clone())
                .or_default()
                .push(sub);
        }
    }
    if by_instance.is_empty() {
        return Ok(vec!["No listeners.".into()]);
    }

    let mut lines = Vec::new();
    for (instance_id, mut subs) in by_instance {
        subs.sort_by(|a, b| b.last_message_at_ms.cmp(&a.last_message_at_ms));
        lines.push(format!("{instance_id} ({})", subs.len()));
        for sub in subs {
            let mut flags = Vec::new();
            if !sub.active {
                flags.push("evicted");
            }
            if sub.fixed_listener {
                flags.push("fixed");
            }
            if sub.manually_added {
                flags.push("manual");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(","))
            };
            lines.push(format!(
                "  {}{flags} last_message={}",
                sub.who, sub.last_message_at_ms
            ));
        }
    }
    Ok(lines)
}
