use {
    clap::Subcommand,
    wxrelay_channels::{Message, MessageStore},
};

#[derive(Subcommand)]
pub enum MessagesAction {
    /// Show the most recent messages and their delivery state.
    Recent {
        /// Only messages from this instance.
        #[arg(long)]
        instance: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print one JSON object per line.
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_messages(action: MessagesAction, store: &dyn MessageStore) -> anyhow::Result<()> {
    let MessagesAction::Recent {
        instance,
        limit,
        json,
    } = action;
    let messages = store.recent(instance.as_deref(), limit).await?;
    if messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }
    for message in &messages {
        if json {
            println!("{}", serde_json::to_string(message)?);
        } else {
            println!("{}", summarize(message));
        }
    }
    Ok(())
}

fn summarize(message: &Message) -> String {
    let mut line = format!(
        "{} {}/{} {}: {} [{:?}",
        message.message_id,
        message.instance_id,
        message.chat_name,
        message.sender,
        message.content,
        message.delivery_status,
    );
    if let Some(platform_id) = &message.platform_id {
        line.push_str(&format!(" via {platform_id}"));
    }
    if message.merged {
        line.push_str(&format!(", merged {}", message.merged_count));
    }
    line.push(']');
    if let Some(reply) = &message.reply_content {
        line.push_str(&format!(" -> {reply} [{:?}]", message.reply_status));
    }
    line
}
