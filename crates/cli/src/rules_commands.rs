use {
    clap::{Args, Subcommand},
    sqlx::SqlitePool,
    wxrelay_routing::{DeliveryRule, Route, RuleEngine},
};

use crate::app;

#[derive(Subcommand)]
pub enum RulesAction {
    /// List every delivery rule, highest priority first.
    List,
    /// Add a delivery rule.
    Add(AddRule),
    /// Delete a delivery rule.
    Remove { rule_id: String },
    /// Enable a delivery rule.
    Enable { rule_id: String },
    /// Disable a delivery rule.
    Disable { rule_id: String },
    /// Show which rule would handle a message.
    Match {
        instance_id: String,
        chat_name: String,
        /// Message text, used for the @-mention gate.
        #[arg(long, default_value = "")]
        content: String,
    },
}

#[derive(Args)]
pub struct AddRule {
    pub rule_id: String,
    /// Platform that receives matching messages.
    #[arg(long)]
    pub platform: String,
    /// `*`, `regex:<expr>`, a comma list, or an exact chat name.
    #[arg(long, default_value = "*")]
    pub chat_pattern: String,
    /// `*` or an exact instance id.
    #[arg(long, default_value = "*")]
    pub instance: String,
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
    #[arg(long, default_value = "")]
    pub name: String,
    /// Only deliver group messages that mention one of `--at-names`.
    #[arg(long)]
    pub only_at: bool,
    #[arg(long, value_delimiter = ',')]
    pub at_names: Vec<String>,
    /// Mention the sender when replying.
    #[arg(long)]
    pub reply_at_sender: bool,
    #[arg(long)]
    pub disabled: bool,
}

impl AddRule {
    fn into_rule(self) -> DeliveryRule {
        let mut rule =
            DeliveryRule::new(self.rule_id, self.chat_pattern, self.platform, self.priority);
        rule.name = self.name;
        rule.instance_id = self.instance;
        rule.only_at_messages = self.only_at;
        rule.at_names = self
            .at_names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        rule.reply_at_sender = self.reply_at_sender;
        rule.enabled = !self.disabled;
        rule
    }
}

pub async fn handle_rules(action: RulesAction, pool: &SqlitePool) -> anyhow::Result<()> {
    let engine = app::rule_engine(pool).await?;
    for line in apply(action, &engine).await? {
        println!("{line}");
    }
    Ok(())
}

/// Run `action` against `engine`, returning the lines to print.
async fn apply(action: RulesAction, engine: &RuleEngine) -> anyhow::Result<Vec<String>> {
    Ok(match action {
        RulesAction::List => {
            let mut rules = engine.get_all_rules().await?;
            if rules.is_empty() {
                vec!["No rules.".into()]
            } else {
                rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
                rules.iter().map(describe).collect()
            }
        },
        RulesAction::Add(args) => {
            let rule = engine.add_rule(args.into_rule()).await?;
            vec![format!("Added {}", describe(&rule))]
        },
        RulesAction::Remove { rule_id } => {
            engine.delete_rule(&rule_id).await?;
            vec![format!("Removed rule '{rule_id}'.")]
        },
        RulesAction::Enable { rule_id } => {
            engine.enable_rule(&rule_id, true).await?;
            vec![format!("Enabled rule '{rule_id}'.")]
        },
        RulesAction::Disable { rule_id } => {
            engine.enable_rule(&rule_id, false).await?;
            vec![format!("Disabled rule '{rule_id}'.")]
        },
        RulesAction::Match {
            instance_id,
            chat_name,
            content,
        } => vec![match engine.route(&instance_id, &chat_name, &content) {
            Route::Matched(rule) => format!("matched {}", describe(&rule)),
            Route::MentionRequired(rule) => {
                format!("held back, needs an @-mention: {}", describe(&rule))
            },
            Route::NoRule => "no rule matches".into(),
        }],
    })
}

fn describe(rule: &DeliveryRule) -> String {
    let mut line = format!(
        "{} [{}] instance={} chat={} -> {} priority={}",
        rule.rule_id,
        if rule.enabled { "on" } else { "off" },
        rule.instance_id,
        rule.chat_pattern,
        rule.platform_id,
        rule.priority,
    );
    if rule.only_at_messages {
        line.push_str(&format!(" only_at={}", rule.at_names_joined()));
    }
    if rule.reply_at_sender {
        line.push_str(" reply_at_sender");
    }
    line
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, wxrelay_routing::InMemoryRuleStore};

    fn add(rule_id: &str, chat_pattern: &str, platform: &str, priority: i64) -> RulesAction {
        RulesAction::Add(AddRule {
            rule_id: rule_id.into(),
            platform: platform.into(),
            chat_pattern: chat_pattern.into(),
            instance: "*".into(),
            priority,
            name: String::new(),
            only_at: false,
            at_names: Vec::new(),
            reply_at_sender: false,
            disabled: false,
        })
    }

    fn matching(instance_id: &str, chat_name: &str, content: &str) -> RulesAction {
        RulesAction::Match {
            instance_id: instance_id.into(),
            chat_name: chat_name.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn add_list_match_and_disable() {
        let engine = RuleEngine::new(Arc::new(InMemoryRuleStore::new()));
        assert_eq!(apply(RulesAction::List, &engine).await.unwrap(), vec![
            "No rules."
        ]);

        apply(add("fallback", "*", "echo", 0), &engine).await.unwrap();
        apply(add("family", "Family,Team", "gpt", 10), &engine)
            .await
            .unwrap();

        let listed = apply(RulesAction::List, &engine).await.unwrap();
        assert!(listed[0].starts_with("family [on]"));
        assert!(listed[1].starts_with("fallback [on]"));

        let hit = apply(matching("wx1", "Team", ""), &engine).await.unwrap();
        assert!(hit[0].contains("family"));

        apply(
            RulesAction::Disable {
                rule_id: "family".into(),
            },
            &engine,
        )
        .await
        .unwrap();
        let hit = apply(matching("wx1", "Team", ""), &engine).await.unwrap();
        assert!(hit[0].contains("fallback"));
    }

    #[tokio::test]
    async fn mention_gate_is_reported() {
        let engine = RuleEngine::new(Arc::new(InMemoryRuleStore::new()));
        let RulesAction::Add(mut args) = add("group", "Team", "gpt", 0) else {
            unreachable!()
        };
        args.only_at = true;
        args.at_names = vec![" bot ".into(), String::new()];
        apply(RulesAction::Add(args), &engine).await.unwrap();

        let held = apply(matching("wx1", "Team", "hello all"), &engine)
            .await
            .unwrap();
        assert!(held[0].starts_with("held back"));
        let hit = apply(matching("wx1", "Team", "@bot hello"), &engine)
            .await
            .unwrap();
        assert!(hit[0].starts_with("matched group"));
        assert!(hit[0].contains("only_at=bot"));
    }

    #[tokio::test]
    async fn unknown_rule_errors() {
        let engine = RuleEngine::new(Arc::new(InMemoryRuleStore::new()));
        assert!(
            apply(
                RulesAction::Remove {
                    rule_id: "ghost".into()
                },
                &engine
            )
            .await
            .is_err()
        );
        assert_eq!(
            apply(matching("wx1", "Team", ""), &engine).await.unwrap(),
            vec!["no rule matches"]
        );
    }
}
