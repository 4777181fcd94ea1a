use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use zerohands::providers::LabelOperation;
use zerohands::store::models::Provider;

#[derive(Debug, Parser)]
#[command(name = "zerohands", version, about = "Mailbox sync engine with AI triage labels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage mailbox accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Sync an account from its provider
    Sync(SyncArgs),
    /// List the cached inbox, newest first
    Inbox(InboxArgs),
    /// Show one thread with messages and labels
    Show { email: String, external_id: String },
    /// Show the messages of a thread, oldest first
    Thread { email: String, thread_id: String },
    /// Add, remove, or replace triage labels on a thread
    Labels(LabelArgs),
    /// Mark a thread as read
    MarkRead { email: String, external_id: String },
    /// Send an email through the account's provider
    Send(SendArgs),
    /// Show cache statistics
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    email: String,
    /// Run a cold-start sync with a one-month lookback
    #[arg(long, default_value_t = false)]
    initial: bool,
    #[arg(long)]
    max_results: Option<usize>,
    /// Keep syncing every 60 seconds
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[derive(Debug, Args)]
struct InboxArgs {
    email: String,
    #[arg(long, default_value_t = 25)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
struct LabelArgs {
    email: String,
    thread_id: String,
    #[arg(long, default_value = "add")]
    op: LabelOperation,
    /// Labels from the triage vocabulary, e.g. TO_RESPOND FYI
    #[arg(required = true)]
    labels: Vec<String>,
}

#[derive(Debug, Args)]
struct SendArgs {
    email: String,
    to: String,
    subject: String,
    body: String,
    #[arg(long, default_value_t = false)]
    html: bool,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// List configured accounts
    List,
    /// Add or update an account
    Add {
        email: String,
        provider: Provider,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Remove an account (cached mail is kept)
    Remove { email: String },
    /// Show per-account sync status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{Context, Result};
    use uuid::Uuid;

    use zerohands::classifier::{HttpTextModel, LabelClassifier};
    use zerohands::notify::{SyncObserver, SyncProgress};
    use zerohands::providers::{OutgoingMail, ProviderRegistry};
    use zerohands::store::models::User;
    use zerohands::store::Database;
    use zerohands::sync::SyncEngine;

    use super::{AccountCommands, Cli, Commands};

    const DEFAULT_MODEL_URL: &str = "https://api.openai.com/v1/chat/completions";
    const DEFAULT_MODEL: &str = "gpt-4o-mini";

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Accounts { command } => handle_accounts(command).await,
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Inbox(args) => handle_inbox(args, cli.json).await,
            Commands::Show { email, external_id } => handle_show(&email, &external_id, cli.json).await,
            Commands::Thread { email, thread_id } => handle_thread(&email, &thread_id, cli.json).await,
            Commands::Labels(args) => handle_labels(args, cli.json).await,
            Commands::MarkRead { email, external_id } => handle_mark_read(&email, &external_id).await,
            Commands::Send(args) => handle_send(args).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    fn open_database() -> Result<Database> {
        let db_path = Database::default_db_path().context("resolve default database path")?;
        Database::open(&db_path).with_context(|| format!("open database at {}", db_path.display()))
    }

    fn build_engine(db: Database) -> SyncEngine<HttpTextModel> {
        let endpoint = std::env::var("ZEROHANDS_MODEL_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL_URL.to_string());
        let api_key = std::env::var("ZEROHANDS_MODEL_API_KEY").unwrap_or_default();
        let model = std::env::var("ZEROHANDS_MODEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let classifier = LabelClassifier::new(HttpTextModel::new(endpoint, api_key, model));
        SyncEngine::new(db, ProviderRegistry::with_defaults(), classifier)
    }

    /// Prints per-thread progress to stderr so a long sync is visibly alive.
    struct ProgressPrinter;

    impl SyncObserver for ProgressPrinter {
        fn on_progress(&self, progress: &SyncProgress) {
            eprintln!(
                "[{}/{}] synced {}",
                progress.processed, progress.total, progress.current_email
            );
        }
    }

    async fn handle_sync(args: super::SyncArgs, json: bool) -> Result<()> {
        let mut engine = build_engine(open_database()?);
        if !json {
            engine = engine.with_observer(Box::new(ProgressPrinter));
        }

        loop {
            let outcome = if args.initial {
                engine.perform_initial_sync(&args.email, args.max_results).await?
            } else {
                engine
                    .perform_incremental_sync(&args.email, args.max_results)
                    .await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "sync {}: new={} total={}",
                    args.email, outcome.new_emails_count, outcome.total_emails_count
                );
            }

            if !args.watch {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        }
    }

    async fn handle_inbox(args: super::InboxArgs, json: bool) -> Result<()> {
        let engine = build_engine(open_database()?);
        let page = engine.get_inbox_emails(&args.email, args.limit, args.offset)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&page)?);
            return Ok(());
        }

        if page.threads.is_empty() {
            println!("Inbox is empty.");
            return Ok(());
        }
        for thread in &page.threads {
            let marker = if thread.is_read { " " } else { "*" };
            println!(
                "{marker} {}  {}  {}",
                thread.external_id,
                thread.from_address.as_deref().unwrap_or("<unknown>"),
                thread.subject.as_deref().unwrap_or("(no subject)")
            );
        }
        println!(
            "showing {} of {} threads{}",
            page.threads.len(),
            page.total_count,
            if page.has_more { " (more available)" } else { "" }
        );
        Ok(())
    }

    async fn handle_show(email: &str, external_id: &str, json: bool) -> Result<()> {
        let engine = build_engine(open_database()?);
        let content = engine.get_email_content(email, external_id).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&content)?);
            return Ok(());
        }

        println!(
            "Subject: {}",
            content.thread.subject.as_deref().unwrap_or("(no subject)")
        );
        println!(
            "From: {}",
            content.thread.from_address.as_deref().unwrap_or("<unknown>")
        );
        println!("Date: {}", content.thread.timestamp);
        if !content.labels.is_empty() {
            println!("Labels: {}", content.labels.join(", "));
        }
        for message in &content.messages {
            println!();
            println!(
                "--- {} ({})",
                message.message.from_address.as_deref().unwrap_or("<unknown>"),
                message.message.timestamp
            );
            if let Some(body) = &message.message.body_text {
                println!("{body}");
            }
            for attachment in &message.attachments {
                println!(
                    "  [attachment] {}",
                    attachment.filename.as_deref().unwrap_or("<unnamed>")
                );
            }
        }
        Ok(())
    }

    async fn handle_thread(email: &str, thread_id: &str, json: bool) -> Result<()> {
        let engine = build_engine(open_database()?);
        let messages = engine.get_thread_emails(email, thread_id)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&messages)?);
            return Ok(());
        }

        for message in &messages {
            println!(
                "{}  {}  {}",
                message.message.timestamp,
                message.message.from_address.as_deref().unwrap_or("<unknown>"),
                message.message.subject.as_deref().unwrap_or("(no subject)")
            );
        }
        println!("{} message(s)", messages.len());
        Ok(())
    }

    async fn handle_labels(args: super::LabelArgs, json: bool) -> Result<()> {
        let engine = build_engine(open_database()?);
        let labels = engine
            .update_email_labels(&args.email, &args.thread_id, &args.labels, args.op)
            .await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&labels)?);
        } else if labels.is_empty() {
            println!("Thread {} has no labels.", args.thread_id);
        } else {
            println!("Thread {} labels: {}", args.thread_id, labels.join(", "));
        }
        Ok(())
    }

    async fn handle_mark_read(email: &str, external_id: &str) -> Result<()> {
        let engine = build_engine(open_database()?);
        engine.mark_email_as_read(email, external_id).await?;
        println!("Marked {external_id} as read.");
        Ok(())
    }

    async fn handle_send(args: super::SendArgs) -> Result<()> {
        let engine = build_engine(open_database()?);
        engine
            .send_email(
                &args.email,
                &OutgoingMail {
                    to: args.to.clone(),
                    subject: args.subject,
                    body: args.body,
                    is_html: args.html,
                },
            )
            .await?;
        println!("Sent email to {}.", args.to);
        Ok(())
    }

    async fn handle_accounts(command: AccountCommands) -> Result<()> {
        let db = open_database()?;

        match command {
            AccountCommands::List => {
                let users = db.list_users()?;
                if users.is_empty() {
                    println!("No accounts configured.");
                } else {
                    println!("Accounts");
                    println!("========");
                    for user in users {
                        println!("{}  {}", user.email, user.provider);
                    }
                }
            }
            AccountCommands::Add {
                email,
                provider,
                access_token,
                refresh_token,
            } => {
                let user = User {
                    id: Uuid::new_v4().to_string(),
                    email: email.trim().to_ascii_lowercase(),
                    provider,
                    access_token: Some(access_token),
                    refresh_token,
                    gmail_history_id: None,
                    outlook_delta_token: None,
                    last_sync_time: None,
                };
                db.upsert_user(&user)?;
                println!("Added account: {}", user.email);
            }
            AccountCommands::Remove { email } => {
                let removed = db.remove_user(&email)?;
                if removed == 0 {
                    println!("No account found: {email}");
                } else {
                    println!("Removed account: {email}");
                }
            }
            AccountCommands::Status => {
                let users = db.list_users()?;
                if users.is_empty() {
                    println!("No accounts configured.");
                } else {
                    println!("Account Sync Status");
                    println!("===================");
                    for user in users {
                        println!(
                            "{}  cursor={}  last_sync={}",
                            user.email,
                            if user.cursor().is_some() { "set" } else { "none" },
                            user.last_sync_time.as_deref().unwrap_or("never")
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let db = open_database()?;
        let stats = db.get_stats()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }

        println!("Cache Statistics");
        println!("================");
        println!("Users:    {}", stats.total_users);
        println!("Threads:  {}", stats.total_threads);
        println!("Messages: {}", stats.total_messages);
        for entry in &stats.threads_by_user {
            println!("  {}: {} threads", entry.user_id, entry.count);
        }
        Ok(())
    }
}
