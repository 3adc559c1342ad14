use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    cache::SharedCacheMirror,
    realtime::WsConnector,
    ActionError, ClientEvent, InboxClient, InboxSync, Session, SqliteCacheMirror,
};
use shared::domain::{Folder, Message, MessageId, MessagePatch, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::{load_settings, Overrides};

#[derive(Parser, Debug)]
#[command(name = "inbox", about = "Realtime inbox client")]
struct Args {
    /// Settings file, without extension.
    #[arg(long, default_value = "inbox")]
    config: String,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print every change until Ctrl-C.
    Watch,
    List {
        #[arg(long, value_enum, default_value_t = FolderArg::Inbox)]
        folder: FolderArg,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    MarkRead {
        id: i64,
        /// Mark as unread instead.
        #[arg(long)]
        unread: bool,
    },
    Archive {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FolderArg {
    Inbox,
    Sent,
    Starred,
    Archived,
}

impl From<FolderArg> for Folder {
    fn from(folder: FolderArg) -> Self {
        match folder {
            FolderArg::Inbox => Folder::Inbox,
            FolderArg::Sent => Folder::Sent,
            FolderArg::Starred => Folder::Starred,
            FolderArg::Archived => Folder::Archived,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings(
        &args.config,
        Overrides {
            api_url: args.api_url,
            user_id: args.user_id,
            token: args.token,
        },
    )?;

    let mirror: Option<SharedCacheMirror> = match &settings.cache_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir '{}'", dir.display()))?;
            let url = SqliteCacheMirror::sqlite_url_for_data_dir(dir);
            Some(SqliteCacheMirror::initialize(&url).await?)
        }
        None => None,
    };

    let handle = InboxSync::start_with_dependencies(
        settings.sync,
        Session {
            user_id: UserId(settings.user_id),
            token: settings.token,
        },
        Arc::new(WsConnector),
        mirror,
    )
    .await
    .context("failed to start inbox session")?;
    let client: Arc<dyn InboxClient> = Arc::new(handle);

    let outcome = run(client.as_ref(), args.command).await;
    client.shutdown().await;
    outcome
}

async fn run(client: &dyn InboxClient, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(client).await,
        Command::List { folder, page } => {
            let page = client.load_folder(folder.into(), page).await?;
            for message in &page.items {
                print_message(message);
            }
            println!(
                "page {}/{} ({} total)",
                page.pagination.page, page.pagination.pages, page.pagination.total
            );
            Ok(())
        }
        Command::MarkRead { id, unread } => {
            client
                .update_message(MessageId(id), MessagePatch::read(!unread))
                .await?;
            println!("message {id} marked {}", if unread { "unread" } else { "read" });
            Ok(())
        }
        Command::Archive { ids } => {
            let count = ids.len();
            client
                .bulk_update(
                    ids.into_iter().map(MessageId).collect(),
                    MessagePatch::archived(true),
                )
                .await?;
            println!("archived {count} message(s)");
            Ok(())
        }
        Command::Stats => {
            let stats = client.refresh_stats().await?;
            println!(
                "inbox {} (unread {}), starred {}, sent {}, archived {}",
                stats.inbox_count,
                stats.unread_count,
                stats.starred_count,
                stats.sent_count,
                stats.archived_count
            );
            Ok(())
        }
    }
}

async fn watch(client: &dyn InboxClient) -> Result<()> {
    let mut events = client.subscribe_events();
    let page = client.load_folder(Folder::Inbox, 1).await?;
    for message in &page.items {
        print_message(message);
    }
    let stats = client.refresh_stats().await?;
    println!("unread: {}", stats.unread_count);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("inbox: interrupted, shutting down");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "inbox: output fell behind, events skipped");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_message(message: &Message) {
    println!(
        "{:>6} {} {:<24} {}",
        message.id.0,
        if message.is_read { ' ' } else { '*' },
        message.sender.display_name,
        message.subject
    );
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessagesChanged { upserted, removed } => {
            for message in upserted {
                print_message(message);
            }
            for id in removed {
                println!("{:>6}   (removed)", id.0);
            }
        }
        ClientEvent::OutboxChanged(outgoing) => println!("outbox: {} pending", outgoing.len()),
        ClientEvent::NotificationsChanged { unread, .. } => {
            println!("notifications: {unread} unread")
        }
        ClientEvent::StatsChanged(stats) => println!("unread: {}", stats.unread_count),
        ClientEvent::ConnectionStateChanged(state) => println!("connection: {state}"),
        ClientEvent::ConnectionLost => println!("{}", ActionError::ConnectionLost),
        ClientEvent::ActionFailed { error, .. } => println!("{error}"),
        ClientEvent::AuthExpired => println!("session expired, run again with a fresh --token"),
    }
}
