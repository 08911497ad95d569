use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use client_core::{
    load_settings, AppPhase, Identity, InboundMessage, MessageListener, MessagingContext,
    RecordingListener, Subscription,
};
use shared::domain::{Attachment, ChatMessage, FILE_TYPE_DOCUMENT, FILE_TYPE_IMAGE};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    server_host: Option<String>,
    #[arg(long)]
    message_port: Option<u16>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

const HELP: &str = "\
commands:
  <peer> <text>            send a message
  /file <peer> <path>      send a file
  /history <peer>          print the stored conversation
  /conversations           list stored conversations
  /open <peer>             follow one conversation
  /close                   stop following it
  /bg, /fg                 simulate the app leaving or entering the foreground
  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(host) = args.server_host {
        settings.server_host = host;
    }
    if let Some(port) = args.message_port {
        settings.message_port = port;
    }
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir;
    }

    let identity = Arc::new(Identity::signed_in(args.user_id.clone()));
    let context = MessagingContext::open(settings, identity).await?;
    let (signals, signal_rx) = mpsc::unbounded_channel();

    let printer: Arc<dyn MessageListener> =
        Arc::new(|inbound: InboundMessage| print_inbound("inbox", &inbound));
    let inbox = context.start(signal_rx, printer).await;
    println!("signed in as {}. {HELP}", args.user_id);

    let mut scoped: Option<Subscription> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "" => {}
            "/quit" => break,
            "/help" => println!("{HELP}"),
            "/bg" => {
                let _ = signals.send(AppPhase::Background);
            }
            "/fg" => {
                let _ = signals.send(AppPhase::Active);
            }
            "/conversations" => {
                for conversation in context.store().load_conversations().await {
                    println!("{} ({})", conversation.name, conversation.id);
                }
            }
            "/history" if !rest.is_empty() => {
                for message in context.store().load_history(rest).await {
                    println!("{}  {}: {}", message.created_at, message.sender_id(), message.text);
                }
            }
            "/open" if !rest.is_empty() => {
                if let Some(previous) = scoped.take() {
                    previous.unsubscribe();
                }
                let peer = rest.to_string();
                let downstream: Arc<dyn MessageListener> =
                    Arc::new(move |inbound: InboundMessage| print_inbound(&peer, &inbound));
                let listener = RecordingListener::new(context.client(), downstream);
                scoped = Some(context.client().listen_to_id(rest, listener).await);
                println!("following {rest}");
            }
            "/close" => {
                if let Some(previous) = scoped.take() {
                    previous.unsubscribe();
                }
            }
            "/file" => match rest.split_once(' ') {
                Some((peer, path)) => {
                    let attachment = match read_attachment(path.trim()).await {
                        Ok(attachment) => attachment,
                        Err(error) => {
                            warn!(%error, "cannot attach file");
                            continue;
                        }
                    };
                    let text = attachment.file_name.clone();
                    context
                        .client()
                        .send_message(peer, ChatMessage::new(&args.user_id, text), Some(attachment))
                        .await;
                }
                None => println!("usage: /file <peer> <path>"),
            },
            _ if command.starts_with('/') => println!("{HELP}"),
            peer if !rest.is_empty() => {
                context
                    .client()
                    .send_message(peer, ChatMessage::new(&args.user_id, rest), None)
                    .await;
            }
            _ => println!("{HELP}"),
        }
    }

    if let Some(scoped) = scoped {
        scoped.unsubscribe();
    }
    if let Some(inbox) = inbox {
        inbox.unsubscribe();
    }
    context.shutdown().await;
    Ok(())
}

fn print_inbound(channel: &str, inbound: &InboundMessage) {
    let message = &inbound.message;
    match &inbound.attachment {
        Some(attachment) => println!(
            "[{channel}] {}: {} (attachment {})",
            message.sender_id(),
            message.text,
            attachment.file_name
        ),
        None => println!("[{channel}] {}: {}", message.sender_id(), message.text),
    }
}

async fn read_attachment(path: &str) -> Result<Attachment> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let path = PathBuf::from(path);
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Attachment {
        file: STANDARD.encode(bytes),
        file_name,
        file_type: file_type_for(&path).to_string(),
    })
}

fn file_type_for(path: &Path) -> &'static str {
    let is_image = mime_guess::from_path(path)
        .first()
        .is_some_and(|mime| mime.type_() == mime_guess::mime::IMAGE);
    if is_image {
        FILE_TYPE_IMAGE
    } else {
        FILE_TYPE_DOCUMENT
    }
}
