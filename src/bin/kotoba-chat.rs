//! kotoba-chat binary entry point.
//!
//! `serve` runs the HTTP gateway; `chat` is a line-oriented client that drives
//! the conversation controller against either an in-process dispatcher or a
//! running gateway.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use kotoba_chat::http::reqwest::default_dyn_transport;
use kotoba_chat::session::DynKeyValueStore;
use kotoba_chat::{
    ConversationController, ConversationEvent, DynGateway, FileStore, GatewayConfig, MemoryStore,
    Provider, RemoteGateway, Role, SendRejected, SessionStore, TurnState,
    build_dispatcher_from_config,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kotoba-chat", version, about = "Chat with OpenAI, Anthropic and Google models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve `POST /api/chat`.
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Chat in the terminal.
    Chat {
        /// Talk to a running gateway instead of calling providers directly.
        #[arg(long)]
        gateway_url: Option<String>,
        /// Where sessions are stored; defaults to the platform data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Keep sessions in memory only.
        #[arg(long, conflicts_with = "data_dir")]
        ephemeral: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve { bind } => serve(&bind).await,
        Command::Chat {
            gateway_url,
            data_dir,
            ephemeral,
        } => chat(gateway_url, data_dir, ephemeral).await,
    }
}

async fn serve(bind: &str) -> Result<()> {
    let transport = default_dyn_transport()?;
    let dispatcher = build_dispatcher_from_config(&GatewayConfig::from_env(), transport)?;
    let handle = kotoba_chat::server::serve(Arc::new(dispatcher), bind).await?;

    signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    tracing::info!("received shutdown signal");
    handle.shutdown().await?;
    tracing::info!("gateway shut down");
    Ok(())
}

async fn chat(gateway_url: Option<String>, data_dir: Option<PathBuf>, ephemeral: bool) -> Result<()> {
    let transport = default_dyn_transport()?;
    let gateway: DynGateway = match gateway_url {
        Some(url) => {
            tracing::info!("using gateway at {url}");
            Arc::new(RemoteGateway::new(transport, url))
        }
        None => Arc::new(build_dispatcher_from_config(
            &GatewayConfig::from_env(),
            transport,
        )?),
    };

    let kv: DynKeyValueStore = if ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        let dir = match data_dir {
            Some(dir) => dir,
            None => ProjectDirs::from("dev", "kotoba", "kotoba-chat")
                .context("failed to determine data directory")?
                .data_dir()
                .to_path_buf(),
        };
        tracing::info!("storing sessions in {}", dir.display());
        Arc::new(FileStore::new(dir))
    };

    let controller = ConversationController::new(SessionStore::load(kv), gateway);
    print_help();
    print_current(&controller);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit" | "/exit", _) => break,
            ("/help", _) => print_help(),
            ("/new", _) => {
                controller.new_chat();
                print_current(&controller);
            }
            ("/list", _) => print_sessions(&controller),
            ("/select", arg) => select(&controller, arg.trim()),
            ("/title", title) => {
                if let Some(session) = controller.current_session() {
                    if !controller.rename_session(&session.id, title) {
                        println!("title cannot be empty");
                    }
                }
            }
            ("/provider", id) => match id.trim().parse::<Provider>() {
                Ok(provider) => {
                    controller.set_provider(provider);
                    print_current(&controller);
                }
                Err(_) => println!(
                    "unknown provider; choose one of: {}",
                    Provider::ALL.map(Provider::id).join(", ")
                ),
            },
            ("/model", model) => match controller.set_model(model.trim()) {
                Ok(()) => print_current(&controller),
                Err(err) => println!("{err}"),
            },
            (command, _) if command.starts_with('/') => println!("unknown command {command}"),
            _ => send(&controller, line).await?,
        }
    }
    Ok(())
}

/// Sends one message and prints the reply as it arrives.
async fn send(controller: &ConversationController, input: &str) -> Result<()> {
    let mut events = controller.subscribe();
    let render = async {
        let mut printed = 0;
        loop {
            match events.recv().await {
                Ok(ConversationEvent::MessagesChanged { session_id }) => {
                    let Some(session) = controller
                        .sessions()
                        .into_iter()
                        .find(|session| session.id == session_id)
                    else {
                        continue;
                    };
                    let Some(last) = session.messages.last() else {
                        continue;
                    };
                    if last.role != Role::Assistant {
                        continue;
                    }
                    if let Some(fresh) = last.content.get(printed..) {
                        print!("{fresh}");
                        printed = last.content.len();
                        let _ = std::io::stdout().flush();
                    }
                }
                Ok(ConversationEvent::StateChanged {
                    state: TurnState::Idle,
                    ..
                })
                | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
        println!();
    };

    let (outcome, ()) = tokio::join!(controller.send_message(input), render);
    match outcome {
        Ok(outcome) if outcome.state == TurnState::Errored && outcome.reply.is_none() => {
            println!("the gateway rejected the request");
        }
        Ok(_) => {}
        Err(SendRejected::Busy) => println!("still waiting for the previous reply"),
        Err(SendRejected::Empty) => {}
    }
    Ok(())
}

fn select(controller: &ConversationController, arg: &str) {
    let sessions = controller.sessions();
    let id = match arg.parse::<usize>() {
        Ok(index) if (1..=sessions.len()).contains(&index) => sessions[index - 1].id.clone(),
        _ => arg.to_string(),
    };
    if controller.select_session(&id) {
        print_current(controller);
    } else {
        println!("no session {arg}");
    }
}

fn print_help() {
    println!("commands: /new /list /select <n|id> /title <text> /provider <id> /model <name> /quit");
}

fn print_current(controller: &ConversationController) {
    let Some(session) = controller.current_session() else {
        return;
    };
    println!(
        "[{}] {} via {} / {}",
        session.title,
        session.id,
        session.provider.display_name(),
        session.model
    );
    for message in &session.messages {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{who}: {}", message.content);
    }
}

fn print_sessions(controller: &ConversationController) {
    let current = controller.current_session().map(|session| session.id.clone());
    for (index, session) in controller.sessions().iter().enumerate() {
        let marker = if current.as_deref() == Some(session.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {}. {} ({} messages, {})",
            index + 1,
            session.title,
            session.messages.len(),
            session.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}
