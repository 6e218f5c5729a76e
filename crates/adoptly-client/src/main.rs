mod config;
mod render;

use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use adoptly_chat::{ChatError, ChatService, ConversationSnapshot};
use adoptly_realtime::{ChannelClient, MemoryBroker, ReconnectPolicy, Transport, WsTransport};
use adoptly_session::{
    ApiClient, AuthApi, FileCredentialStore, HttpTokenRefresher, SessionCoordinator,
};

use crate::config::ClientConfig;

#[derive(Parser)]
#[command(name = "adoptly", version, about = "Adoptly account and chat client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with an e-mail address or username. The password is read from stdin.
    Login { identifier: String },
    /// Sign out and forget the stored credential.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// Open a conversation. Type to send; `/quit` to leave.
    Chat { conversation_id: String },
    /// Request a password reset e-mail.
    ForgotPassword { email: String },
    /// Set a new password with a reset token. The password is read from stdin.
    ResetPassword { token: String },
}

/// Explicitly constructed client services, torn down at exit.
struct App {
    config: ClientConfig,
    session: SessionCoordinator,
    api: ApiClient,
}

impl App {
    fn build(config: ClientConfig) -> anyhow::Result<Self> {
        let store = FileCredentialStore::open(&config.credentials_path)?;
        let http = ApiClient::http_client(config.http_timeout)?;
        let refresher = HttpTokenRefresher::new(http.clone(), &config.api_url)?;
        let session = SessionCoordinator::new(Arc::new(store), Arc::new(refresher));
        let api = ApiClient::new(http, &config.api_url, session.clone());
        Ok(Self {
            config,
            session,
            api,
        })
    }

    fn auth(&self) -> AuthApi {
        AuthApi::new(self.api.clone())
    }

    fn transport(&self) -> Arc<dyn Transport> {
        if !self.config.uses_memory_broker() {
            return Arc::new(WsTransport::new(self.config.socket_url.clone()));
        }
        info!("Using in-process broker; messages stay on this machine");
        let broker = MemoryBroker::new();
        broker.trust_token_claims();
        Arc::new(broker)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "adoptly=info,adoptly_chat=info,adoptly_realtime=info,adoptly_session=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::build(ClientConfig::from_env()?)?;

    match cli.command {
        Command::Login { identifier } => {
            let password = prompt("Password: ").await?;
            let user = app.auth().login(&identifier, &password).await?;
            println!("Signed in as {}", user.username.as_deref().unwrap_or(&user.id));
        }
        Command::Logout => {
            app.auth().logout().await?;
            println!("Signed out");
        }
        Command::Whoami => match app.auth().load_me().await {
            Ok(Some(user)) => {
                let name = user.username.as_deref().unwrap_or(&user.id);
                match user.email.as_deref() {
                    Some(email) => println!("{} <{}>", name, email),
                    None => println!("{}", name),
                }
            }
            Ok(None) => println!("Not signed in"),
            Err(e) => bail!("session could not be restored: {}", e),
        },
        Command::Chat { conversation_id } => run_chat(&app, &conversation_id).await?,
        Command::ForgotPassword { email } => {
            if app.auth().forgot_password(&email).await? {
                println!("If the address is registered, a reset link is on its way");
            } else {
                bail!("reset request was not accepted");
            }
        }
        Command::ResetPassword { token } => {
            let password = prompt("New password: ").await?;
            if app.auth().reset_password(&token, &password).await? {
                println!("Password updated; sign in again");
            } else {
                bail!("reset token was rejected");
            }
        }
    }

    Ok(())
}

async fn prompt(label: &str) -> anyhow::Result<String> {
    eprint!("{}", label);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines.next_line().await?.context("no input")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_chat(app: &App, conversation_id: &str) -> anyhow::Result<()> {
    let channel = ChannelClient::new(app.session.clone(), app.transport(), ReconnectPolicy::default());
    let chat = ChatService::new(app.api.clone(), channel.clone(), app.config.chat);

    let view = match chat.open(conversation_id).await {
        Ok(view) => view,
        Err(ChatError::Unauthenticated { redirect }) => {
            bail!("sign in first with `adoptly login <identifier>` (then continue at {})", redirect)
        }
        Err(e) => return Err(e.into()),
    };

    let first = view.snapshot();
    println!("Conversation with {}", render::counterpart_name(&first));
    if first.metadata_unavailable {
        warn!("Conversation details unavailable, showing history only");
    }

    let mut snapshots = view.watch();
    let printer = tokio::spawn(async move {
        let mut printed = 0;
        let mut last: Option<ConversationSnapshot> = None;
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            for message in &snapshot.messages[printed.min(snapshot.messages.len())..] {
                println!("{}", render::message_line(&snapshot, message));
            }
            printed = snapshot.messages.len();

            let seen_changed = last
                .as_ref()
                .is_some_and(|l| l.seen_message_id != snapshot.seen_message_id);
            if let Some(id) = snapshot.seen_message_id.as_deref().filter(|_| seen_changed) {
                if let Some(message) = snapshot.messages.iter().find(|m| m.id == id) {
                    println!("{}", render::message_line(&snapshot, message));
                }
            }

            let status = render::status_line(&snapshot);
            if last.as_ref().is_none_or(|l| render::status_line(l) != status) {
                eprintln!("-- {}", status);
            }
            last = Some(snapshot);

            if snapshots.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            view.blur();
            continue;
        }
        view.input_changed();
        match view.send(line) {
            Ok(()) => {}
            Err(ChatError::SelfConversation) => eprintln!("-- this conversation is read-only"),
            Err(ChatError::TransportDisconnected) => eprintln!("-- not connected, message not sent"),
            Err(e) => eprintln!("-- {}", e),
        }
    }

    view.close();
    printer.abort();
    channel.shutdown();
    Ok(())
}
