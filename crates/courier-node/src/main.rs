//! # courier-node
//!
//! Wallet-addressed direct messaging over a libp2p GossipSub mesh.
//!
//! The binary:
//! - bootstraps one network session and keeps it for the process lifetime
//!   (`/connect` retries a failed bootstrap)
//! - reopens every conversation already in the local log once ready
//! - persists and announces inbound messages
//! - reads commands from stdin (`/help` lists them)

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use courier_net::{SessionManager, SessionState, SwarmNodeFactory};
use courier_node::commands::{Command, CommandError, HELP};
use courier_node::config::NodeConfig;
use courier_node::delivery::DeliveryCoordinator;
use courier_store::{Database, ReadTarget, StoreError};

type Coordinator = DeliveryCoordinator<Database>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_node=debug,courier_net=debug")),
        )
        .init();

    info!("Starting Courier node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(
        listen_port = config.listen_port,
        db_path = ?config.db_path,
        bootstrap_file = ?config.bootstrap_file,
        bootstrap_peers = config.bootstrap_peers.len(),
        bootstrap_timeout = ?config.bootstrap_timeout,
        stable_key = config.key_seed.is_some(),
        "Loaded configuration"
    );

    let identity = config
        .identity()
        .context("COURIER_ADDRESS must be set")?
        .context("Invalid COURIER_ADDRESS")?;
    info!(user_id = %identity.user_id, address = %identity.address, "Local identity");

    // -----------------------------------------------------------------------
    // 3. Open the message log
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Database::open_at(path)?
        }
        None => Database::new()?,
    };
    let store = Arc::new(Mutex::new(db));

    // -----------------------------------------------------------------------
    // 4. Network session + delivery
    // -----------------------------------------------------------------------
    let session = Arc::new(SessionManager::new(
        Arc::new(SwarmNodeFactory),
        config.node_options(),
    ));
    let coordinator = Arc::new(DeliveryCoordinator::new(
        identity,
        session.clone(),
        store.clone(),
        store.clone(),
    ));

    connect(&session, &coordinator);

    let mut received = coordinator.received();
    tokio::spawn(async move {
        loop {
            match received.recv().await {
                Ok(message) => {
                    let from = message.sender_name().unwrap_or(&message.sender_address);
                    println!("<{from}> {}", message.content);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Display fell behind inbound messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Command loop (blocks until /quit, EOF or Ctrl+C)
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed, shutting down");
                    break;
                };
                match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => run_command(command, &coordinator, &session, &store).await,
                    Err(CommandError::Empty) => {}
                    Err(e) => println!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    session.release().await;
    Ok(())
}

/// Start the network session from `Idle` or `Failed` and reopen known
/// conversations once it is ready. Returns false if nothing was started.
fn connect(session: &SessionManager, coordinator: &Arc<Coordinator>) -> bool {
    if !matches!(session.state(), SessionState::Idle | SessionState::Failed(_)) {
        return false;
    }
    let mut readiness = session.acquire();

    let on_ready = coordinator.clone();
    tokio::spawn(async move {
        match readiness.wait_ready().await {
            Ok(()) => {
                if let Err(e) = on_ready.resubscribe_known().await {
                    warn!(error = %e, "Could not reopen known conversations");
                }
                println!("network ready");
            }
            Err(e) => {
                error!(error = %e, "Network session unavailable");
                println!("network unavailable: {e} (/connect to retry)");
            }
        }
    });
    true
}

async fn run_command(
    command: Command,
    coordinator: &Arc<Coordinator>,
    session: &SessionManager,
    store: &Mutex<Database>,
) {
    let result: anyhow::Result<String> = async {
        Ok(match command {
            Command::Send {
                receiver_id,
                receiver_address,
                content,
            } => {
                let message = coordinator
                    .send(&receiver_id, &receiver_address, &content)
                    .await?;
                format!("sent {}", message.message_id)
            }
            Command::Open(address) => {
                let topic = coordinator.open_conversation(&address).await?;
                format!("listening on {topic}")
            }
            Command::Close(address) => {
                coordinator.close_conversation(&address).await?;
                format!("closed {address}")
            }
            Command::List => serde_json::to_string_pretty(&coordinator.conversations()?)?,
            Command::ReadOne(message_id) => {
                let n = coordinator.mark_read(&ReadTarget::Message(message_id.clone()))?;
                if n == 0 {
                    // Tell an unknown id apart from one already read.
                    let db = store.lock().unwrap_or_else(PoisonError::into_inner);
                    match db.get_message_by_id(&message_id) {
                        Ok(_) => format!("{message_id} already read"),
                        Err(StoreError::NotFound) => format!("no message {message_id}"),
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    format!("{n} marked read")
                }
            }
            Command::ReadAll => format!("{} marked read", coordinator.mark_all_read()?),
            Command::Notifications => {
                let user_id = &coordinator.identity().user_id;
                let db = store.lock().unwrap_or_else(PoisonError::into_inner);
                let unseen = db.unseen_notifications(user_id)?;
                db.mark_notifications_seen(user_id)?;
                serde_json::to_string_pretty(&unseen)?
            }
            Command::User(user_id) => {
                let db = store.lock().unwrap_or_else(PoisonError::into_inner);
                match db.get_user(&user_id)? {
                    Some(user) => serde_json::to_string_pretty(&user)?,
                    None => format!("no user {user_id}"),
                }
            }
            Command::Status => format!("{:?}", session.state()),
            Command::Connect => {
                if connect(session, coordinator) {
                    "connecting".to_string()
                } else {
                    format!("nothing to retry ({:?})", session.state())
                }
            }
            Command::Help => HELP.to_string(),
            Command::Quit => String::new(),
        })
    }
    .await;

    match result {
        Ok(output) => println!("{output}"),
        Err(e) => println!("error: {e}"),
    }
}
