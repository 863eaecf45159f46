//! Echo demo.
//!
//! Serves a login portal whose avatars echo values, hand out a profile by
//! copy and share a scoreboard by cache.
//!
//! Run a server and call it:
//!   cargo run -p perspective-demo-echo -- serve --port 8001 --user alice:wonderland
//!   cargo run -p perspective-demo-echo -- call --url ws://127.0.0.1:8001/ --user alice:wonderland hello

mod objects;

use clap::{Parser, Subcommand};
use perspective_broker::{
    BrokerConfig, BrokerOptions, Portal, RemoteCacheHandle, TypeRegistry, Value, listen,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Perspective echo demo")]
struct Cli {
    /// Broker settings (TOML).
    #[arg(long, env = "PERSPECTIVE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the login portal.
    Serve {
        #[arg(long, default_value_t = 8001)]
        port: u16,
        /// Account as `name:password`; repeat for more.
        #[arg(long = "user", required = true)]
        users: Vec<String>,
    },
    /// Log in, echo a message and show the shared objects.
    Call {
        #[arg(long, default_value = "ws://127.0.0.1:8001/")]
        url: String,
        /// Credentials as `name:password`.
        #[arg(long)]
        user: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("perspective_broker=info".parse()?)
                .add_directive("perspective_demo_echo=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    let registry = TypeRegistry::global();
    objects::register(&registry)?;
    let options = BrokerOptions::new(config, registry);

    match cli.command {
        Command::Serve { port, users } => serve(port, users, options).await,
        Command::Call { url, user, message } => call(&url, &user, message, options).await,
    }
}

fn credentials(spec: &str) -> anyhow::Result<(String, String)> {
    let (name, password) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected name:password, got {spec:?}"))?;
    Ok((name.to_string(), password.to_string()))
}

async fn serve(port: u16, users: Vec<String>, options: BrokerOptions) -> anyhow::Result<()> {
    let passwords = users
        .iter()
        .map(|spec| credentials(spec))
        .collect::<anyhow::Result<HashMap<_, _>>>()?;
    tracing::info!("Starting echo portal with {} accounts", passwords.len());

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let portal = Portal::new(Arc::new(objects::Accounts::new(passwords)));
    listen(addr, Arc::new(portal), options).await?;
    Ok(())
}

async fn call(url: &str, user: &str, message: String, options: BrokerOptions) -> anyhow::Result<()> {
    let (name, password) = credentials(user)?;
    let (broker, root) = perspective_broker::connect(url, options).await?;
    let avatar = perspective_broker::login(&root, &name, &password, None).await?;
    tracing::info!("Logged in as {}", name);

    let echoed = avatar.call_remote("echo", vec![Value::from(message)]).await?;
    println!("echo: {echoed:?}");

    let profile = avatar.call_remote("profile", ()).await?;
    if let Some(profile) = profile.downcast_copy::<objects::RemoteProfile>() {
        println!(
            "profile: {} (seen by {})",
            profile.name,
            profile.seen_by.as_deref().unwrap_or("nobody")
        );
    }

    let board: RemoteCacheHandle = perspective_broker::FromValue::from_value(
        avatar.call_remote("scoreboard", ()).await?,
    )?;
    avatar.call_remote("score", ()).await?;
    let scores = board.read(|b: &objects::RemoteScoreboard| b.scores.clone());
    println!("scores: {:?}", scores.unwrap_or_default());

    broker.close();
    broker.closed().await;
    Ok(())
}
