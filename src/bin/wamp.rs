//! WAMP command line client.
//!
//! # Commands
//!
//! - `call` - Call a procedure and print its result
//! - `publish` - Publish an event
//! - `subscribe` - Print events from a topic until interrupted

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use wamp::{
    codec::codec_for, event_handler, CallOptions, CallUpdate, Config, Dict, List, PublishOptions,
    RawSocketFactory, Session, SubscribeOptions, TicketAuthProvider, VERSION,
};

#[derive(Parser)]
#[command(name = "wamp")]
#[command(version = VERSION)]
#[command(about = "WAMP client - call, publish and subscribe from the command line", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/wamp/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Router endpoint (host:port)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Realm to join
    #[arg(short, long, global = true)]
    realm: Option<String>,

    /// Ticket for ticket authentication (needs --authid)
    #[arg(long, global = true)]
    ticket: Option<String>,

    /// Authentication id
    #[arg(long, global = true)]
    authid: Option<String>,

    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a procedure
    Call {
        /// Procedure URI
        procedure: String,

        /// Positional arguments as a JSON array
        #[arg(short, long)]
        args: Option<String>,

        /// Keyword arguments as a JSON object
        #[arg(short, long)]
        kwargs: Option<String>,

        /// Print progressive results as they arrive
        #[arg(short, long)]
        progress: bool,
    },

    /// Publish an event
    Publish {
        /// Topic URI
        topic: String,

        /// Positional arguments as a JSON array
        #[arg(short, long)]
        args: Option<String>,

        /// Keyword arguments as a JSON object
        #[arg(short, long)]
        kwargs: Option<String>,

        /// Wait for the router to acknowledge
        #[arg(long)]
        acknowledge: bool,
    },

    /// Print events published to a topic
    Subscribe {
        /// Topic URI
        topic: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?.with_env(),
        None => Config::load()?,
    };
    if let Some(endpoint) = &cli.endpoint {
        config.session.endpoint.clone_from(endpoint);
    }
    if let Some(realm) = &cli.realm {
        config.session.realm.clone_from(realm);
    }
    if cli.authid.is_some() {
        config.session.authid.clone_from(&cli.authid);
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli, config))
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn parse_args(args: Option<&str>) -> anyhow::Result<List> {
    match args {
        None => Ok(List::new()),
        Some(text) => match serde_json::from_str(text)? {
            Value::Array(list) => Ok(list),
            other => Ok(vec![other]),
        },
    }
}

fn parse_kwargs(kwargs: Option<&str>) -> anyhow::Result<Dict> {
    match kwargs {
        None => Ok(Dict::new()),
        Some(text) => match serde_json::from_str(text)? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("--kwargs must be a JSON object"),
        },
    }
}

fn print_payload(args: &List, kwargs: &Dict) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "args": args, "kwargs": kwargs });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let codec = codec_for(&config.transport.serializer)?;
    let factory = Arc::new(RawSocketFactory::new(
        Arc::from(codec),
        config.transport.max_message_size,
    ));

    let mut session = Session::new(config.session.clone(), config.retry.clone(), factory);
    if let Some(ticket) = cli.ticket {
        let authid = config
            .session
            .authid
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--ticket requires --authid"))?;
        session = session.with_auth(Arc::new(TicketAuthProvider::new(authid, ticket)));
    }

    let welcome = session.open().await?;
    tracing::info!("Session {} established", welcome.session);

    let outcome = match cli.command {
        Commands::Call {
            procedure,
            args,
            kwargs,
            progress,
        } => {
            cmd_call(
                &session,
                procedure,
                parse_args(args.as_deref())?,
                parse_kwargs(kwargs.as_deref())?,
                progress,
            )
            .await
        },
        Commands::Publish {
            topic,
            args,
            kwargs,
            acknowledge,
        } => {
            let options = PublishOptions {
                acknowledge,
                ..PublishOptions::default()
            };
            let publication = session
                .publish(
                    topic,
                    parse_args(args.as_deref())?,
                    parse_kwargs(kwargs.as_deref())?,
                    options,
                )
                .await?;
            match publication.published().await? {
                Some(id) => println!("Published (publication {id})"),
                None => println!("Published"),
            }
            Ok(())
        },
        Commands::Subscribe { topic } => cmd_subscribe(&session, topic).await,
    };

    let details = session.close().await;
    tracing::debug!("Closed: {} ({})", details.reason, details.code);
    outcome
}

async fn cmd_call(
    session: &Session,
    procedure: String,
    args: List,
    kwargs: Dict,
    progress: bool,
) -> anyhow::Result<()> {
    let options = CallOptions {
        receive_progress: progress,
        ..CallOptions::default()
    };
    let mut call = session.call(procedure, args, kwargs, options).await?;

    loop {
        tokio::select! {
            update = call.next() => match update {
                Some(Ok(CallUpdate::Progress(partial))) => {
                    eprintln!("(progress)");
                    print_payload(&partial.args, &partial.kwargs)?;
                },
                Some(Ok(CallUpdate::Final(result))) => {
                    print_payload(&result.args, &result.kwargs)?;
                    return Ok(());
                },
                Some(Err(err)) => return Err(err.into()),
                None => anyhow::bail!("call ended without a result"),
            },
            _ = tokio::signal::ctrl_c() => {
                call.cancel().await?;
                eprintln!("Cancelled");
            },
        }
    }
}

async fn cmd_subscribe(session: &Session, topic: String) -> anyhow::Result<()> {
    let subscription = session
        .subscribe(
            topic,
            event_handler(|event| {
                if let Err(err) = print_payload(&event.args, &event.kwargs) {
                    tracing::warn!("Failed to print event: {}", err);
                }
            }),
            SubscribeOptions::default(),
        )
        .await?;
    eprintln!(
        "Subscribed to {} ({}), Ctrl-C to stop",
        subscription.topic(),
        subscription.id()
    );

    tokio::select! {
        ended = subscription.unsubscribed() => ended?,
        _ = tokio::signal::ctrl_c() => subscription.unsubscribe().await?,
    }
    Ok(())
}
