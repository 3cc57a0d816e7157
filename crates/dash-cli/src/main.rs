//! dashctl - operator CLI for the dashboard gateway
//!
//! Connects with the same protocol layer the dashboard uses, which makes it
//! handy for poking at a gateway by hand and for debugging handshakes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dash_gateway::{DeviceSigner, Ed25519Signer, GatewayConfig, GatewayConnection, Identity};
use dash_proto::SignatureInput;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dashctl")]
#[command(about = "Talk to a dashboard gateway from the command line")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    conn: ConnectArgs,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print the diagnostic log on exit
    #[arg(long, global = true)]
    dump_diagnostics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectArgs {
    /// Gateway WebSocket URL
    #[arg(long, global = true, env = "DASH_GATEWAY_URL")]
    url: Option<String>,

    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Session token from a prior connection
    #[arg(long, global = true, env = "DASH_GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base64 Ed25519 secret key; an ephemeral key is used when absent
    #[arg(long, global = true, env = "DASH_DEVICE_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Client id announced in the handshake
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Requested role
    #[arg(long, global = true)]
    role: Option<String>,

    /// Requested scope (repeatable)
    #[arg(long = "scope", global = true)]
    scopes: Vec<String>,

    /// How long to wait for the connection to become ready
    #[arg(long, global = true, default_value = "10000")]
    ready_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a gateway method and print the result
    Call {
        /// Method name, e.g. `stats.get`
        method: String,

        /// Params as a JSON document
        #[arg(long)]
        params: Option<String>,

        /// Per-call timeout override
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print events until interrupted
    Watch {
        /// Event name or wildcard pattern
        #[arg(long, default_value = "*")]
        pattern: String,
    },

    /// Print the server snapshot
    Snapshot,

    /// Generate a device key
    Keygen,

    /// Print the canonical handshake message for the given inputs
    SignMessage {
        /// Device id
        #[arg(long)]
        device_id: String,

        /// Client mode
        #[arg(long, default_value = "ui")]
        mode: String,

        /// Signing time in milliseconds since the epoch
        #[arg(long)]
        signed_at_ms: u64,

        /// Server nonce
        #[arg(long)]
        nonce: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    match &cli.command {
        Commands::Keygen => keygen(),
        Commands::SignMessage {
            device_id,
            mode,
            signed_at_ms,
            nonce,
        } => sign_message(&cli.conn, device_id, mode, *signed_at_ms, nonce.as_deref()),
        command => {
            let conn = open(&cli.conn).await?;
            let result = run_connected(&conn, command).await;
            if cli.dump_diagnostics {
                println!("{}", conn.export_diagnostics());
            }
            conn.close();
            result
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("dash_gateway=info,dashctl=info"),
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

fn build_config(args: &ConnectArgs) -> anyhow::Result<GatewayConfig> {
    let mut config = match (&args.config, &args.url) {
        (Some(path), _) => GatewayConfig::from_file(path)?,
        (None, Some(url)) => GatewayConfig::new(url.clone()),
        (None, None) => anyhow::bail!("either --url or --config is required"),
    };

    if let (Some(_), Some(url)) = (&args.config, &args.url) {
        config.url.clone_from(url);
    }
    if args.token.is_some() {
        config.token.clone_from(&args.token);
    }
    if let Some(client_id) = &args.client_id {
        config.identity.client_id.clone_from(client_id);
    }
    if let Some(role) = &args.role {
        config.identity.role.clone_from(role);
    }
    if !args.scopes.is_empty() {
        config.identity.scopes.clone_from(&args.scopes);
    }

    config.validate()?;
    Ok(config)
}

fn load_signer(args: &ConnectArgs) -> anyhow::Result<Ed25519Signer> {
    match &args.key {
        Some(key) => Ok(Ed25519Signer::from_secret_base64(key)?),
        None => {
            warn!("no device key given, using an ephemeral one");
            Ok(Ed25519Signer::generate())
        }
    }
}

async fn open(args: &ConnectArgs) -> anyhow::Result<GatewayConnection> {
    let config = build_config(args)?;
    let signer = load_signer(args)?;
    info!(url = %config.url, device = %signer.device_id(), "connecting");

    let conn = GatewayConnection::websocket(Arc::new(signer));
    conn.connect(config)?;
    conn.wait_ready(Duration::from_millis(args.ready_timeout_ms))
        .await
        .context("gateway did not become ready")?;

    if let Some(session) = conn.session() {
        info!(
            session = ?session.session_id,
            server = ?session.server_version,
            state_version = conn.state_version(),
            "connected"
        );
    }
    Ok(conn)
}

async fn run_connected(conn: &GatewayConnection, command: &Commands) -> anyhow::Result<()> {
    match command {
        Commands::Call {
            method,
            params,
            timeout_ms,
        } => {
            let params = params
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .context("--params is not valid JSON")?;
            let payload = match timeout_ms {
                Some(ms) => {
                    conn.call_with_timeout(method, params, Duration::from_millis(*ms))
                        .await?
                }
                None => conn.call(method, params).await?,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Commands::Watch { pattern } => {
            let _events = conn.on(pattern.clone(), |event| match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, event = %event.event, "unprintable event"),
            });
            let _states = conn.on_state_change(|change| {
                info!(from = %change.from, to = %change.to, reason = ?change.reason, "state changed");
            });
            info!(pattern = %pattern, "watching, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }

        Commands::Snapshot => {
            let mut rx = conn.subscribe_snapshot();
            let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(Option::is_some))
                .await
                .context("no snapshot received")??
                .clone();
            if let Some(snapshot) = snapshot {
                println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            }
        }

        Commands::Keygen | Commands::SignMessage { .. } => {}
    }
    Ok(())
}

fn keygen() -> anyhow::Result<()> {
    let signer = Ed25519Signer::generate();
    let out = json!({
        "secretKey": signer.secret_base64(),
        "publicKey": signer.public_key(),
        "deviceId": signer.device_id(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn sign_message(
    args: &ConnectArgs,
    device_id: &str,
    mode: &str,
    signed_at_ms: u64,
    nonce: Option<&str>,
) -> anyhow::Result<()> {
    let message = canonical_message(args, device_id, mode, signed_at_ms, nonce);
    println!("{message}");

    if let Some(key) = &args.key {
        let signer = Ed25519Signer::from_secret_base64(key)?;
        println!("{}", signer.sign(&message));
    }
    Ok(())
}

/// Canonical handshake message, falling back to the default identity for
/// anything not given on the command line.
fn canonical_message(
    args: &ConnectArgs,
    device_id: &str,
    mode: &str,
    signed_at_ms: u64,
    nonce: Option<&str>,
) -> String {
    let defaults = Identity::default();
    SignatureInput {
        device_id,
        client_id: args.client_id.as_deref().unwrap_or(&defaults.client_id),
        client_mode: mode,
        role: args.role.as_deref().unwrap_or(&defaults.role),
        scopes: &args.scopes,
        signed_at_ms,
        token: args.token.as_deref(),
        nonce,
    }
    .canonical_message()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_case::test_case;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dashctl").chain(args.iter().copied())).unwrap()
    }

    fn config_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_url_only_uses_defaults() {
        let cli = parse(&["--url", "ws://localhost:9000/ws", "snapshot"]);
        let config = build_config(&cli.conn).unwrap();
        assert_eq!(config.url, "ws://localhost:9000/ws");
        assert_eq!(config.identity, Identity::default());
        assert!(config.token.is_none());
    }

    #[test]
    fn test_flags_override_config_file() {
        let file = config_file(
            r#"{"url": "wss://prod.example/ws", "token": "old",
                "identity": {"clientId": "board", "role": "viewer", "scopes": ["chat"]}}"#,
        );
        let path = file.path().to_str().unwrap();
        let cli = parse(&[
            "-c", path, "--url", "ws://localhost:1/ws", "--token", "fresh", "--scope", "pm.read",
            "--scope", "pm.write", "call", "stats.get",
        ]);

        let config = build_config(&cli.conn).unwrap();
        assert_eq!(config.url, "ws://localhost:1/ws");
        assert_eq!(config.token.as_deref(), Some("fresh"));
        assert_eq!(config.identity.client_id, "board");
        assert_eq!(config.identity.role, "viewer");
        assert_eq!(config.identity.scopes, vec!["pm.read", "pm.write"]);
    }

    #[test]
    fn test_config_file_scopes_kept_without_flags() {
        let file = config_file(r#"{"url": "ws://h/ws", "identity": {"scopes": ["chat"]}}"#);
        let cli = parse(&["--config", file.path().to_str().unwrap(), "snapshot"]);
        assert_eq!(build_config(&cli.conn).unwrap().identity.scopes, vec!["chat"]);
    }

    #[test_case(&["snapshot"], "either --url or --config" ; "no url or config")]
    #[test_case(&["--url", "http://h/ws", "snapshot"], "scheme" ; "http scheme")]
    #[test_case(&["--url", "ws://h/ws", "--scope", "a,b", "snapshot"], "commas" ; "comma in scope")]
    #[test_case(&["--url", "ws://h/ws", "--role", "", "snapshot"], "role" ; "empty role")]
    fn test_build_config_rejects(args: &[&str], needle: &str) {
        let cli = parse(args);
        let err = build_config(&cli.conn).unwrap_err();
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["watch", "--pattern", "pm.*", "--url", "ws://h/ws", "--json"]);
        assert!(cli.json);
        assert_eq!(cli.conn.url.as_deref(), Some("ws://h/ws"));
        assert!(matches!(cli.command, Commands::Watch { ref pattern } if pattern == "pm.*"));
    }

    #[test]
    fn test_sign_message_defaults() {
        let cli = parse(&["sign-message", "--device-id", "dev1", "--signed-at-ms", "42"]);
        let Commands::SignMessage {
            device_id,
            mode,
            signed_at_ms,
            nonce,
        } = &cli.command
        else {
            panic!("expected sign-message");
        };
        assert_eq!(
            canonical_message(&cli.conn, device_id, mode, *signed_at_ms, nonce.as_deref()),
            "v1|dev1|dash-gateway|ui|operator||42|"
        );
    }

    #[test]
    fn test_sign_message_with_nonce_and_overrides() {
        let cli = parse(&[
            "--client-id", "board", "--role", "admin", "--scope", "chat", "--scope", "pm.read",
            "--token", "t0", "sign-message", "--device-id", "dev1", "--signed-at-ms", "7",
            "--nonce", "abc",
        ]);
        assert_eq!(
            canonical_message(&cli.conn, "dev1", "ui", 7, Some("abc")),
            "v2|dev1|board|ui|admin|chat,pm.read|7|t0|abc"
        );
    }
}
