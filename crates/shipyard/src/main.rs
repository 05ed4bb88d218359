use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use shipyard_client::daemon::{self, liveness::SystemProbe, DaemonOptions};
use shipyard_client::{ClientConfig, OutputNaming, UpdateClient, UpdateError};
use shipyard_server::store::{TokenKind, ANY_PROGRAM};
use shipyard_server::tokens::TokenAuthority;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "shipyard", about = "Shipyard: package distribution server and update client", version)]
struct Cli {
    /// Shipyard server URL ($SHIPYARD_SERVER)
    #[arg(long, global = true, env = "SHIPYARD_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token ($SHIPYARD_TOKEN)
    #[arg(long, global = true, env = "SHIPYARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the update client commands.
#[derive(Args)]
struct ClientArgs {
    /// Program identifier ($SHIPYARD_PROGRAM)
    #[arg(long, env = "SHIPYARD_PROGRAM")]
    program: String,
    /// Release channel ($SHIPYARD_CHANNEL)
    #[arg(long, env = "SHIPYARD_CHANNEL", default_value = "stable")]
    channel: String,
    /// Base64 package key; packages are decrypted after download when set
    #[arg(long, env = "SHIPYARD_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,
    /// Request timeout, e.g. 30s
    #[arg(long, env = "SHIPYARD_TIMEOUT", default_value = "30s")]
    timeout: humantime::Duration,
    /// Download attempts after the first
    #[arg(long, env = "SHIPYARD_MAX_RETRIES", default_value = "3")]
    max_retries: u32,
    /// Directory for downloads without --output
    #[arg(long, env = "SHIPYARD_SAVE_PATH", default_value = "./updates")]
    save_path: PathBuf,
    /// Output naming: fixed, version or date
    #[arg(long, env = "SHIPYARD_NAMING", default_value = "fixed")]
    naming: String,
    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Shipyard HTTP server
    Serve {
        /// Port to listen on ($SHIPYARD_PORT)
        #[arg(long, env = "SHIPYARD_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind ($SHIPYARD_HOST)
        #[arg(long, env = "SHIPYARD_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Check whether a newer version is published
    Check {
        /// Version currently installed
        #[arg(long)]
        current_version: String,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Download, verify and decrypt a version
    Download {
        /// Version to download
        #[arg(long)]
        version: String,
        /// Output file (default: derived from --save-path and --naming)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run as a background daemon with a local control server
        #[arg(long, requires = "port")]
        daemon: bool,
        /// Control server port for --daemon
        #[arg(long)]
        port: Option<u16>,
        /// Process to supervise; the daemon exits when it dies (0 disables)
        #[arg(long)]
        parent_pid: Option<u32>,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Manage programs (admin token)
    Program {
        #[command(subcommand)]
        command: ProgramCommands,
    },
    /// Manage access tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Manage package encryption keys (admin token)
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Upload a package as a new version (upload token)
    Publish {
        /// Program identifier
        #[arg(long, env = "SHIPYARD_PROGRAM")]
        program: String,
        /// Release channel
        #[arg(long, env = "SHIPYARD_CHANNEL", default_value = "stable")]
        channel: String,
        /// Version being published
        #[arg(long)]
        version: String,
        /// Package file
        file: PathBuf,
        /// Release notes
        #[arg(long, default_value = "")]
        notes: String,
        /// Mark the update as mandatory
        #[arg(long)]
        mandatory: bool,
        /// Encrypt the package with this base64 key before uploading
        #[arg(long, env = "SHIPYARD_ENCRYPTION_KEY", hide_env_values = true)]
        encryption_key: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProgramCommands {
    /// Register a program; prints its tokens and package key once
    Create {
        /// Program identifier
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List programs
    List,
    /// Show a program, its package key and its active tokens
    Get {
        /// Program identifier
        id: String,
    },
    /// Deactivate a program and revoke its tokens; published versions are kept
    Delete {
        /// Program identifier
        id: String,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a token directly into the data directory (server must be stopped)
    Issue {
        /// Scope: admin, upload or download
        #[arg(long)]
        kind: String,
        /// Program the token is bound to; `*` for all programs
        #[arg(long, default_value = ANY_PROGRAM)]
        program: String,
        /// Lifetime, e.g. 30d (default: no expiry)
        #[arg(long)]
        expires_in: Option<humantime::Duration>,
        /// Data directory ($SHIPYARD_DATA_DIR)
        #[arg(long, env = "SHIPYARD_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Revoke a token by id
    Revoke { token_id: String },
    /// Replace a program's upload or download token
    Regenerate {
        program: String,
        /// upload or download
        #[arg(long = "type")]
        kind: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Replace a program's package encryption key
    Rotate { program: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SHIPYARD_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Check {
            current_version,
            client,
        } => {
            let json = client.json;
            let config = client_config(&cli.server, cli.token.clone(), client)?;
            report(json, cmd_check(config, &current_version, json).await)
        }

        Commands::Download {
            version,
            output,
            daemon,
            port,
            parent_pid,
            client,
        } => {
            let json = client.json;
            let config = client_config(&cli.server, cli.token.clone(), client)?;
            let result = match (daemon, port) {
                (true, Some(port)) => {
                    let options = DaemonOptions {
                        version,
                        output,
                        port,
                        parent_pid: parent_pid.unwrap_or_else(default_parent_pid),
                    };
                    cmd_daemon(config, options).await
                }
                _ => cmd_download(config, &version, output.as_deref(), json).await,
            };
            report(json, result)
        }

        Commands::Program { command } => {
            let token = require_token(&cli.token)?;
            match command {
                ProgramCommands::Create {
                    id,
                    name,
                    description,
                } => cmd_program_create(&cli.server, &token, &id, name, &description).await,
                ProgramCommands::List => cmd_program_list(&cli.server, &token).await,
                ProgramCommands::Get { id } => {
                    let path = format!("programs/{id}");
                    let body = api_call(Client::new().get(api_url(&cli.server, &path)), &token).await?;
                    println!("{}", serde_json::to_string_pretty(&body)?);
                    Ok(())
                }
                ProgramCommands::Delete { id } => {
                    let path = format!("programs/{id}");
                    let body =
                        api_call(Client::new().delete(api_url(&cli.server, &path)), &token).await?;
                    let revoked = body["revokedTokens"].as_array().map_or(0, Vec::len);
                    println!("✓ deactivated program {id} ({revoked} tokens revoked)");
                    Ok(())
                }
            }
        }

        Commands::Token { command } => match command {
            TokenCommands::Issue {
                kind,
                program,
                expires_in,
                data_dir,
            } => cmd_token_issue(&kind, &program, expires_in.map(Into::into), data_dir),
            TokenCommands::Revoke { token_id } => {
                let token = require_token(&cli.token)?;
                api_call(
                    Client::new().delete(api_url(&cli.server, &format!("tokens/{token_id}"))),
                    &token,
                )
                .await?;
                println!("✓ revoked {token_id}");
                Ok(())
            }
            TokenCommands::Regenerate { program, kind } => {
                let token = require_token(&cli.token)?;
                let body = api_call(
                    Client::new()
                        .post(api_url(
                            &cli.server,
                            &format!("programs/{program}/tokens/regenerate"),
                        ))
                        .query(&[("type", kind.as_str())]),
                    &token,
                )
                .await?;
                println!("token id: {}", body["tokenId"].as_str().unwrap_or(""));
                println!("{} token: {}", kind, body["token"].as_str().unwrap_or(""));
                Ok(())
            }
        },

        Commands::Key {
            command: KeyCommands::Rotate { program },
        } => {
            let token = require_token(&cli.token)?;
            let body = api_call(
                Client::new().post(api_url(
                    &cli.server,
                    &format!("programs/{program}/encryption/regenerate"),
                )),
                &token,
            )
            .await?;
            println!("encryption key: {}", body["encryptionKey"].as_str().unwrap_or(""));
            Ok(())
        }

        Commands::Publish {
            program,
            channel,
            version,
            file,
            notes,
            mandatory,
            encryption_key,
        } => {
            let token = require_token(&cli.token)?;
            let upload = Upload {
                program: &program,
                channel: &channel,
                version: &version,
                notes: &notes,
                mandatory,
            };
            cmd_publish(&cli.server, &token, upload, &file, encryption_key.as_deref()).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = shipyard_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    info!(host = %cfg.host, port = cfg.port, "starting shipyard server");
    shipyard_server::run(cfg).await
}

async fn cmd_check(config: ClientConfig, current: &str, json: bool) -> Result<()> {
    let client = UpdateClient::new(config)?;
    let update = client.check_update(current).await?;

    if json {
        let out = match &update {
            Some(m) => json!({
                "hasUpdate": true,
                "currentVersion": current,
                "latestVersion": m.version,
                "fileSize": m.file_size,
                "releaseNotes": m.release_notes,
                "publishDate": m.publish_date,
                "mandatory": m.mandatory,
            }),
            None => json!({ "hasUpdate": false, "currentVersion": current }),
        };
        println!("{out}");
        return Ok(());
    }

    match update {
        None => println!("up to date ({current})"),
        Some(m) => {
            println!("update available: {current} -> {}", m.version);
            println!("  size:      {} bytes", m.file_size);
            println!("  published: {}", m.publish_date.to_rfc3339());
            if m.mandatory {
                println!("  mandatory: yes");
            }
            if !m.release_notes.is_empty() {
                println!("  notes:     {}", m.release_notes);
            }
        }
    }
    Ok(())
}

async fn cmd_download(
    config: ClientConfig,
    version: &str,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let client = UpdateClient::new(config)?;
    let mut last_percent = -1i64;
    let result = client
        .download_update(version, output, |p| {
            if json {
                return;
            }
            let percent = p.percentage as i64;
            if percent / 10 != last_percent / 10 {
                last_percent = percent;
                eprintln!(
                    "  {:>3}%  {}/{} bytes  {:.0} B/s",
                    percent, p.downloaded, p.total, p.speed
                );
            }
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("✓ downloaded {version} to {}", result.file);
        println!(
            "  {} bytes, verified: {}, decrypted: {}",
            result.file_size, result.verified, result.decrypted
        );
    }
    Ok(())
}

async fn cmd_daemon(config: ClientConfig, options: DaemonOptions) -> Result<()> {
    let client = UpdateClient::new(config)?;
    info!(
        version = %options.version,
        port = options.port,
        parent_pid = options.parent_pid,
        "launching download daemon"
    );
    daemon::run(client, options, SystemProbe).await?;
    Ok(())
}

async fn cmd_program_create(
    server: &str,
    token: &str,
    id: &str,
    name: Option<String>,
    description: &str,
) -> Result<()> {
    let body = api_call(
        Client::new().post(api_url(server, "programs")).json(&json!({
            "programId": id,
            "name": name,
            "description": description,
        })),
        token,
    )
    .await?;

    println!("✓ created program {id}");
    println!("upload token:   {}", body["uploadToken"].as_str().unwrap_or(""));
    println!("download token: {}", body["downloadToken"].as_str().unwrap_or(""));
    println!("encryption key: {}", body["encryptionKey"].as_str().unwrap_or(""));
    println!("These values are shown once. Store them now.");
    Ok(())
}

async fn cmd_program_list(server: &str, token: &str) -> Result<()> {
    let body = api_call(Client::new().get(api_url(server, "programs")), token).await?;
    let programs = body["programs"].as_array().cloned().unwrap_or_default();
    if programs.is_empty() {
        println!("(no programs)");
        return Ok(());
    }
    for p in &programs {
        let state = if p["active"].as_bool().unwrap_or(false) {
            "active"
        } else {
            "inactive"
        };
        println!(
            "  {}  {}  ({state})",
            p["programId"].as_str().unwrap_or(""),
            p["name"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_token_issue(
    kind: &str,
    program: &str,
    ttl: Option<Duration>,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let kind = TokenKind::parse(kind)
        .with_context(|| format!("unknown token kind {kind:?}: expected admin, upload or download"))?;
    let data_dir = shipyard_server::resolve_data_dir(data_dir.as_ref())?;
    let store = shipyard_server::open_store(&data_dir)
        .context("open store (is the server still running?)")?;
    let issued = TokenAuthority::new(store).issue_expiring(program, kind, "cli", ttl)?;
    info!(token_id = %issued.record.token_id, %kind, program, "token issued offline");

    println!("token id: {}", issued.record.token_id);
    println!("{kind} token: {}", issued.secret);
    Ok(())
}

struct Upload<'a> {
    program: &'a str,
    channel: &'a str,
    version: &'a str,
    notes: &'a str,
    mandatory: bool,
}

async fn cmd_publish(
    server: &str,
    token: &str,
    upload: Upload<'_>,
    file: &Path,
    encryption_key: Option<&str>,
) -> Result<()> {
    let bytes = match encryption_key {
        Some(key) => {
            let sealed = file.with_extension("pkg.enc");
            shipyard_client::encrypt_package(file, &sealed, key)?;
            let bytes = tokio::fs::read(&sealed).await;
            let _ = tokio::fs::remove_file(&sealed).await;
            bytes.with_context(|| format!("read {}", sealed.display()))?
        }
        None => tokio::fs::read(file)
            .await
            .with_context(|| format!("read {}", file.display()))?,
    };

    let path = format!(
        "programs/{}/versions/{}/{}",
        upload.program, upload.channel, upload.version
    );
    let mandatory = upload.mandatory.to_string();
    let body = api_call(
        Client::new()
            .put(api_url(server, &path))
            .query(&[("notes", upload.notes), ("mandatory", mandatory.as_str())])
            .body(bytes),
        token,
    )
    .await?;

    println!(
        "✓ published {} {} ({})",
        upload.program, upload.version, upload.channel
    );
    println!("  sha256: {}", body["fileHash"].as_str().unwrap_or(""));
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn client_config(server: &str, token: Option<String>, args: ClientArgs) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(server, args.program);
    config.channel = args.channel;
    config.token = token;
    config.encryption_key = args.encryption_key;
    config.timeout = args.timeout.into();
    config.max_retries = args.max_retries;
    config.save_path = args.save_path;
    config.naming = args.naming.parse::<OutputNaming>()?;
    Ok(config)
}

/// In JSON mode, failures become `{success:false, error}` on stdout and a
/// non-zero exit.
fn report(json: bool, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if json => {
            let message = match e.downcast_ref::<UpdateError>() {
                Some(err) => err.to_string(),
                None => format!("{e:#}"),
            };
            println!("{}", json!({ "success": false, "error": message }));
            std::process::exit(1);
        }
        other => other,
    }
}

fn require_token(token: &Option<String>) -> Result<String> {
    token
        .clone()
        .context("--token / SHIPYARD_TOKEN is required for this command")
}

fn api_url(server: &str, path: &str) -> String {
    format!("{}/api/{}", server.trim_end_matches('/'), path)
}

async fn api_call(req: reqwest::RequestBuilder, token: &str) -> Result<Value> {
    let resp = req
        .bearer_auth(token)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            body["error"].as_str().unwrap_or("")
        );
    }
    Ok(body)
}

#[cfg(unix)]
fn default_parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn default_parent_pid() -> u32 {
    0
}
