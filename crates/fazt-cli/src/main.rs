//! Fazt CLI — command-line client for the Fazt personal platform.
//!
//! A standalone HTTP client that communicates with the Fazt server.
//! No internal crate dependencies — talks exclusively via the JSON API.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

// ── CLI structure ────────────────────────────────────────────────────

/// Fazt — your apps, your server.
#[derive(Parser)]
#[command(
    name = "fazt",
    version,
    about = "Fazt CLI — deploy apps, manage aliases, users, and keys",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         FAZT_ADDR   Server address (default: http://api.localhost:8080)\n  \
         FAZT_KEY    API key\n\n\
         {DIM}Examples:{RESET}\n  \
         fazt status\n  \
         fazt deploy ./my-blog --new \"My Blog\"\n  \
         fazt alias set blog --app 8f2c1a...\n  \
         fazt alias swap staging production"
    ),
)]
struct Cli {
    /// Fazt server address.
    #[arg(long, env = "FAZT_ADDR", default_value = "http://api.localhost:8080")]
    addr: String,

    /// API key.
    #[arg(long, env = "FAZT_KEY")]
    key: Option<String>,

    /// Print raw JSON responses.
    #[arg(long, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show server health, capacity, and runtime stats.
    Status,
    /// App operations.
    Apps {
        #[command(subcommand)]
        action: AppCommands,
    },
    /// Deploy a directory as an app.
    Deploy {
        /// Directory containing the app (with optional fazt.json manifest).
        dir: PathBuf,
        /// Deploy into an existing app id.
        #[arg(long)]
        app: Option<String>,
        /// Create a new app with this title, then deploy into it.
        #[arg(long)]
        new: Option<String>,
    },
    /// Alias operations.
    Alias {
        #[command(subcommand)]
        action: AliasCommands,
    },
    /// User operations.
    Users {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// API key operations.
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Show recent activity log entries.
    Logs {
        /// Only entries at or above this weight (0-9).
        #[arg(long, default_value = "0")]
        min_weight: u8,
        /// Maximum entries.
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Capacity tunables.
    Capacity {
        #[command(subcommand)]
        action: CapacityCommands,
    },
}

#[derive(Subcommand)]
enum AppCommands {
    /// List all apps.
    List,
    /// Inspect one app (aliases, file count, sizes).
    Info { id: String },
    /// Create an empty app.
    Create { title: String },
    /// Delete an app and everything it owns.
    Delete { id: String },
    /// Fork an app.
    Fork {
        id: String,
        /// Title for the fork.
        #[arg(long)]
        title: Option<String>,
        /// Also copy KV, documents, blobs, and files.
        #[arg(long, default_value = "false")]
        copy_storage: bool,
    },
}

#[derive(Subcommand)]
enum AliasCommands {
    /// List the routing table.
    List,
    /// Point a subdomain at an app.
    Set {
        subdomain: String,
        /// Target app id.
        #[arg(long)]
        app: String,
    },
    /// Point a subdomain at an external URL.
    Redirect {
        subdomain: String,
        #[arg(long)]
        url: String,
    },
    /// Delete an alias.
    Delete { subdomain: String },
    /// Atomically exchange the targets of two proxy aliases.
    Swap { a: String, b: String },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List users.
    List,
    /// Change a user's role (owner is preserved).
    Role {
        id: String,
        /// `admin` or `user`.
        role: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// List API keys (hashes only).
    List,
    /// Create a key. The plaintext is shown once.
    Create {
        name: String,
        /// Comma-separated scopes (e.g. `admin` or `deploy,logs`).
        #[arg(long, default_value = "admin")]
        scopes: String,
    },
    /// Revoke a key by id.
    Revoke { id: String },
}

#[derive(Subcommand)]
enum CapacityCommands {
    /// Show the derived tunables and overrides.
    Show,
    /// Re-probe the host and re-derive.
    Recalibrate,
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    addr: String,
    key: Option<String>,
}

impl Client {
    fn new(addr: String, key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_owned(),
            key,
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let mut builder = self.http.request(method, format!("{}{path}", self.addr));
        if let Some(key) = &self.key {
            builder = builder.bearer_auth(key);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed — is the server running?", self.addr))?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .context("server returned a non-JSON response")?;

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_str).unwrap_or("ERROR");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("{code}: {message}");
        }
        if !status.is_success() {
            bail!("server answered {status}");
        }
        Ok(value.get("data").cloned().unwrap_or(value))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(reqwest::Method::POST, path, Some(body)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value> {
        self.request(reqwest::Method::PUT, path, Some(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.request(reqwest::Method::DELETE, path, None).await
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let raw_json = cli.json;
    match run(cli).await {
        Ok(output) => {
            if raw_json {
                println!("{output:#}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<Value> {
    let json_mode = cli.json;
    let client = Client::new(cli.addr, cli.key);

    let output = match cli.command {
        Commands::Status => {
            let health = client.get("/health").await?;
            let stats = client.get("/api/sys/stats").await.unwrap_or(Value::Null);
            if !json_mode {
                let status = health.get("status").and_then(Value::as_str).unwrap_or("?");
                println!("{GREEN}{BOLD}●{RESET} server {status}");
                if let Some(vfs) = stats.get("vfs") {
                    println!(
                        "  cache    {} / {} bytes, {} pinned",
                        vfs["resident_bytes"], vfs["budget_bytes"], vfs["pinned_entries"]
                    );
                }
                if let Some(queue) = stats.get("queue") {
                    println!(
                        "  queue    {} pending / {} depth, {} committed",
                        queue["pending"], queue["depth"], queue["completed"]
                    );
                }
                if let Some(telemetry) = stats.get("telemetry") {
                    println!(
                        "  events   {} buffered, {} flushed, {} dropped",
                        telemetry["buffered"], telemetry["flushed"], telemetry["dropped"]
                    );
                }
            }
            json!({ "health": health, "stats": stats })
        }

        Commands::Apps { action } => match action {
            AppCommands::List => {
                let apps = client.get("/api/apps").await?;
                if !json_mode {
                    for app in apps.as_array().into_iter().flatten() {
                        println!(
                            "{CYAN}{}{RESET}  {}  {DIM}{}{RESET}",
                            app["id"].as_str().unwrap_or("?"),
                            app["title"].as_str().unwrap_or("?"),
                            app["origin"].as_str().unwrap_or("?"),
                        );
                    }
                }
                apps
            }
            AppCommands::Info { id } => {
                let info = client.get(&format!("/api/apps/{id}")).await?;
                if !json_mode {
                    println!("{info:#}");
                }
                info
            }
            AppCommands::Create { title } => {
                let app = client.post("/api/apps", json!({ "title": title })).await?;
                if !json_mode {
                    println!(
                        "{GREEN}created{RESET} {}",
                        app["id"].as_str().unwrap_or("?")
                    );
                }
                app
            }
            AppCommands::Delete { id } => {
                let result = client.delete(&format!("/api/apps/{id}")).await?;
                if !json_mode {
                    println!("{YELLOW}deleted{RESET} {id}");
                }
                result
            }
            AppCommands::Fork {
                id,
                title,
                copy_storage,
            } => {
                let fork = client
                    .post(
                        &format!("/api/apps/{id}/fork"),
                        json!({ "title": title, "copy_storage": copy_storage }),
                    )
                    .await?;
                if !json_mode {
                    println!(
                        "{GREEN}forked{RESET} {} -> {}",
                        id,
                        fork["id"].as_str().unwrap_or("?")
                    );
                }
                fork
            }
        },

        Commands::Deploy { dir, app, new } => {
            let payload = build_deploy_payload(&dir)?;
            let app_id = match (app, new) {
                (Some(id), _) => id,
                (None, Some(title)) => {
                    let created = client.post("/api/apps", json!({ "title": title })).await?;
                    created
                        .get("id")
                        .and_then(Value::as_str)
                        .context("server did not return an app id")?
                        .to_owned()
                }
                (None, None) => bail!("pass --app <id> or --new <title>"),
            };
            let summary = client
                .post(&format!("/api/apps/{app_id}/deploy"), payload)
                .await?;
            if !json_mode {
                println!(
                    "{GREEN}deployed{RESET} {} files ({} bytes) to {CYAN}{app_id}{RESET}",
                    summary["files"], summary["bytes"]
                );
            }
            summary
        }

        Commands::Alias { action } => match action {
            AliasCommands::List => {
                let aliases = client.get("/api/aliases").await?;
                if !json_mode {
                    for alias in aliases.as_array().into_iter().flatten() {
                        println!(
                            "{CYAN}{}{RESET}  {}",
                            alias["subdomain"].as_str().unwrap_or("?"),
                            alias["target"]
                        );
                    }
                }
                aliases
            }
            AliasCommands::Set { subdomain, app } => {
                client
                    .post(
                        "/api/aliases",
                        json!({
                            "subdomain": subdomain,
                            "target": { "kind": "proxy", "app_id": app }
                        }),
                    )
                    .await?
            }
            AliasCommands::Redirect { subdomain, url } => {
                client
                    .post(
                        "/api/aliases",
                        json!({
                            "subdomain": subdomain,
                            "target": { "kind": "redirect", "url": url }
                        }),
                    )
                    .await?
            }
            AliasCommands::Delete { subdomain } => {
                client.delete(&format!("/api/aliases/{subdomain}")).await?
            }
            AliasCommands::Swap { a, b } => {
                let result = client
                    .post("/api/aliases/swap", json!({ "a": a, "b": b }))
                    .await?;
                if !json_mode {
                    println!("{GREEN}swapped{RESET} {a} <-> {b}");
                }
                result
            }
        },

        Commands::Users { action } => match action {
            UserCommands::List => {
                let users = client.get("/api/users").await?;
                if !json_mode {
                    for user in users.as_array().into_iter().flatten() {
                        println!(
                            "{CYAN}{}{RESET}  {}  {DIM}{}{RESET}",
                            user["id"].as_str().unwrap_or("?"),
                            user["email"].as_str().unwrap_or("?"),
                            user["role"].as_str().unwrap_or("?"),
                        );
                    }
                }
                users
            }
            UserCommands::Role { id, role } => {
                client
                    .put(&format!("/api/users/{id}/role"), json!({ "role": role }))
                    .await?
            }
        },

        Commands::Keys { action } => match action {
            KeyCommands::List => {
                let keys = client.get("/api/keys").await?;
                if !json_mode {
                    for key in keys.as_array().into_iter().flatten() {
                        println!(
                            "{CYAN}{}{RESET}  {}  {DIM}{:?}{RESET}",
                            key["id"].as_str().unwrap_or("?"),
                            key["name"].as_str().unwrap_or("?"),
                            key["scopes"],
                        );
                    }
                }
                keys
            }
            KeyCommands::Create { name, scopes } => {
                let scopes: Vec<&str> = scopes.split(',').map(str::trim).collect();
                let created = client
                    .post("/api/keys", json!({ "name": name, "scopes": scopes }))
                    .await?;
                if !json_mode {
                    println!(
                        "{GREEN}created{RESET} — store this key now, it is shown once:\n{BOLD}{}{RESET}",
                        created["key"].as_str().unwrap_or("?")
                    );
                }
                created
            }
            KeyCommands::Revoke { id } => client.delete(&format!("/api/keys/{id}")).await?,
        },

        Commands::Logs { min_weight, limit } => {
            let entries = client
                .get(&format!(
                    "/api/logs/activity?min_weight={min_weight}&limit={limit}"
                ))
                .await?;
            if !json_mode {
                for entry in entries.as_array().into_iter().flatten() {
                    println!(
                        "{DIM}{}{RESET} [{}] {} {} -> {}",
                        entry["ts"].as_str().unwrap_or("?"),
                        entry["weight"],
                        entry["action"].as_str().unwrap_or("?"),
                        entry["resource"].as_str().unwrap_or("?"),
                        entry["result"].as_str().unwrap_or("?"),
                    );
                }
            }
            entries
        }

        Commands::Capacity { action } => match action {
            CapacityCommands::Show => {
                let capacity = client.get("/api/sys/capacity").await?;
                if !json_mode {
                    println!("{capacity:#}");
                }
                capacity
            }
            CapacityCommands::Recalibrate => {
                let capacity = client.post("/api/sys/recalibrate", json!({})).await?;
                if !json_mode {
                    println!("{GREEN}recalibrated{RESET}");
                }
                capacity
            }
        },
    };

    Ok(output)
}

// ── Deploy payload ───────────────────────────────────────────────────

/// Walk a directory into a deploy payload. A `fazt.json` at the root is
/// the manifest; without one, the directory name becomes the app name.
fn build_deploy_payload(dir: &Path) -> Result<Value> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let manifest_path = dir.join("fazt.json");
    let manifest: Value = if manifest_path.is_file() {
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        serde_json::from_str(&raw).context("fazt.json is not valid JSON")?
    } else {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_owned());
        json!({ "name": name })
    };

    let mut files = BTreeMap::new();
    collect_files(dir, dir, &mut files)?;

    let files: Vec<Value> = files
        .into_iter()
        .map(|(path, bytes)| json!({ "path": path, "content": BASE64.encode(bytes) }))
        .collect();

    Ok(json!({ "manifest": manifest, "files": files }))
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "fazt.json" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .context("path escaped deploy root")?
                .to_string_lossy()
                .replace('\\', "/");
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            files.insert(rel, bytes);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_includes_nested_files_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fazt.json"), r#"{"name": "blog", "spa": true}"#).unwrap();
        std::fs::write(dir.path().join("index.html"), "HELLO").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        std::fs::write(dir.path().join(".hidden"), "skip me").unwrap();

        let payload = build_deploy_payload(dir.path()).unwrap();
        assert_eq!(payload["manifest"]["name"], "blog");
        assert_eq!(payload["manifest"]["spa"], true);

        let files = payload["files"].as_array().unwrap();
        let paths: Vec<&str> = files
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["css/site.css", "index.html"]);
        assert_eq!(
            files[1]["content"].as_str().unwrap(),
            BASE64.encode("HELLO")
        );
    }

    #[test]
    fn missing_manifest_uses_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("my-blog");
        std::fs::create_dir(&app_dir).unwrap();
        std::fs::write(app_dir.join("index.html"), "x").unwrap();

        let payload = build_deploy_payload(&app_dir).unwrap();
        assert_eq!(payload["manifest"]["name"], "my-blog");
    }

    #[test]
    fn non_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        assert!(build_deploy_payload(&file).is_err());
    }
}
