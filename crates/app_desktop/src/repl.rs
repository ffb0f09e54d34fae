use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use core_types::{Conversation, GatewayError, Message, ProviderKind};
use futures::StreamExt;
use gateway::Gateway;
use i18n::I18n;
use profile_registry::{ProfileRegistry, SecretExport};
use storage_sqlite::SqliteStorage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";

const HELP: &str = "\
commands:
  /new                 start a new conversation
  /list                recent conversations
  /open <n>            reopen conversation n from the last listing
  /search <text>       search titles and messages
  /profiles            list profiles
  /use <n>             switch to profile n
  /default <n>         make profile n the default
  /test                probe the active profile
  /models              refresh the ollama model list
  /export <file> [--with-keys]
  /import <file>
  /quit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Help,
    Quit,
    New,
    List,
    Open(usize),
    Search(String),
    Profiles,
    Use(usize),
    Default(usize),
    Test,
    Models,
    Export { path: PathBuf, with_keys: bool },
    Import(PathBuf),
    Say(String),
    Invalid(String),
}

fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map(|(name, arg)| (name, arg.trim()))
        .unwrap_or((rest, ""));
    let index = |arg: &str| arg.parse::<usize>().ok().filter(|n| *n > 0);

    match (name, arg) {
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        ("new", _) => Command::New,
        ("list", _) => Command::List,
        ("profiles", _) => Command::Profiles,
        ("test", _) => Command::Test,
        ("models", _) => Command::Models,
        ("search", query) => Command::Search(query.to_string()),
        ("open", n) => index(n).map_or_else(|| Command::Invalid(line.to_string()), Command::Open),
        ("use", n) => index(n).map_or_else(|| Command::Invalid(line.to_string()), Command::Use),
        ("default", n) => {
            index(n).map_or_else(|| Command::Invalid(line.to_string()), Command::Default)
        }
        ("export", args) if !args.is_empty() => {
            let with_keys = args.split_whitespace().any(|a| a == "--with-keys");
            let path = args
                .split_whitespace()
                .find(|a| *a != "--with-keys")
                .map(PathBuf::from);
            match path {
                Some(path) => Command::Export { path, with_keys },
                None => Command::Invalid(line.to_string()),
            }
        }
        ("import", path) if !path.is_empty() => Command::Import(PathBuf::from(path)),
        _ => Command::Invalid(line.to_string()),
    }
}

pub struct Session {
    storage: SqliteStorage,
    registry: ProfileRegistry,
    gateway: Arc<Gateway>,
    i18n: I18n,
    page_size: u32,
    conversation: Option<Conversation>,
    listing: Vec<Conversation>,
}

impl Session {
    pub fn new(
        storage: SqliteStorage,
        registry: ProfileRegistry,
        gateway: Arc<Gateway>,
        i18n: I18n,
        page_size: u32,
    ) -> Self {
        Self {
            storage,
            registry,
            gateway,
            i18n,
            page_size,
            conversation: None,
            listing: Vec::new(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("{}", self.i18n.t("app.title"));
        self.print_active_profile();
        println!("type /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{}> ", self.i18n.t("chat.prompt"));
            std::io::stdout().flush().context("failed to flush stdout")?;
            let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
                return Ok(());
            };

            let command = parse(&line);
            debug!(?command, "repl command");
            match command {
                Command::Empty => {}
                Command::Quit => return Ok(()),
                command => {
                    if let Err(err) = self.execute(command).await {
                        warn!(error = %format!("{err:#}"), "command failed");
                        println!("error: {err:#}");
                    }
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Empty | Command::Quit => {}
            Command::Help => println!("{HELP}"),
            Command::Invalid(line) => println!("unrecognised command `{line}`, try /help"),
            Command::New => {
                self.conversation = None;
                println!("{}", self.i18n.t("chat.new"));
            }
            Command::List => {
                let page = self.storage.list_conversations(self.page_size, 0).await?;
                self.show_listing(page);
            }
            Command::Search(query) => {
                let found = self.storage.search_conversations(&query).await?;
                self.show_listing(found);
            }
            Command::Open(n) => {
                let Some(summary) = self.listing.get(n - 1) else {
                    println!("no conversation {n} in the last listing");
                    return Ok(());
                };
                match self.storage.get_conversation(summary.id).await? {
                    Some(conversation) => {
                        for message in &conversation.messages {
                            println!("[{}] {}", message.role, message.content);
                        }
                        self.conversation = Some(conversation);
                    }
                    None => println!("conversation no longer exists"),
                }
            }
            Command::Profiles => {
                let snapshot = self.registry.snapshot();
                for (i, profile) in snapshot.profiles.iter().enumerate() {
                    let marker = if snapshot.selected == Some(profile.id) { "*" } else { " " };
                    let default = if profile.is_default { " (default)" } else { "" };
                    println!(
                        "{marker}{:>3}. {}{default}  {}  {}",
                        i + 1,
                        profile.name,
                        profile.model_name,
                        profile.api_endpoint
                    );
                }
            }
            Command::Use(n) => {
                let id = self.profile_at(n)?;
                self.registry.select(id).await?;
                self.print_active_profile();
            }
            Command::Default(n) => {
                let id = self.profile_at(n)?;
                self.registry.set_default(id).await?;
                self.print_active_profile();
            }
            Command::Test => match self.gateway.test_connection().await {
                Ok(report) if report.auth_rejected => {
                    println!("{} ({})", self.i18n.t("profile.auth_rejected"), report.status)
                }
                Ok(report) => println!("{} ({})", self.i18n.t("profile.reachable"), report.status),
                Err(err) => self.print_gateway_error(&err),
            },
            Command::Models => self.refresh_models().await,
            Command::Export { path, with_keys } => {
                let mode = if with_keys {
                    println!("warning: the export contains API keys in plain text");
                    SecretExport::IncludePlaintext
                } else {
                    SecretExport::Redact
                };
                let blob = self.registry.export_all(mode).await?;
                std::fs::write(&path, blob)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("exported to {}", path.display());
            }
            Command::Import(path) => {
                let blob = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let report = self.registry.import_all(&blob).await?;
                println!(
                    "imported {} profile(s), skipped {}",
                    report.imported, report.skipped
                );
            }
            Command::Say(text) => self.say(text).await?,
        }
        Ok(())
    }

    /// Persists the user's message, streams the reply and persists it too.
    async fn say(&mut self, text: String) -> Result<()> {
        let user = Message::user(text);
        let mut conversation = match self.conversation.take() {
            Some(conversation) => conversation,
            None => {
                let title = Conversation::derive_title(std::slice::from_ref(&user));
                let profile_id = self.registry.snapshot().selected;
                self.storage.create_conversation(&title, profile_id).await?
            }
        };
        self.storage.add_message(&user, conversation.id).await?;
        conversation.messages.push(user);
        let id = conversation.id;
        let history = conversation.messages.clone();
        self.conversation = Some(conversation);

        let mut session = match self.gateway.stream_message(&history).await {
            Ok(session) => session,
            Err(err) => {
                self.print_gateway_error(&err);
                return Ok(());
            }
        };

        print!("{}: ", self.i18n.t("chat.assistant"));
        let mut reply = String::new();
        let mut failure = None;
        loop {
            tokio::select! {
                chunk = session.next() => match chunk {
                    Some(Ok(text)) => {
                        print!("{text}");
                        std::io::stdout().flush().context("failed to flush stdout")?;
                        reply.push_str(&text);
                    }
                    Some(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    session.cancel();
                    println!();
                    println!("{}", self.i18n.t("chat.cancelled"));
                    break;
                }
            }
        }
        println!();

        if let Some(err) = failure {
            self.print_gateway_error(&err);
        }
        if !reply.is_empty() {
            let assistant = Message::assistant(reply);
            self.storage.add_message(&assistant, id).await?;
            if let Some(conversation) = self.conversation.as_mut() {
                conversation.messages.push(assistant);
            }
        }
        Ok(())
    }

    pub async fn refresh_models(&mut self) {
        let endpoint = self
            .registry
            .selected()
            .filter(|profile| profile.route().provider == ProviderKind::Ollama)
            .map(|profile| profile.api_endpoint)
            .unwrap_or_else(|| DEFAULT_OLLAMA_ENDPOINT.to_string());
        match self.gateway.enable_ollama_models(&endpoint).await {
            Ok(models) => {
                println!("ollama models at {endpoint}:");
                for model in models {
                    println!("  {model}");
                }
            }
            Err(err) => self.print_gateway_error(&err),
        }
    }

    fn profile_at(&self, n: usize) -> Result<core_types::ProfileId> {
        self.registry
            .profiles()
            .get(n - 1)
            .map(|profile| profile.id)
            .with_context(|| format!("no profile {n}"))
    }

    fn show_listing(&mut self, conversations: Vec<Conversation>) {
        if conversations.is_empty() {
            println!("no conversations");
        }
        for (i, conversation) in conversations.iter().enumerate() {
            println!(
                "{:>3}. {}  ({})",
                i + 1,
                conversation.title,
                conversation.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
        self.listing = conversations;
    }

    fn print_active_profile(&self) {
        if let Some(profile) = self.registry.selected() {
            println!(
                "{}: {} ({})",
                self.i18n.t("profile.active"),
                profile.name,
                profile.model_name
            );
        }
    }

    fn print_gateway_error(&self, err: &GatewayError) {
        warn!(code = err.code(), error = %err, "gateway call failed");
        println!(
            "{} - {}",
            self.i18n.error_hint(err),
            self.i18n.retry_hint(err)
        );
    }
}
