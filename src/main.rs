use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use research_agent::agent::{Agent, TurnReport};
use research_agent::config::Config;
use research_agent::llm::{ContentRouter, GenerateRequest, ModelSelector, ProviderId};
use research_agent::provider_config::{
    ProviderConfigStore, ProviderOverrides, default_config_path, mask_key,
};
use research_agent::tools::builtin::{ToolContext, default_tools};
use research_agent::tools::cache::ToolCache;
use research_agent::tools::{ToolDispatcher, ToolRegistry};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "research",
    about = "Research agent with multi-provider model routing and tool dispatch"
)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true, default_value = "research.toml")]
    config: PathBuf,

    /// Provider for this session (openai, anthropic, gemini, openrouter, deepseek, ollama)
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model for this session; defaults to the provider's configured model
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List providers with their credential and model
    Providers,

    /// List models offered by one or every configured provider
    Models {
        #[arg(long)]
        provider: Option<String>,
    },

    /// Manage stored API keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Set the default provider
    Default { provider: String },

    /// List registered tools
    Tools,

    /// Run one tool directly and print its result envelope
    Tool {
        name: String,
        /// JSON arguments object
        #[arg(default_value = "{}")]
        arguments: String,
    },

    /// Ask a single question
    Ask {
        prompt: String,
        /// Stream the reply without tool use
        #[arg(long)]
        stream: bool,
    },

    /// Interactive session (the default)
    Chat,
}

#[derive(clap::Subcommand)]
enum KeyAction {
    Get { provider: String },
    Set { provider: String, key: String },
    List,
    Remove { provider: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("research_agent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)?;
    config.validate()?;
    let mut store = open_store(&config);

    match cli.command.unwrap_or(Command::Chat) {
        Command::Providers => print_providers(&store),
        Command::Models { provider } => {
            let router = ContentRouter::from_store(&store, false)?;
            let provider = provider.as_deref().map(str::parse::<ProviderId>).transpose()?;
            let interrupt = Interrupt::install();
            let models = ModelSelector::new()
                .list_models(&router, provider, &interrupt.token)
                .await?;
            if models.is_empty() {
                println!("No models found");
            }
            for m in models {
                let ctx = m
                    .context_length
                    .map(|n| format!("  ({n} tokens)"))
                    .unwrap_or_default();
                println!("{:<11} {}{ctx}", m.provider.as_str(), m.id);
            }
            Ok(())
        }
        Command::Key { action } => key_command(&mut store, action),
        Command::Default { provider } => {
            let provider: ProviderId = provider.parse()?;
            store.set_default_provider(Some(provider))?;
            store.save()?;
            println!("Default provider set to {}", provider.display_name());
            Ok(())
        }
        Command::Tools => {
            let registry = build_registry(&config)?;
            for def in registry.definitions() {
                println!("{:<13} [{}] {}", def.name, def.category, def.description);
            }
            Ok(())
        }
        Command::Tool { name, arguments } => {
            let registry = build_registry(&config)?;
            let params: serde_json::Value =
                serde_json::from_str(&arguments).context("tool arguments must be a JSON object")?;
            let interrupt = Interrupt::install();
            let result = registry.execute_tool(&name, params, &interrupt.token).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Ask { prompt, stream } => {
            let mut agent = build_agent(&config, &store)?;
            apply_cli_selection(&mut agent, &store, cli.provider, cli.model).await?;
            let interrupt = Interrupt::install();
            if stream {
                stream_reply(&agent, &prompt, &interrupt.token).await
            } else {
                let report = agent.run_turn(&prompt, &interrupt.token).await?;
                print_report(&report);
                Ok(())
            }
        }
        Command::Chat => {
            let mut agent = build_agent(&config, &store)?;
            apply_cli_selection(&mut agent, &store, cli.provider, cli.model).await?;
            chat(agent, &store).await
        }
    }
}

fn open_store(config: &Config) -> ProviderConfigStore {
    match config.provider_config_path.clone().or_else(default_config_path) {
        Some(path) => ProviderConfigStore::new(path),
        None => {
            warn!("no home directory; provider configuration will not be persisted");
            ProviderConfigStore::in_memory()
        }
    }
}

fn build_registry(config: &Config) -> Result<Arc<ToolRegistry>> {
    let workspace = match &config.tools.workspace {
        Some(ws) => ws.clone(),
        None => std::env::current_dir()?,
    };
    let cache = Arc::new(ToolCache::new(config.cache.capacity, config.cache.ttl()));
    let ctx = ToolContext::new(workspace, cache)?
        .with_batch_concurrency(config.tools.batch_concurrency);
    let registry = ToolRegistry::new().with_timeout(config.tools.timeout());
    registry.initialize(default_tools(&ctx))?;
    Ok(Arc::new(registry))
}

fn build_agent(config: &Config, store: &ProviderConfigStore) -> Result<Agent> {
    let router = Arc::new(ContentRouter::from_store(store, config.router.allow_fallback)?);
    let dispatcher = ToolDispatcher::new(build_registry(config)?);
    Ok(Agent::new(router, dispatcher, config.agent.clone()))
}

async fn apply_cli_selection(
    agent: &mut Agent,
    store: &ProviderConfigStore,
    provider: Option<String>,
    model: Option<String>,
) -> Result<()> {
    if provider.is_none() && model.is_none() {
        return Ok(());
    }
    let provider = match provider {
        Some(p) => p.parse::<ProviderId>()?,
        None => agent.router().default_provider(),
    };
    let model = match model {
        Some(m) => m,
        None => store.get_provider_config(provider, &ProviderOverrides::default())?.model,
    };
    select(agent, provider, &model).await
}

async fn select(agent: &mut Agent, provider: ProviderId, model: &str) -> Result<()> {
    let interrupt = Interrupt::install();
    let selection = agent.select_model(provider, model, &interrupt.token).await?;
    println!("Using {selection}");
    Ok(())
}

/// Cancels `token` on Ctrl-C until dropped.
struct Interrupt {
    token: CancellationToken,
    watcher: JoinHandle<()>,
}

impl Interrupt {
    fn install() -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                child.cancel();
            }
        });
        Self { token, watcher }
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn print_providers(store: &ProviderConfigStore) -> Result<()> {
    let configured = store.list_configured_providers()?;
    let default = store.resolve_default_provider()?;
    for p in ProviderId::ALL {
        let cfg = store.get_provider_config(p, &ProviderOverrides::default())?;
        let key = match &cfg.api_key {
            Some(k) => mask_key(k),
            None if !p.requires_api_key() => "(not required)".into(),
            None => format!("(set {})", p.api_key_env()),
        };
        let marker = if Some(p) == default { "*" } else { " " };
        let status = if configured.contains(&p) { "configured" } else { "-" };
        println!("{marker} {:<11} {:<11} {:<24} {key}", p.as_str(), status, cfg.model);
    }
    Ok(())
}

fn key_command(store: &mut ProviderConfigStore, action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Get { provider } => {
            let provider: ProviderId = provider.parse()?;
            let cfg = store.get_provider_config(provider, &ProviderOverrides::default())?;
            match cfg.api_key {
                Some(k) => println!("{}: {}", provider.as_str(), mask_key(&k)),
                None => println!("{}: no key (set {})", provider.as_str(), provider.api_key_env()),
            }
        }
        KeyAction::Set { provider, key } => {
            let provider: ProviderId = provider.parse()?;
            store.set_api_key(provider, key)?;
            store.save()?;
            println!("Stored key for {}", provider.display_name());
        }
        KeyAction::List => {
            for p in ProviderId::ALL {
                let stored = store
                    .provider_entry(p)?
                    .and_then(|e| e.api_key)
                    .filter(|k| !k.is_empty());
                let from_env = store.env_api_key(p).is_some();
                let source = match (&stored, from_env) {
                    (Some(k), _) => format!("file {}", mask_key(k)),
                    (None, true) => format!("env {}", p.api_key_env()),
                    (None, false) => "-".into(),
                };
                println!("{:<11} {source}", p.as_str());
            }
        }
        KeyAction::Remove { provider } => {
            let provider: ProviderId = provider.parse()?;
            if store.remove_api_key(provider)? {
                store.save()?;
                println!("Removed stored key for {}", provider.display_name());
            } else {
                println!("No stored key for {}", provider.display_name());
            }
        }
    }
    Ok(())
}

async fn stream_reply(agent: &Agent, prompt: &str, cancel: &CancellationToken) -> Result<()> {
    let request = GenerateRequest::from_prompt(prompt).with_system(agent.system_prompt());
    let routed = agent
        .router()
        .generate_stream(agent.selection(), &request, cancel)
        .await?;
    if routed.fallback {
        eprintln!("(served by fallback provider {})", routed.provider);
    }
    let mut stream = routed.value;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        write!(stdout, "{}", chunk.delta)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn print_report(report: &TurnReport) {
    println!("{}", report.text);
    let mut notes = Vec::new();
    if report.tool_calls > 0 {
        notes.push(format!(
            "{} tool call(s), {} failed",
            report.tool_calls, report.tool_errors
        ));
    }
    if report.used_fallback() {
        let via: Vec<&str> = report.fallbacks.iter().map(|p| p.as_str()).collect();
        notes.push(format!("fallback via {}", via.join(", ")));
    }
    if report.hit_turn_limit {
        notes.push("stopped at the turn limit".into());
    }
    if !notes.is_empty() {
        eprintln!("[{}]", notes.join("; "));
    }
}

const CHAT_HELP: &str = "Commands: /providers  /model  /models [provider]  /select <provider> <model>  /tools  /clear  /quit";

async fn chat(mut agent: Agent, store: &ProviderConfigStore) -> Result<()> {
    println!("Research agent. {CHAT_HELP}");
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

        if let Some(command) = line.strip_prefix('/') {
            match slash_command(&mut agent, store, command).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => eprintln!("error: {e:#}"),
            }
            continue;
        }

        let interrupt = Interrupt::install();
        match agent.run_turn(line, &interrupt.token).await {
            Ok(report) => print_report(&report),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

/// Returns `true` when the session should end.
async fn slash_command(
    agent: &mut Agent,
    store: &ProviderConfigStore,
    command: &str,
) -> Result<bool> {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "quit" | "exit" => return Ok(true),
        "providers" => {
            let default = agent.router().default_provider();
            for p in agent.router().providers() {
                let marker = if p == default { " (default)" } else { "" };
                println!("{}{marker}", p.display_name());
            }
        }
        "model" => match agent.selection() {
            Some(s) => println!("{s}"),
            None => {
                let p = agent.router().default_provider();
                let model = store.get_provider_config(p, &ProviderOverrides::default())?.model;
                println!("{p}/{model} (default)");
            }
        },
        "models" => {
            let provider = parts.next().map(str::parse::<ProviderId>).transpose()?;
            let interrupt = Interrupt::install();
            let models = agent
                .selector()
                .list_models(agent.router(), provider, &interrupt.token)
                .await?;
            for m in models {
                println!("{}/{}", m.provider, m.id);
            }
        }
        "select" => {
            let (Some(provider), Some(model)) = (parts.next(), parts.next()) else {
                bail!("usage: /select <provider> <model>");
            };
            select(agent, provider.parse()?, model).await?;
        }
        "tools" => {
            for def in agent.dispatcher().registry().definitions() {
                println!("{:<13} {}", def.name, def.description);
            }
        }
        "clear" => {
            agent.clear_history();
            println!("Conversation cleared");
        }
        "help" => println!("{CHAT_HELP}"),
        other => bail!("unknown command '/{other}'. {CHAT_HELP}"),
    }
    Ok(false)
}
