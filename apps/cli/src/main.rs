use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use codedeck_core_sdk::{
    credentials::{CredentialStore, EnvCredentials},
    db,
    llm::StreamingEngine,
    models::MessageStatus,
    providers::ProviderRegistry,
    server::{self, AppState},
    session::{ChatSession, SessionEvent, Settlement, TurnConfig},
    settings::Settings,
    store::ConversationStore,
    telemetry,
};

/**
 * \brief CLI 程序入口：对话、设置与本地服务。
 */
#[derive(Parser, Debug)]
#[command(name = "codedeck", version, about = "CodeDeck chat core")]
struct Cli {
    /** \brief 数据库文件路径 */
    #[arg(long, global = true, default_value = db::DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 列出内置 Provider。
     */
    Providers,

    /**
     * \brief 列出指定 Provider 的模型。
     */
    Models {
        #[arg(long)]
        provider: Option<String>,
    },

    /**
     * \brief 查看或修改设置。
     */
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /**
     * \brief 发送一条用户消息并流式显示模型回复；Ctrl-C 取消。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /**
     * \brief 打印会话历史。
     */
    History,

    /**
     * \brief 清空会话历史。
     */
    Clear,

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
        /** \brief 工作区根目录 */
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    /**
     * \brief 修改单个设置项，如 `config set model gpt-4o-mini`。
     */
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("warn");
    let cli = Cli::parse();

    let conn = db::open_db(&cli.db).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let mut settings = Settings::load(&conn).context("load settings failed")?;
    telemetry::set_enabled(settings.telemetry_enabled);

    match cli.command {
        Commands::Providers => {
            let registry = ProviderRegistry::builtin();
            for p in registry.all() {
                let marker = if p.id == settings.provider_id { "*" } else { " " };
                println!(
                    "{} {:<12} {:<18} {}",
                    marker,
                    p.id,
                    p.name,
                    p.default_model.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Models { provider } => {
            let provider_id = provider.unwrap_or_else(|| settings.provider_id.clone());
            let engine = StreamingEngine::new(ProviderRegistry::builtin());
            engine
                .registry()
                .resolve(&provider_id)
                .context("unknown provider")?;
            let key = EnvCredentials.api_key(&provider_id);
            let models = engine.list_models(&provider_id, key.as_deref()).await;
            if models.is_empty() {
                eprintln!("no models available for {}", provider_id);
            }
            for m in models {
                println!("{:<40} {}", m.id, m.display_name);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            ConfigAction::Set { key, value } => {
                if key == "provider_id" {
                    ProviderRegistry::builtin()
                        .resolve(&value)
                        .context("unknown provider")?;
                }
                settings.set(&key, &value)?;
                settings.save(&conn).context("save settings failed")?;
                telemetry::log_event("cli.config", &format!("set {}", key));
                println!("{} updated", key);
            }
        },
        Commands::Chat {
            prompt,
            provider,
            model,
            api_key,
            no_stream,
        } => {
            let session = open_session(&cli.db)?;
            let mut config = settings.turn_config();
            if let Some(provider) = provider {
                config.provider_id = provider;
            }
            if model.is_some() {
                config.model = model;
            }
            config.api_key = api_key;
            if no_stream {
                config.params.stream = false;
            }
            run_chat(&session, &prompt, &config).await?;
        }
        Commands::History => {
            let session = open_session(&cli.db)?;
            for m in session.messages() {
                println!("[{}/{}] {}", m.role.as_str(), m.status.as_str(), m.content);
            }
        }
        Commands::Clear => {
            let session = open_session(&cli.db)?;
            session.clear()?;
            println!("history cleared");
        }
        Commands::Serve { addr, root } => {
            let state = AppState::open(&cli.db, &root).context("prepare server state failed")?;
            server::run(&addr, state).await?;
        }
    }

    Ok(())
}

fn open_session(db_path: &Path) -> Result<ChatSession> {
    let store = ConversationStore::with_connection(db::open_db(db_path)?)
        .context("open conversation store failed")?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentials);
    let session = ChatSession::new(
        StreamingEngine::new(ProviderRegistry::builtin()),
        store,
        credentials,
    );
    let count = session.load_history().context("load history failed")?;
    info!(messages = count, "history loaded");
    Ok(session)
}

async fn run_chat(
    session: &ChatSession,
    prompt: &str,
    config: &TurnConfig,
) -> Result<()> {
    let mut events = session.subscribe();
    let mut printed = 0usize;
    let mut print_delta = |event: SessionEvent| {
        if let SessionEvent::MessageUpdated {
            content,
            status: MessageStatus::Streaming,
            ..
        } = event
        {
            if let Some(delta) = content.get(printed..) {
                print!("{}", delta);
                std::io::stdout().flush().ok();
            }
            printed = content.len();
        }
    };

    let turn = session.send(prompt, config);
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            _ = tokio::signal::ctrl_c() => {
                if session.cancel() {
                    eprintln!("\n[cancelling]");
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    print_delta(event);
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_delta(event);
    }
    println!();

    let outcome = result.context("chat request rejected")?;
    match outcome.settlement {
        Settlement::Complete => Ok(()),
        Settlement::Cancelled => {
            eprintln!("[cancelled]");
            Ok(())
        }
        Settlement::Failed => bail!(
            "chat failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}
