use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use nix_core_sdk::{
    credentials::CredentialState,
    db::{KvStore, SqliteStore},
    extract::Explanation,
    history::HistoryStore,
    llm::Gateway,
    prompts, server, session,
    session::ExplainSession,
    telemetry,
};

/**
 * \brief CLI 程序入口：粘贴文本、选择复杂度、获取解释。
 */
#[derive(Parser, Debug)]
#[command(name = "nix-explain", version, about = "Explain anything at the level you need")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 列出支持的 Provider。
     */
    Providers,

    /**
     * \brief 切换当前 Provider。
     */
    Select { id: String },

    /**
     * \brief 管理个人 API Key。
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 查看当前生效的 Provider 与密钥来源。
     */
    Status,

    /**
     * \brief 解释一段文本；不给文本时从标准输入读取。
     */
    Explain {
        #[arg(long, short, default_value_t = prompts::DEFAULT_LEVEL)]
        level: u8,
        text: Vec<String>,
    },

    /**
     * \brief 为文本生成闪卡，缺省使用最近一次解释。
     */
    Flashcards { text: Vec<String> },

    /**
     * \brief 为主题生成学习路径，缺省使用最近一次解释。
     */
    Path {
        /** \brief 生成后接着解释第 N 步（从 1 开始） */
        #[arg(long, value_name = "STEP")]
        explain: Option<usize>,
        topic: Vec<String>,
    },

    /**
     * \brief 查看或管理历史记录。
     */
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /**
     * \brief 开关本地遥测日志。
     */
    Telemetry {
        #[arg(value_enum)]
        state: Toggle,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Set {
        key: String,
        /** \brief 同时切换到该 Provider */
        #[arg(long)]
        provider: Option<String>,
    },
    Clear,
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    Delete { id: i64 },
    Clear,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

fn joined_or_stdin(words: Vec<String>) -> Result<String> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read stdin failed")?;
    Ok(buf)
}

fn text_or_latest(words: Vec<String>, history: &HistoryStore) -> Result<String> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let latest = history.latest().context("load history failed")?;
    match latest {
        Some(entry) => Ok(entry.response),
        None => bail!("nothing to work from: pass some text or run `nix-explain explain` first"),
    }
}

fn print_status(gateway: &Gateway, creds: &CredentialState) {
    println!("Selected provider: {}", creds.selected_provider());
    match creds.masked_credential() {
        Some(masked) => println!("Personal key: {}", masked),
        None => println!("Personal key: (none)"),
    }
    match gateway.resolve_credential(creds) {
        Ok(resolved) if gateway.is_using_fallback(creds) => println!(
            "Requests go to: {} (built-in key, only valid for this provider)",
            resolved.provider_id
        ),
        Ok(resolved) => println!("Requests go to: {}", resolved.provider_id),
        Err(e) => println!("Requests go to: nowhere ({})", e),
    }
}

fn print_explanation(explanation: &Explanation) {
    println!("{}", explanation.body);
    if !explanation.follow_ups.is_empty() {
        println!();
        println!("Want to learn more?");
        for (i, q) in explanation.follow_ups.iter().enumerate() {
            println!("  {}. {}", i + 1, q);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store: Arc<dyn KvStore> =
        Arc::new(SqliteStore::open_default().context("open database failed")?);
    telemetry::init_from_store(store.as_ref());
    let gateway = Gateway::from_env().context("create gateway failed")?;
    let history = HistoryStore::new(store.clone());

    match cli.command {
        Commands::Providers => {
            let creds = CredentialState::load(store.as_ref(), gateway.registry())?;
            for p in gateway.registry().iter() {
                let marker = if p.id == creds.selected_provider() { "*" } else { " " };
                println!(
                    "{} {:<8} {:<14} model={} key prefix={} get a key: {}",
                    marker, p.id, p.display_name, p.default_model, p.credential_prefix_hint, p.signup_url
                );
            }
        }
        Commands::Select { id } => {
            let mut creds = CredentialState::load(store.as_ref(), gateway.registry())?;
            creds.select_provider(store.as_ref(), gateway.registry(), &id)?;
            println!("Selected provider: {}", id);
            if creds.user_credential().is_none() && gateway.fallback().is_configured() {
                println!(
                    "No personal key set: requests keep using the built-in {} key.",
                    gateway.fallback().provider_id()
                );
            }
        }
        Commands::Key { action } => {
            let mut creds = CredentialState::load(store.as_ref(), gateway.registry())?;
            match action {
                KeyAction::Set { key, provider } => {
                    if let Some(id) = provider {
                        creds.select_provider(store.as_ref(), gateway.registry(), &id)?;
                    }
                    creds
                        .save_user_credential(store.as_ref(), &key)
                        .context("save key failed")?;
                    if let Some(p) = gateway.registry().get(creds.selected_provider()) {
                        if !p.key_looks_valid(&key) {
                            eprintln!(
                                "warning: {} keys usually start with \"{}\"",
                                p.display_name, p.credential_prefix_hint
                            );
                        }
                    }
                    println!("Saved key for {}", creds.selected_provider());
                }
                KeyAction::Clear => {
                    creds
                        .clear_user_credential(store.as_ref())
                        .context("clear key failed")?;
                    println!("Personal key removed");
                }
            }
        }
        Commands::Status => {
            let creds = CredentialState::load(store.as_ref(), gateway.registry())?;
            print_status(&gateway, &creds);
        }
        Commands::Explain { level, text } => {
            let text = joined_or_stdin(text)?;
            let mut explainer = ExplainSession::new(gateway, store.clone())?;
            let explanation = explainer.explain(&text, level).await?;
            print_explanation(explanation);
        }
        Commands::Flashcards { text } => {
            let body = text_or_latest(text, &history)?;
            let creds = CredentialState::load(store.as_ref(), gateway.registry())?;
            let cards = session::run_flashcards(&gateway, &creds, &body).await?;
            for (i, card) in cards.iter().enumerate() {
                println!("{}. Q: {}", i + 1, card.q);
                println!("   A: {}", card.a);
            }
        }
        Commands::Path { explain, topic } => {
            let topic = text_or_latest(topic, &history)?;
            let mut explainer = ExplainSession::new(gateway, store.clone())?;
            for (i, step) in explainer.generate_learning_path(&topic).await?.iter().enumerate() {
                println!("{}. {}", i + 1, step.title);
                println!("   {}", step.description);
            }
            if let Some(step) = explain {
                if step == 0 {
                    bail!("steps are numbered from 1");
                }
                let explanation = explainer.explain_step(step - 1).await?;
                println!();
                print_explanation(explanation);
            }
        }
        Commands::History { action, limit } => match action {
            None => {
                for entry in history.recent(limit)? {
                    let label = prompts::level(entry.level)
                        .map(|l| l.label)
                        .unwrap_or("?");
                    let query: String = entry.query.chars().take(60).collect();
                    println!("{} [{}] {} {}", entry.id, label, entry.timestamp, query);
                }
            }
            Some(HistoryAction::Delete { id }) => {
                if !history.delete(id)? {
                    bail!("history entry {} not found", id);
                }
                println!("Deleted {}", id);
            }
            Some(HistoryAction::Clear) => {
                history.clear()?;
                println!("History cleared");
            }
        },
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Toggle::On);
            telemetry::persist(store.as_ref(), enabled).context("save telemetry failed")?;
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}
