use std::error::Error;
#[cfg(feature = "web")]
use std::net::SocketAddr;
use std::path::PathBuf;
#[cfg(feature = "web")]
use std::sync::Arc;
use std::time::Duration;

use atty::Stream;
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wordsprout::{
    DEFAULT_LOG_FILTER, Journal, RenderedEntry, Segment, SessionData, SessionSummary, Settings,
    llm, tokenize, tokenizer,
};

#[derive(Parser, Debug)]
#[command(
    name = "wordsprout",
    about = "A journaling buddy that suggests richer words",
    version
)]
pub struct Cli {
    /// Emit JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    /// API key for the Gemini text generation service.
    #[arg(long, env = "GEMINI_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,
    /// Model used for synonyms and buddy replies.
    #[arg(long, env = "WORDSPROUT_MODEL", global = true, default_value = llm::DEFAULT_MODEL)]
    model: String,
    /// Base URL of the generation API.
    #[arg(
        long,
        env = "WORDSPROUT_LLM_ENDPOINT",
        global = true,
        default_value = llm::DEFAULT_ENDPOINT
    )]
    llm_endpoint: String,
    /// Seconds before a generation request is abandoned.
    #[arg(long, env = "WORDSPROUT_LLM_TIMEOUT_SECS", global = true, default_value_t = 60)]
    llm_timeout_secs: u64,
    /// Directory holding one JSON file per saved session. Sessions stay in
    /// memory when unset.
    #[arg(long, env = "WORDSPROUT_SESSION_DIR", global = true)]
    session_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the journal web app.
    #[cfg(feature = "web")]
    Serve {
        /// Socket address to bind.
        #[arg(long, env = "WORDSPROUT_ADDR", default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Public URL used for canonical links.
        #[arg(long, env = "WORDSPROUT_BASE_URL")]
        base_url: Option<String>,
    },
    /// Split text into sentences, words and whitespace.
    Tokenize {
        /// Text to split.
        text: String,
    },
    /// Ask for richer synonyms of the words in a sentence.
    Synonyms {
        /// Sentence to look up.
        sentence: String,
    },
    /// Add a journal entry and print the buddy's reply.
    Write {
        /// Entry text.
        text: String,
        /// Continue a saved session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,
        /// Name for a new session.
        #[arg(long)]
        name: Option<String>,
    },
    /// Manage saved sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
}

#[derive(Subcommand, Debug)]
enum SessionsCommand {
    /// List saved sessions, newest first.
    List,
    /// Show one saved session.
    Show {
        /// Session ID.
        id: String,
    },
    /// Delete a saved session.
    Delete {
        /// Session ID.
        id: String,
    },
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        Settings {
            api_key: self.api_key,
            model: self.model,
            llm_endpoint: self.llm_endpoint,
            llm_timeout: Duration::from_secs(self.llm_timeout_secs),
            session_dir: self.session_dir,
            ..Settings::default()
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let settings = cli.settings.into_settings();
    let as_json = cli.json;
    runtime.block_on(async move {
        match cli.command {
            #[cfg(feature = "web")]
            Command::Serve { addr, base_url } => handle_serve(settings, addr, base_url).await,
            Command::Tokenize { text } => handle_tokenize(&text, as_json),
            Command::Synonyms { sentence } => handle_synonyms(settings, &sentence, as_json).await,
            Command::Write {
                text,
                session,
                name,
            } => handle_write(settings, &text, session, name, as_json).await,
            Command::Sessions(SessionsCommand::List) => handle_list(settings, as_json).await,
            Command::Sessions(SessionsCommand::Show { id }) => {
                handle_show(settings, &id, as_json).await
            }
            Command::Sessions(SessionsCommand::Delete { id }) => {
                handle_delete(settings, &id, as_json).await
            }
        }
    })
}

#[cfg(feature = "web")]
async fn handle_serve(
    settings: Settings,
    addr: SocketAddr,
    base_url: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let journal = Arc::new(settings.build_journal()?);
    let config = wordsprout::web::WebConfig {
        addr,
        base_url: base_url.unwrap_or_else(|| format!("http://{addr}")),
    };
    wordsprout::web::serve(config, journal).await?;
    Ok(())
}

fn handle_tokenize(text: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let segments = tokenize(text);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
        return Ok(());
    }
    if segments.is_empty() {
        println!("Nothing to tokenize.");
        return Ok(());
    }
    for (idx, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Sentence { text, tokens } => {
                let words: Vec<_> = tokens
                    .iter()
                    .filter(|token| token.is_word())
                    .map(|token| token.text.as_str())
                    .collect();
                println!("{idx:>3}  sentence   {text:?}");
                println!("     words      {}", words.join(" | "));
            }
            Segment::Delimiter { text } => println!("{idx:>3}  delimiter  {text:?}"),
        }
    }
    Ok(())
}

async fn handle_synonyms(
    settings: Settings,
    sentence: &str,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    if sentence.trim().is_empty() {
        return Err("Sentence cannot be empty".into());
    }
    let journal = settings.build_journal()?;
    let map = journal.service().lookup(sentence).await;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    if map.is_empty() {
        println!("No suggestions for {sentence:?}.");
        return Ok(());
    }
    let width = map
        .keys()
        .map(|word| word.len())
        .max()
        .unwrap_or(4)
        .max("WORD".len());
    println!("{:<width$}  {}", "WORD", "SYNONYMS", width = width);
    println!("{:-<width$}  {}", "", "--------", width = width);
    for (word, synonyms) in &map {
        println!("{:<width$}  {}", word, synonyms.join(", "), width = width);
    }
    Ok(())
}

async fn handle_write(
    settings: Settings,
    text: &str,
    session: Option<String>,
    name: Option<String>,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let journal = settings.build_journal()?;
    match session {
        Some(id) => journal.load_session(&id).await?,
        None => {
            journal
                .new_session(name.as_deref().unwrap_or_default())
                .await?;
        }
    }
    prefetch_synonyms(&journal, text).await;
    let submission = journal.submit_entry(text).await?;
    let rendered = journal.render_entry(&submission.entry.id)?;
    let session_id = journal.save_session().await?;

    if as_json {
        let payload = json!({
            "session": session_id,
            "entry": submission.entry,
            "annotations": rendered,
            "reply": submission.reply,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    render_markdown_block("Your entry", &annotated_markdown(&rendered));
    render_markdown_block("Sprout says", &submission.reply.text);
    println!("\nSaved to session {session_id}.");
    Ok(())
}

/// Fills the cache first so the entry view mounts straight into `Ready`.
async fn prefetch_synonyms(journal: &Journal, text: &str) {
    let segments = tokenize(text);
    let lookups = tokenizer::sentences(&segments)
        .map(|(_, sentence)| journal.service().lookup(sentence));
    join_all(lookups).await;
}

fn annotated_markdown(rendered: &RenderedEntry) -> String {
    let mut out = String::new();
    for token in &rendered.tokens {
        match (&token.synonyms, token.interactive) {
            (Some(synonyms), true) => {
                out.push_str(&format!("**{}** *({})*", token.text, synonyms.join(", ")))
            }
            _ => out.push_str(&token.text),
        }
    }
    out
}

async fn handle_list(settings: Settings, as_json: bool) -> Result<(), Box<dyn Error>> {
    let journal = settings.build_journal()?;
    let sessions = journal.list_sessions().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print_session_table(&sessions);
    }
    Ok(())
}

async fn handle_show(settings: Settings, id: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let journal = settings.build_journal()?;
    let data = journal.read_session(id).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_session(id, &data);
    }
    Ok(())
}

async fn handle_delete(settings: Settings, id: &str, as_json: bool) -> Result<(), Box<dyn Error>> {
    let journal = settings.build_journal()?;
    journal.delete_session(id).await?;
    if as_json {
        println!("{}", json!({ "deleted": id }));
    } else {
        println!("Deleted session {id}.");
    }
    Ok(())
}

fn print_session_table(rows: &[SessionSummary]) {
    if rows.is_empty() {
        println!("No saved sessions.");
        return;
    }
    let width = rows
        .iter()
        .map(|row| row.name.len())
        .max()
        .unwrap_or(4)
        .max("NAME".len());
    println!(
        "{:<24}  {:<width$}  {:>7}  {}",
        "ID",
        "NAME",
        "ENTRIES",
        "UPDATED",
        width = width
    );
    println!(
        "{:-<24}  {:-<width$}  {:->7}  {}",
        "",
        "",
        "",
        "-------",
        width = width
    );
    for row in rows {
        println!(
            "{:<24}  {:<width$}  {:>7}  {}",
            row.id,
            row.name,
            row.entry_count,
            row.updated_at.format("%Y-%m-%d %H:%M"),
            width = width
        );
    }
}

fn print_session(id: &str, data: &SessionData) {
    println!("Session: {} ({id})", data.name);
    println!("Updated: {}", data.updated_at.format("%Y-%m-%d %H:%M"));
    println!("Learned sentences: {}", data.vocabulary_data.len());
    if data.journal_entries.is_empty() {
        println!("\nNo journal entries.");
        return;
    }
    println!("\nJournal:");
    for entry in &data.journal_entries {
        println!("- [{}] {}", entry.created_at.format("%b %-d %H:%M"), entry.text);
    }
    if !data.buddy_entries.is_empty() {
        println!("\nSprout:");
        for entry in &data.buddy_entries {
            println!("- {}", entry.text);
        }
    }
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn markdown_skin() -> MadSkin {
    MadSkin::default()
}

fn render_markdown_block(title: &str, body: &str) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return;
    }
    println!("\n{title}:");
    if stdout_is_tty() {
        let skin = markdown_skin();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
