use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use exam_session::app_dirs::AppDirs;
use exam_session::config::{Config, ConfigStore, FileConfigStore};
use exam_session::store::AttemptStore;
use exam_session::util::format_hms;
use exam_session::{
    Answer, ExamId, HttpExamService, SessionCoordinator, SessionError, SessionStatus, SqliteStore,
    SubmitReason, SubmitReceipt, SystemClock,
};
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Countdown marks at which a reminder is printed.
const REMINDERS_SECS: [u64; 2] = [300, 60];

/// take timed exams from the terminal, resumable across restarts
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Take a timed exam from the terminal. Answers are saved locally as you go and synced to the exam server in the background; quitting or crashing leaves the attempt resumable with the original deadline."
)]
pub struct Cli {
    /// sqlite file holding attempt state (default: ~/.local/state/exam-session/sessions.db)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// base URL of the exam server, overrides the config file
    #[clap(long, global = true)]
    api_url: Option<String>,

    /// bearer token sent with every request, overrides the config file
    #[clap(long, global = true)]
    token: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// start or resume an exam and answer questions interactively
    Take { exam_id: String },
    /// show what is saved locally for an exam
    Status { exam_id: String },
    /// resume a saved attempt and submit it right away
    Submit { exam_id: String },
    /// forget the locally saved attempt
    Discard { exam_id: String },
    /// show the config file location and the settings in effect
    Config {
        /// write the settings in effect (including --api-url/--token) to the config file
        #[clap(long)]
        init: bool,
    },
}

impl Cli {
    /// Command-line flags take precedence over the config file.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(token) = &self.token {
            config.auth_token = Some(token.clone());
        }
    }
}

/// One line typed during `take`.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    Show,
    Answer { question_id: String, value: String },
    Flag(String),
    Time,
    Submit,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let input = match words.next() {
        Some("show") => Input::Show,
        Some("answer") => {
            let question_id = words.next().ok_or("usage: answer <question-id> <value>")?;
            let value = words.join(" ");
            if value.is_empty() {
                return Err("usage: answer <question-id> <value>".to_string());
            }
            Input::Answer {
                question_id: question_id.to_string(),
                value,
            }
        }
        Some("flag") => Input::Flag(words.next().ok_or("usage: flag <question-id>")?.to_string()),
        Some("time") => Input::Time,
        Some("submit") => Input::Submit,
        Some("quit") | Some("exit") => Input::Quit,
        Some("help") | None => Input::Help,
        Some(other) => return Err(format!("unknown command `{other}`, try `help`")),
    };
    Ok(input)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn coordinator_for(config: &Config, store: AttemptStore, exam_id: ExamId) -> SessionCoordinator {
    let mut service = HttpExamService::new(config.api_base_url.clone());
    if let Some(token) = &config.auth_token {
        service = service.with_token(token.clone());
    }
    SessionCoordinator::new(
        exam_id,
        Arc::new(service),
        store,
        Arc::new(SystemClock),
        config.session_settings(),
    )
}

fn print_config(store: &FileConfigStore, config: &Config, init: bool) -> std::io::Result<()> {
    if init {
        store.save(config)?;
        println!("wrote {}", store.path().display());
    } else {
        println!("config file: {}", store.path().display());
    }
    println!("api_base_url:        {}", config.api_base_url);
    println!(
        "auth_token:          {}",
        if config.auth_token.is_some() { "set" } else { "not set" }
    );
    println!("tick_interval_ms:    {}", config.tick_interval_ms);
    println!("flush_interval_secs: {}", config.flush_interval_secs);
    println!("log_filter:          {}", config.log_filter);
    Ok(())
}

fn print_status(store: &AttemptStore, exam_id: &ExamId) -> Result<(), Box<dyn Error>> {
    let attempt = store.load(exam_id)?;
    if attempt.is_empty() {
        println!("no saved attempt for {exam_id}");
        return Ok(());
    }
    println!("exam:      {exam_id}");
    if let Some(session_id) = &attempt.session_id {
        println!("session:   {session_id}");
    }
    if let Some(started) = attempt
        .started_at_ms
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
    {
        println!("started:   {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("answered:  {}", attempt.answers.len());
    let flagged = attempt
        .flags
        .iter()
        .filter(|(_, on)| **on)
        .map(|(q, _)| q)
        .join(", ");
    if !flagged.is_empty() {
        println!("flagged:   {flagged}");
    }
    Ok(())
}

fn print_questions(coordinator: &SessionCoordinator) {
    let Some(definition) = coordinator.definition() else {
        return;
    };
    let answers = coordinator.answers();
    let flags = coordinator.flags();
    println!("{} ({} questions)", definition.title, definition.questions.len());
    for (n, question) in definition.questions.iter().enumerate() {
        let answered = if answers.contains_key(&question.id) { "x" } else { " " };
        let flag = if flags.get(&question.id).copied().unwrap_or(false) {
            " [flagged]"
        } else {
            ""
        };
        println!(
            "[{answered}] {}. {} ({}){flag}: {}",
            n + 1,
            question.id,
            question.kind,
            question.prompt
        );
        let choices = question.choices();
        if !choices.is_empty() {
            println!("      options: {}", choices.iter().join(" | "));
        }
        if let Some(answer) = answers.get(&question.id) {
            println!("      answer:  {}", answer.as_str());
        }
    }
}

fn print_time(coordinator: &SessionCoordinator) {
    let remaining = coordinator.remaining_secs().unwrap_or(0);
    match coordinator.progress() {
        Some(p) => println!(
            "{} left, {}/{} answered, {} flagged",
            format_hms(remaining),
            p.answered,
            p.total,
            p.flagged
        ),
        None => println!("{} left", format_hms(remaining)),
    }
}

fn print_receipt(receipt: &SubmitReceipt) {
    println!("exam submitted");
    if let (Some(score), Some(total)) = (receipt.score, receipt.total) {
        println!("score: {score}/{total}");
    } else if let Some(score) = receipt.score {
        println!("score: {score}");
    }
    if let Some(passed) = receipt.passed {
        println!("{}", if passed { "passed" } else { "not passed" });
    }
    if let Some(message) = &receipt.message {
        println!("{message}");
    }
}

fn report(outcome: Result<SubmitReceipt, SessionError>) -> Result<(), Box<dyn Error>> {
    let receipt = outcome?;
    print_receipt(&receipt);
    Ok(())
}

/// Apply one command. Returns `false` once the loop should end.
async fn handle_input(coordinator: &SessionCoordinator, input: Input) -> Result<bool, Box<dyn Error>> {
    match input {
        Input::Show => print_questions(coordinator),
        Input::Answer { question_id, value } => {
            let kind = coordinator
                .definition()
                .and_then(|d| d.question(&question_id).map(|q| q.kind));
            let answer = match kind {
                Some(kind) => Answer::for_kind(kind, value),
                None => Answer::Text(value),
            };
            match coordinator.set_answer(&question_id, answer) {
                Ok(()) => println!("saved"),
                Err(e) => eprintln!("{e}"),
            }
        }
        Input::Flag(question_id) => match coordinator.toggle_flag(&question_id) {
            Ok(true) => println!("{question_id} flagged for review"),
            Ok(false) => println!("{question_id} unflagged"),
            Err(e) => eprintln!("{e}"),
        },
        Input::Time => print_time(coordinator),
        Input::Submit => {
            report(coordinator.submit(SubmitReason::UserRequested).await)?;
            return Ok(false);
        }
        Input::Quit => {
            coordinator.teardown();
            if let Err(e) = coordinator.flush_now().await {
                eprintln!("{e}");
            }
            println!("progress saved, resume with `exam-session take {}`", coordinator.exam_id());
            return Ok(false);
        }
        Input::Help => println!(
            "commands: show | answer <id> <value> | flag <id> | time | submit | quit"
        ),
    }
    Ok(true)
}

async fn take(coordinator: SessionCoordinator) -> Result<(), Box<dyn Error>> {
    coordinator.begin().await?;
    print_questions(&coordinator);
    print_time(&coordinator);

    let mut status = coordinator.subscribe_status();
    let mut countdown = coordinator.subscribe_countdown();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                if current != SessionStatus::Active {
                    println!("time is up, submitting");
                    if let Some(outcome) = coordinator.outcome().await {
                        report(outcome)?;
                    }
                    break;
                }
            }
            Ok(()) = countdown.changed() => {
                let remaining = *countdown.borrow_and_update();
                if let Some(secs) = remaining.filter(|s| REMINDERS_SECS.contains(s)) {
                    println!("{} remaining", format_hms(secs));
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed
                    handle_input(&coordinator, Input::Quit).await?;
                    break;
                };
                match parse_input(&line) {
                    Ok(input) => {
                        if !handle_input(&coordinator, input).await? {
                            break;
                        }
                    }
                    Err(message) => eprintln!("{message}"),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_store = FileConfigStore::new();
    let mut config = config_store.load();
    cli.apply_overrides(&mut config);
    init_tracing(&config.log_filter);

    if let Command::Config { init } = cli.command {
        print_config(&config_store, &config, init)?;
        return Ok(());
    }

    let db_path = cli
        .db
        .clone()
        .or_else(AppDirs::db_path)
        .ok_or("no state directory available, pass --db")?;
    let store = AttemptStore::new(Arc::new(SqliteStore::open(&db_path)?));

    match &cli.command {
        Command::Status { exam_id } => print_status(&store, &ExamId::parse(exam_id)?)?,
        Command::Discard { exam_id } => {
            let exam_id = ExamId::parse(exam_id)?;
            store.erase(&exam_id)?;
            println!("discarded saved attempt for {exam_id}");
        }
        Command::Take { exam_id } => {
            let exam_id = ExamId::parse(exam_id)?;
            take(coordinator_for(&config, store, exam_id)).await?;
        }
        Command::Submit { exam_id } => {
            let exam_id = ExamId::parse(exam_id)?;
            if store.load(&exam_id)?.is_empty() {
                return Err(format!("no saved attempt for {exam_id}").into());
            }
            let coordinator = coordinator_for(&config, store, exam_id);
            coordinator.begin().await?;
            report(coordinator.submit(SubmitReason::Recovered).await)?;
        }
        Command::Config { .. } => {}
    }
    Ok(())
}
