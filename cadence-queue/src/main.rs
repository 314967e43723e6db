//! cadence-queue - Manage scheduled publishing jobs
//!
//! Unix-style tool for adding jobs to the queue and inspecting it.

use std::io::Read;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libcadence::content::Tone;
use libcadence::logging::LoggingConfig;
use libcadence::scheduling::parse_schedule;
use libcadence::types::QueueStats;
use libcadence::{
    CadenceError, CadenceService, CancelOutcome, Config, ExecutionAttempt, Job, JobState, NewJob,
    RescheduleOutcome, Result,
};

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Manage scheduled publishing jobs")]
#[command(long_about = "\
cadence-queue - Manage scheduled publishing jobs

DESCRIPTION:
    cadence-queue adds jobs to the Cadence queue and lets you inspect,
    cancel and reschedule them. Jobs are executed by cadence-send.

COMMANDS:
    enqueue     Add a job for an account
    list        List jobs
    show        Show one job
    cancel      Cancel a pending job
    reschedule  Move a pending job to a different time
    history     Show execution attempts
    stats       Show queue statistics

USAGE EXAMPLES:
    # Post in two hours
    cadence-queue enqueue 1 \"Launch day!\" --at 2h

    # Read content from stdin
    echo \"Hello\" | cadence-queue enqueue 1 --at \"tomorrow\"

    # Generate the caption at execution time
    cadence-queue enqueue 1 --prompt \"Announce our new release\" --tone casual

    # Space posts 10 to 20 minutes after the account's last scheduled job
    cadence-queue enqueue 1 \"Next in the series\" --at random:10m-20m

    # Attach media
    cadence-queue enqueue 2 \"Trip recap\" --media ~/Pictures/beach.jpg

    # List pending jobs as JSON
    cadence-queue list --state pending --format json

    # Reschedule a job
    cadence-queue reschedule 7 \"next friday\"

SCHEDULE FORMATS:
    now, 30m, 2h, \"1 day\", 2025-11-20T15:00:00Z, tomorrow, random:MIN-MAX

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad job ID, time format, content, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    #[arg(help = "Enable verbose logging to stderr (useful for debugging)")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job to the queue
    Enqueue {
        /// Account ID to publish with
        account_id: i64,

        /// Post text (read from stdin when omitted)
        content: Option<String>,

        /// When to publish (default: now)
        #[arg(long, default_value = "now")]
        at: String,

        /// Media file to attach (repeatable)
        #[arg(short, long = "media")]
        media: Vec<PathBuf>,

        /// Generate the text from this prompt at execution time
        #[arg(long)]
        prompt: Option<String>,

        /// Tone for generated text
        #[arg(long, requires = "prompt")]
        tone: Option<Tone>,

        /// Ask the platform to publish at this time with its own scheduler
        #[arg(long, value_name = "TIME")]
        native_at: Option<String>,
    },

    /// List jobs
    List {
        /// Only jobs in this state
        #[arg(short, long)]
        state: Option<JobState>,

        /// Only jobs for this account
        #[arg(short, long)]
        account: Option<i64>,

        /// Maximum number of jobs
        #[arg(short, long)]
        limit: Option<i64>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one job
    Show {
        job_id: i64,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a pending job
    Cancel {
        /// Job ID to cancel
        job_id: i64,
    },

    /// Reschedule a pending job
    Reschedule {
        /// Job ID to reschedule
        job_id: i64,

        /// New schedule time (e.g., "tomorrow", "2h")
        time: String,
    },

    /// Show execution attempts of a job, or the most recent attempts
    History {
        /// Job ID (omit for recent attempts across all jobs)
        job_id: Option<i64>,

        /// Number of recent attempts to show
        #[arg(short, long, default_value_t = 20)]
        limit: i64,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env("error", cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let service = CadenceService::new(config).await?;

    match cli.command {
        Commands::Enqueue {
            account_id,
            content,
            at,
            media,
            prompt,
            tone,
            native_at,
        } => {
            cmd_enqueue(
                &service,
                account_id,
                content,
                &at,
                media,
                prompt,
                tone,
                native_at.as_deref(),
            )
            .await?;
        }
        Commands::List {
            state,
            account,
            limit,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let jobs = service.list_jobs(state, account, limit).await?;
            match format {
                OutputFormat::Json => println!("{}", to_json(&jobs)?),
                OutputFormat::Text => output_jobs_text(&jobs),
            }
        }
        Commands::Show { job_id, format } => {
            let format = OutputFormat::parse(&format)?;
            let job = service.get_job(job_id).await?;
            match format {
                OutputFormat::Json => println!("{}", to_json(&job)?),
                OutputFormat::Text => output_job_detail(&job),
            }
        }
        Commands::Cancel { job_id } => match service.cancel(job_id).await? {
            CancelOutcome::Cancelled => println!("Cancelled job {}", job_id),
            CancelOutcome::NotCancellable(state) => {
                return Err(CadenceError::InvalidInput(format!(
                    "job {} is {} and cannot be cancelled",
                    job_id, state
                )));
            }
        },
        Commands::Reschedule { job_id, time } => {
            cmd_reschedule(&service, job_id, &time).await?;
        }
        Commands::History {
            job_id,
            limit,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let attempts = match job_id {
                Some(job_id) => service.history(job_id).await?,
                None => service.recent_history(limit).await?,
            };
            match format {
                OutputFormat::Json => println!("{}", to_json(&attempts)?),
                OutputFormat::Text => output_attempts_text(&attempts),
            }
        }
        Commands::Stats { format } => {
            let format = OutputFormat::parse(&format)?;
            let stats = service.stats().await?;
            match format {
                OutputFormat::Json => println!("{}", to_json(&stats)?),
                OutputFormat::Text => output_stats_text(&stats),
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(CadenceError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CadenceError::InvalidInput(format!("cannot encode JSON: {}", e)))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_enqueue(
    service: &CadenceService,
    account_id: i64,
    content: Option<String>,
    at: &str,
    media: Vec<PathBuf>,
    prompt: Option<String>,
    tone: Option<Tone>,
    native_at: Option<&str>,
) -> Result<()> {
    let content = match (content, &prompt) {
        (Some(content), _) => content,
        (None, Some(_)) => String::new(),
        (None, None) => read_stdin_content()?,
    };

    let last_scheduled = service.last_scheduled(account_id).await?;
    let target = parse_schedule(at, last_scheduled)?;

    let media = media
        .iter()
        .map(|path| PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned()))
        .collect();
    let mut job = NewJob::new(account_id, content, target).with_media(media);
    if let Some(prompt) = prompt {
        job = job.with_prompt(prompt, tone.unwrap_or_default());
    }
    if let Some(native_at) = native_at {
        job = job.with_native_schedule(parse_schedule(native_at, None)?);
    }

    let job = service.enqueue(job).await?;
    println!("{}", job.id);
    tracing::info!("job {} scheduled for {}", job.id, job.target_at.to_rfc3339());
    Ok(())
}

fn read_stdin_content() -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        return Err(CadenceError::InvalidInput(
            "No content provided. Pass it as an argument, pipe it on stdin, or use --prompt"
                .to_string(),
        ));
    }
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .map_err(|e| CadenceError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    Ok(buffer.trim_end().to_string())
}

async fn cmd_reschedule(service: &CadenceService, job_id: i64, time: &str) -> Result<()> {
    let job = service.get_job(job_id).await?;
    let last_scheduled = service
        .last_scheduled(job.account_id)
        .await?
        .filter(|_| time.starts_with("random:"));
    let target = parse_schedule(time, last_scheduled)?;

    match service.reschedule(job_id, target).await? {
        RescheduleOutcome::Rescheduled => {
            println!("Rescheduled job {} to {}", job_id, target.to_rfc3339());
            Ok(())
        }
        RescheduleOutcome::NotReschedulable(state) => Err(CadenceError::InvalidInput(format!(
            "job {} is {} and cannot be rescheduled",
            job_id, state
        ))),
    }
}

fn output_jobs_text(jobs: &[Job]) {
    let now = Utc::now();
    for job in jobs {
        let when = match job.state {
            JobState::Pending | JobState::Running => format_time_until(now, job.target_at),
            _ => job.updated_at.to_rfc3339(),
        };
        let flag = if job.needs_attention { " !" } else { "" };
        println!(
            "{} | account {} | {}{} | {} | {}",
            job.id,
            job.account_id,
            job.state,
            flag,
            when,
            truncate_content(job_text(job), 50)
        );
    }
}

fn output_job_detail(job: &Job) {
    println!("Job {}", job.id);
    println!("  account:   {}", job.account_id);
    println!("  state:     {}", job.state);
    println!("  target:    {}", job.target_at.to_rfc3339());
    println!("  attempts:  {}", job.attempt_count);
    if let Some(at) = job.native_schedule_at {
        println!("  native at: {}", at.to_rfc3339());
    }
    if let Some(prompt) = &job.prompt {
        println!("  prompt:    {}", prompt);
        if let Some(tone) = job.tone {
            println!("  tone:      {}", tone);
        }
    }
    for path in &job.media {
        println!("  media:     {}", path.display());
    }
    if let Some(kind) = job.last_error_kind {
        println!(
            "  last error: {} ({})",
            kind,
            job.last_error.as_deref().unwrap_or("no detail")
        );
    }
    if job.needs_attention {
        println!("  needs attention: the platform asked for verification");
    }
    if !job.content.is_empty() {
        println!();
        println!("{}", job.content);
    }
}

fn output_attempts_text(attempts: &[ExecutionAttempt]) {
    for attempt in attempts {
        let seconds = (attempt.ended_at - attempt.started_at).num_milliseconds() as f64 / 1000.0;
        let detail = attempt
            .post_url
            .as_deref()
            .or(attempt.detail.as_deref())
            .unwrap_or("");
        println!(
            "job {} | {} | {} | {:.1}s | {}",
            attempt.job_id,
            attempt.started_at.to_rfc3339(),
            attempt.outcome,
            seconds,
            detail
        );
    }
}

fn output_stats_text(stats: &QueueStats) {
    println!("Pending:         {}", stats.pending);
    println!("Running:         {}", stats.running);
    println!("Completed:       {}", stats.completed);
    println!("Failed:          {}", stats.failed);
    println!("Cancelled:       {}", stats.cancelled);
    println!("Needs attention: {}", stats.needs_attention);
    if let Some(next) = stats.next_due {
        println!(
            "Next due:        {} ({})",
            next.to_rfc3339(),
            format_time_until(Utc::now(), next)
        );
    }
}

fn job_text(job: &Job) -> &str {
    if job.content.is_empty() {
        job.prompt.as_deref().unwrap_or("")
    } else {
        &job.content
    }
}

/// Truncate to `max_chars` characters with an ellipsis, on one line
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// Format time until the target in human-readable form
fn format_time_until(now: DateTime<Utc>, target: DateTime<Utc>) -> String {
    let diff = (target - now).num_seconds();
    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
