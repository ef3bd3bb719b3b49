use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use assembly_core::job::{
    job_id_for, HealthPayload, JobHandle, JobManager, JobSnapshot, JobStatus, JournalError,
    SegmentInput, SetupError, SqliteJobJournal, TransitionRecord, ValidationError,
};
use assembly_core::timeline::format_timestamp;
use assembly_core::{
    load_assembler_config, AssemblerConfig, MeasuredSegment, SystemCommandExecutor, Timeline,
    TimelineBuilder, TimelineError,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] assembly_core::ConfigError),
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid cues: {0}")]
    Timeline(#[from] TimelineError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Episode assembler control interface", long_about = None)]
pub struct Cli {
    /// Path to assembler.toml
    #[arg(long, default_value = "configs/assembler.toml")]
    pub config: PathBuf,
    /// Overrides paths.work_dir
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    /// Overrides paths.journal_db
    #[arg(long)]
    pub journal_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reports service liveness
    Health,
    /// Assembles an episode from a JSON list of segments
    Assemble(AssembleArgs),
    /// Shows the journaled transitions of a job
    History(HistoryArgs),
    /// Renders subtitle cues offline from known durations
    Subtitles(SubtitlesArgs),
}

#[derive(Args, Debug)]
pub struct AssembleArgs {
    /// Episode identifier
    #[arg(long)]
    pub episode: String,
    /// JSON file with `[{index, source_url, text}]`
    #[arg(long)]
    pub segments: PathBuf,
    /// Print the job handle once accepted instead of the final snapshot;
    /// the exit status still reflects the outcome
    #[arg(long, default_value_t = false)]
    pub no_wait: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Job identifier
    #[arg(long, required_unless_present = "episode", conflicts_with = "episode")]
    pub job: Option<String>,
    /// Episode identifier, resolved to its job id
    #[arg(long)]
    pub episode: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubtitlesArgs {
    /// JSON file with `[{index, text, duration_ms}]`
    #[arg(long)]
    pub cues: PathBuf,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Health => {
            render(&context.health(), cli.format)?;
        }
        Commands::Assemble(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let snapshot = runtime.block_on(context.assemble(args, cli.format))?;
            if !args.no_wait {
                render(&snapshot, cli.format)?;
            }
            if snapshot.status == JobStatus::Failed {
                let message = snapshot
                    .error
                    .as_ref()
                    .map(|failure| failure.message.clone())
                    .unwrap_or_else(|| "unknown failure".to_string());
                return Err(AppError::JobFailed {
                    job_id: snapshot.job_id,
                    message,
                });
            }
        }
        Commands::History(args) => {
            let history = context.history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Subtitles(args) => {
            let rendered = context.subtitles(args)?;
            render(&rendered, cli.format)?;
        }
    }

    Ok(())
}

trait DisplayFallback {
    fn display(&self) -> String;
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

#[derive(Debug)]
struct AppContext {
    config: AssemblerConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_assembler_config(&cli.config)?;
        if let Some(work_dir) = &cli.work_dir {
            config.paths.work_dir = work_dir.clone();
        }
        if let Some(journal_db) = &cli.journal_db {
            config.paths.journal_db = Some(journal_db.clone());
        }
        Ok(Self { config })
    }

    fn health(&self) -> HealthPayload {
        HealthPayload::ok(self.config.system.service_name.as_str())
    }

    async fn assemble(&self, args: &AssembleArgs, format: OutputFormat) -> Result<JobSnapshot> {
        let segments = read_segments(&args.segments)?;
        let manager = JobManager::from_config(&self.config, Arc::new(SystemCommandExecutor))?;
        let handle = manager.submit(&args.episode, segments)?;
        info!(job_id = %handle.job_id, episode = %args.episode, "submitted");
        if args.no_wait {
            render(&handle, format)?;
        }
        // The job runs on this process's runtime, so it is awaited either way.
        manager
            .wait(&handle.job_id)
            .await
            .ok_or_else(|| AppError::MissingResource(format!("job {}", handle.job_id)))
    }

    fn history(&self, args: &HistoryArgs) -> Result<JobHistory> {
        let job_id = match (&args.job, &args.episode) {
            (Some(job), _) => job.clone(),
            (None, Some(episode)) => job_id_for(episode),
            (None, None) => {
                return Err(AppError::MissingResource("--job or --episode".to_string()))
            }
        };
        let path = self
            .config
            .paths
            .journal_db
            .clone()
            .ok_or_else(|| AppError::MissingResource("paths.journal_db".to_string()))?;
        if !path.exists() {
            return Err(AppError::MissingResource(path.display().to_string()));
        }
        let journal = SqliteJobJournal::builder().path(&path).read_only(true).build()?;
        let transitions = journal.history(&job_id)?;
        Ok(JobHistory {
            job_id,
            transitions,
        })
    }

    fn subtitles(&self, args: &SubtitlesArgs) -> Result<RenderedSubtitles> {
        let content = fs::read_to_string(&args.cues)?;
        let mut cues: Vec<CueInput> = serde_json::from_str(&content)?;
        cues.sort_by_key(|cue| cue.index);
        let timeline = TimelineBuilder::build(cues.iter().map(|cue| MeasuredSegment {
            index: cue.index,
            duration_millis: Some(cue.duration_ms),
            text: &cue.text,
        }))?;
        Ok(RenderedSubtitles {
            srt: timeline.to_srt(),
            timeline,
        })
    }
}

fn read_segments(path: &Path) -> Result<Vec<SegmentInput>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[derive(Debug, Deserialize)]
struct CueInput {
    index: usize,
    text: String,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct JobHistory {
    pub job_id: String,
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Serialize)]
pub struct RenderedSubtitles {
    pub timeline: Timeline,
    #[serde(skip)]
    pub srt: String,
}

impl DisplayFallback for HealthPayload {
    fn display(&self) -> String {
        format!("{}: {}", self.service, self.status)
    }
}

impl DisplayFallback for JobHandle {
    fn display(&self) -> String {
        if self.deduplicated {
            format!("{} already running ({})", self.job_id, self.status)
        } else {
            format!("{} accepted ({})", self.job_id, self.status)
        }
    }
}

impl DisplayFallback for JobSnapshot {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} | episode={} | status={}",
            self.job_id, self.episode_id, self.status
        )];
        for segment in &self.segments {
            let duration = segment
                .duration_millis
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  segment {} status={} duration={}",
                segment.index, segment.status, duration
            ));
        }
        if let Some(total) = self.total_duration_millis {
            lines.push(format!("  total={}", format_timestamp(total)));
        }
        if let Some(reference) = &self.result_ref {
            lines.push(format!("  result={reference}"));
        }
        if let Some(error) = &self.error {
            let segment = error
                .segment_index
                .map(|index| format!(" segment={index}"))
                .unwrap_or_default();
            lines.push(format!(
                "  error[{}] at {}{}: {}",
                error.kind, error.stage, segment, error.message
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for JobHistory {
    fn display(&self) -> String {
        if self.transitions.is_empty() {
            return format!("No transitions recorded for {}", self.job_id);
        }
        let mut lines = Vec::new();
        for record in &self.transitions {
            let at = record
                .recorded_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{at} {} -> {}",
                record.from_status.as_deref().unwrap_or("-"),
                record.to_status
            );
            if let Some(kind) = &record.error_kind {
                line.push_str(&format!(
                    " [{kind}] {}",
                    record.error_message.as_deref().unwrap_or_default()
                ));
            }
            if let Some(reference) = &record.result_ref {
                line.push_str(&format!(" result={reference}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl DisplayFallback for RenderedSubtitles {
    fn display(&self) -> String {
        self.srt.trim_end().to_string()
    }
}
