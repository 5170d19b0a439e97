//! synd-queue - Manage scheduled social posts
//!
//! Unix-style tool for scheduling, listing and cancelling the posts of an
//! article, asking for posting-time recommendations, and converting between
//! plain text and portable text.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use tracing::debug;

use libsyndicast::logging::LoggingConfig;
use libsyndicast::portable_text::{
    from_plain_text, parse_document, to_markdown, to_plain_text, to_speech_text,
};
use libsyndicast::recommend::{format_recommended_time, Recommender};
use libsyndicast::scheduling::parse_schedule_time;
use libsyndicast::service::{ScheduleRequest, SyndicastService};
use libsyndicast::{Channel, Config, ScheduledPost, SyndicastError};

#[derive(Parser, Debug)]
#[command(name = "synd-queue")]
#[command(version)]
#[command(about = "Manage scheduled social posts")]
#[command(long_about = "\
synd-queue - Manage scheduled social posts

DESCRIPTION:
    synd-queue schedules repurposed article copy for LinkedIn, Facebook and
    Instagram, lists and cancels scheduled posts, recommends posting times,
    and converts article bodies between plain text and portable text.

USAGE EXAMPLES:
    # Schedule a LinkedIn post two hours from now
    synd-queue schedule post-42 --channel linkedin --at 2h \"New article is live\"

    # Schedule from stdin at an exact time
    echo \"Read it here\" | synd-queue schedule post-42 --channel facebook --at 2025-11-20T15:00:00Z

    # List an article's scheduled posts as JSON
    synd-queue list post-42 --format json

    # Cancel the second scheduled post (indices start at 0)
    synd-queue cancel post-42 1

    # Recommend Instagram slots for the week
    synd-queue recommend --channel instagram --week --timezone Europe/Berlin

    # Render an article body as Markdown
    synd-queue render body.json --as markdown

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml

    Override with environment variables:
        SYNDICAST_CONFIG    - Path to config file
        SYNDICAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad index, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule a post for an article
    Schedule {
        /// Article identifier
        article_id: String,

        /// Channel to publish on: linkedin, facebook or instagram
        #[arg(short, long)]
        channel: Channel,

        /// When to publish (RFC 3339, "2h", "tomorrow 9am", "random:10m-1h")
        #[arg(long, value_name = "TIME")]
        at: String,

        /// Image to attach
        #[arg(long)]
        image_url: Option<String>,

        /// Hashtag to attach (repeatable)
        #[arg(long = "hashtag", value_name = "TAG")]
        hashtags: Vec<String>,

        /// Post text; read from stdin when omitted
        content: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List an article's scheduled posts
    List {
        article_id: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Cancel a scheduled post by index
    Cancel { article_id: String, index: usize },

    /// Recommend posting times for a channel
    Recommend {
        #[arg(short, long)]
        channel: String,

        /// Day to recommend for (YYYY-MM-DD); today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,

        /// IANA zone used to display the times
        #[arg(long, default_value = "UTC")]
        timezone: String,

        #[arg(short = 'n', long, default_value_t = 3)]
        count: usize,

        /// Look across the next seven days instead of one day
        #[arg(long)]
        week: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Render a portable text document
    Render {
        /// JSON file holding the block array, or - for stdin
        input: String,

        #[arg(long = "as", value_enum, default_value_t = RenderAs::Plain)]
        render_as: RenderAs,
    },

    /// Convert plain text into portable text JSON
    Import {
        /// Text file, or - for stdin
        input: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RenderAs {
    Plain,
    Markdown,
    Speech,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet by default: stdout carries the command output
    let mut logging = LoggingConfig::from_env();
    if std::env::var_os("SYNDICAST_LOG_LEVEL").is_none() {
        logging.level = "warn".to_string();
    }
    logging.verbose(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<SyndicastError>()
        .map_or(1, SyndicastError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Schedule {
            article_id,
            channel,
            at,
            image_url,
            hashtags,
            content,
            format,
        } => {
            let content = match content {
                Some(text) => text,
                None => read_input("-")?,
            };
            let service = open_service().await?;
            cmd_schedule(
                &service,
                ScheduleInput {
                    article_id,
                    channel,
                    at,
                    image_url,
                    hashtags,
                    content,
                },
                format,
            )
            .await
        }
        Commands::List { article_id, format } => {
            let service = open_service().await?;
            cmd_list(&service, &article_id, format).await
        }
        Commands::Cancel { article_id, index } => {
            let service = open_service().await?;
            cmd_cancel(&service, &article_id, index).await
        }
        Commands::Recommend {
            channel,
            date,
            timezone,
            count,
            week,
            format,
        } => cmd_recommend(&channel, date, &timezone, count, week, format),
        Commands::Render { input, render_as } => cmd_render(&input, render_as),
        Commands::Import { input } => cmd_import(&input),
    }
}

async fn open_service() -> anyhow::Result<SyndicastService> {
    let config = Config::load()?;
    let (service, _queue) = SyndicastService::open(&config).await?;
    Ok(service)
}

/// Read a file, or stdin for `-`
fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))
    }
}

struct ScheduleInput {
    article_id: String,
    channel: Channel,
    at: String,
    image_url: Option<String>,
    hashtags: Vec<String>,
    content: String,
}

async fn cmd_schedule(
    service: &SyndicastService,
    input: ScheduleInput,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let content = input.content.trim().to_string();
    if content.is_empty() {
        return Err(SyndicastError::InvalidInput("Post content cannot be empty".to_string()).into());
    }

    let now = Utc::now();
    let latest = service
        .scheduler()
        .latest_scheduled_at(&input.article_id)
        .await?;
    let scheduled_at = parse_schedule_time(&input.at, now, latest)?;
    debug!(input = %input.at, %scheduled_at, "resolved schedule time");
    if scheduled_at <= now {
        return Err(SyndicastError::InvalidInput(format!(
            "Scheduled time {} is not in the future",
            scheduled_at.to_rfc3339()
        ))
        .into());
    }

    let hashtags = input
        .hashtags
        .iter()
        .map(|tag| tag.trim().trim_start_matches('#').to_string())
        .filter(|tag| !tag.is_empty())
        .collect();

    let response = service
        .schedule(ScheduleRequest {
            article_id: input.article_id,
            channel: input.channel,
            content,
            scheduled_at,
            image_url: input.image_url,
            hashtags,
        })
        .await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => {
            if let Some(id) = &response.scheduled_post_id {
                println!("{}", id);
            }
        }
    }

    if !response.success {
        anyhow::bail!(
            "Scheduling failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

async fn cmd_list(
    service: &SyndicastService,
    article_id: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let posts = service.scheduled_posts(article_id).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&posts)?),
        OutputFormat::Text => {
            for (index, post) in posts.iter().enumerate() {
                println!("{}", format_post_line(index, post));
            }
        }
    }
    Ok(())
}

fn format_post_line(index: usize, post: &ScheduledPost) -> String {
    let detail = match (&post.platform_post_id, &post.error) {
        (Some(id), _) => format!(" | {}", id),
        (None, Some(error)) => format!(" | {}", error),
        (None, None) => String::new(),
    };
    format!(
        "{} | {} | {} | {} | {}{}",
        index,
        post.channel,
        post.status,
        post.scheduled_at.to_rfc3339(),
        truncate_content(&post.content, 50),
        detail
    )
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

async fn cmd_cancel(service: &SyndicastService, article_id: &str, index: usize) -> anyhow::Result<()> {
    let posts = service.scheduled_posts(article_id).await?;
    if index >= posts.len() {
        return Err(SyndicastError::InvalidInput(format!(
            "Invalid index {} for article {} ({} scheduled posts)",
            index,
            article_id,
            posts.len()
        ))
        .into());
    }

    let response = service.cancel(article_id, index).await;
    if !response.success {
        anyhow::bail!(
            "Cancel failed: {}",
            response.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!("Cancelled post {} of {}", index, article_id);
    Ok(())
}

fn cmd_recommend(
    channel: &str,
    date: Option<NaiveDate>,
    timezone: &str,
    count: usize,
    week: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let recommender = Recommender::new(std::sync::Arc::new(libsyndicast::clock::SystemClock));
    let date = date.unwrap_or_else(|| Utc::now().date_naive());

    let times = if week {
        libsyndicast::recommend::parse_timezone(timezone)?;
        recommender.next_optimal_times(channel, date, count)
    } else {
        recommender.recommended_times(channel, date, timezone, count)?
    };

    match format {
        OutputFormat::Json => {
            let json: Vec<_> = times
                .iter()
                .map(|at| {
                    serde_json::json!({
                        "at": at.to_rfc3339(),
                        "display": format_recommended_time(*at, Some(timezone)),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for at in &times {
                println!("{}  {}", at.to_rfc3339(), format_recommended_time(*at, Some(timezone)));
            }
        }
    }
    Ok(())
}

fn cmd_render(input: &str, render_as: RenderAs) -> anyhow::Result<()> {
    let raw = read_input(input)?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        SyndicastError::InvalidInput(format!("Document is not valid JSON: {}", e))
    })?;
    let blocks = parse_document(Some(&value));

    let rendered = match render_as {
        RenderAs::Plain => to_plain_text(&blocks),
        RenderAs::Markdown => to_markdown(&blocks),
        RenderAs::Speech => to_speech_text(&blocks),
    };
    println!("{}", rendered);
    Ok(())
}

fn cmd_import(input: &str) -> anyhow::Result<()> {
    let text = read_input(input)?;
    let blocks = from_plain_text(&text);
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}
