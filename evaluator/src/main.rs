//! Evaluate user stories against a repository checkout.
//!
//! Each story is investigated by a model through read-only tools; the verdict
//! is persisted with file-and-line evidence and reused from the evidence cache
//! while the cited files are unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use evaluator::batch::evaluate_stories;
use evaluator::cache::{CacheLookup, get_cache_key, hash_file_content, lookup_and_validate_cache};
use evaluator::core::types::{EvaluationRequest, RepoIdentity, Story};
use evaluator::evaluate::EvaluationDeps;
use evaluator::exit_codes;
use evaluator::io::cache_store::FileCacheStore;
use evaluator::io::config::{EvaluatorConfig, load_config, write_config};
use evaluator::io::docs::{DirectoryDocs, DocsProvider, NoDocs};
use evaluator::io::model::CommandModelClient;
use evaluator::io::results::JsonResultSink;
use evaluator::io::sandbox::LocalSandbox;
use evaluator::logging;

const DEFAULT_CONFIG: &str = "evaluator.toml";

#[derive(Parser)]
#[command(
    name = "evaluator",
    version,
    about = "Evidence-backed user story evaluation"
)]
struct Cli {
    /// Path to the TOML config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Evaluate one or more stories (JSON object or array) against a checkout.
    Evaluate(EvaluateArgs),
    /// Validate the cached evidence for a story against the current checkout.
    CheckCache {
        /// Story JSON file.
        #[arg(long)]
        story: PathBuf,
        /// Sandbox home; the repository lives at `{home}/{workspace_dir}`.
        #[arg(long)]
        home: PathBuf,
        /// Commit to look up; defaults to the story's commit.
        #[arg(long)]
        commit: Option<String>,
    },
    /// Print the cache key for a story and commit.
    CacheKey { story_id: String, commit_sha: String },
    /// Print the content hash of a file.
    Hash { path: PathBuf },
}

#[derive(clap::Args)]
struct EvaluateArgs {
    /// Story JSON file (one story or an array).
    #[arg(long)]
    stories: PathBuf,
    /// Sandbox home; the repository lives at `{home}/{workspace_dir}`.
    #[arg(long)]
    home: PathBuf,
    #[arg(long, default_value = "local")]
    sandbox_id: String,
    /// `{owner}/{repo}`.
    #[arg(long)]
    repo_slug: String,
    #[arg(long)]
    run_id: Option<String>,
    /// Overrides `max_steps` from the config.
    #[arg(long)]
    max_steps: Option<u32>,
    /// Overrides `model_id` from the config.
    #[arg(long)]
    model_id: Option<String>,
    /// Skip the evidence cache for this invocation.
    #[arg(long)]
    no_cache: bool,
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Evaluate(args) => cmd_evaluate(&cli.config, &args),
        Command::CheckCache {
            story,
            home,
            commit,
        } => cmd_check_cache(&cli.config, &story, &home, commit.as_deref()),
        Command::CacheKey {
            story_id,
            commit_sha,
        } => {
            println!("{}", get_cache_key(&story_id, &commit_sha));
            Ok(exit_codes::OK)
        }
        Command::Hash { path } => {
            let content = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            println!("{}", hash_file_content(&content));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if !force && config_path.exists() {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &EvaluatorConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_evaluate(config_path: &Path, args: &EvaluateArgs) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(model_id) = &args.model_id {
        config.model_id.clone_from(model_id);
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if args.no_cache {
        config.cache.enabled = false;
    }
    config.validate()?;

    let stories = load_stories(&args.stories)?;
    if stories.is_empty() {
        bail!("no stories in {}", args.stories.display());
    }
    let requests: Vec<EvaluationRequest> = stories
        .into_iter()
        .map(|story| EvaluationRequest {
            repo: RepoIdentity {
                id: story.repo_id.clone(),
                slug: args.repo_slug.clone(),
            },
            story,
            run_id: args.run_id.clone(),
            sandbox_id: args.sandbox_id.clone(),
            model_id: config.model_id.clone(),
            max_steps: config.max_steps,
        })
        .collect();

    let sandbox = LocalSandbox::new(
        &args.sandbox_id,
        &args.home,
        config.command_output_limit_bytes,
    );
    let model = CommandModelClient::new(
        config.model.command.clone(),
        config.model_timeout(),
        config.command_output_limit_bytes,
    );
    let docs: Box<dyn DocsProvider> = match &config.docs.dir {
        Some(dir) => Box::new(DirectoryDocs::new(dir)),
        None => Box::new(NoDocs),
    };
    let store = FileCacheStore::new(&config.cache.dir);
    let sink = JsonResultSink::new(&config.results_dir);
    let deps = EvaluationDeps {
        model: &model,
        sandbox: &sandbox,
        docs: docs.as_ref(),
        cache: Some(&store),
        sink: &sink,
    };

    let outcome = evaluate_stories(&requests, &deps, &config, |report| {
        match &report.outcome {
            Ok(outcome) => println!(
                "{}\t{}\t{}",
                report.story_id,
                outcome.status().as_str(),
                outcome.paths.dir.display()
            ),
            Err(err) => println!("{}\tfailed\t{err:#}", report.story_id),
        }
    });

    if outcome.reports.iter().any(|report| report.outcome.is_err()) {
        return Ok(exit_codes::INVALID);
    }
    Ok(exit_codes::for_statuses(
        outcome.reports.iter().filter_map(|report| report.status()),
    ))
}

fn cmd_check_cache(
    config_path: &Path,
    story_path: &Path,
    home: &Path,
    commit: Option<&str>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let story = load_story(story_path)?;
    let Some(commit_sha) = commit.or(story.commit_sha.as_deref()) else {
        bail!("story {} has no commit; pass --commit", story.id);
    };
    let sandbox = LocalSandbox::new("local", home, config.command_output_limit_bytes);
    let store = FileCacheStore::new(&config.cache.dir);

    match lookup_and_validate_cache(&store, &story, commit_sha, &sandbox, &config.workspace_dir) {
        CacheLookup::Miss => {
            println!("miss");
            Ok(exit_codes::OK)
        }
        CacheLookup::Hit { validation, .. } => {
            let payload =
                serde_json::to_string_pretty(&validation).context("serialize validation")?;
            println!("{payload}");
            Ok(exit_codes::OK)
        }
    }
}

fn load_stories(path: &Path) -> Result<Vec<Story>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let stories = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|story| vec![story])
    };
    stories.with_context(|| format!("parse stories in {}", path.display()))
}

fn load_story(path: &Path) -> Result<Story> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse story {}", path.display()))
}
