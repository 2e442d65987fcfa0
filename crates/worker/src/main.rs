use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use microbatch_core::engine::{DecodeEngine, Executor};
use microbatch_core::request::Request;

use microbatch_worker::config::WorkerFileConfig;
use microbatch_worker::logging::{self, LogFormat};
use microbatch_worker::model::SyntheticModel;

#[derive(Parser)]
#[command(name = "microbatch-worker", about = "Micro-batching decode executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode the given prompts and print their completions
    Run {
        /// Prompt as comma-separated token ids; repeat for more requests
        #[arg(long = "prompt", required = true)]
        prompts: Vec<String>,

        /// Stop sequence as comma-separated token ids; may be repeated
        #[arg(long = "stop")]
        stop_words: Vec<String>,

        /// Keep matched stop tokens in the output
        #[arg(long)]
        include_stop_str_in_output: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the effective configuration
    Config {
        /// Write the merged configuration to the default path
        #[arg(long)]
        save: bool,

        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Default)]
struct Overrides {
    /// Config file to read instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rank threads; 0 decodes inline
    #[arg(long)]
    world_size: Option<usize>,

    /// Tokens per KV-cache page
    #[arg(long)]
    page_size: Option<usize>,

    /// KV-cache pages per rank
    #[arg(long)]
    num_pages: Option<usize>,

    /// Maximum requests decoded together
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Catch-up wait per missing request, in milliseconds
    #[arg(long)]
    catch_up_timeout_ms: Option<u64>,

    /// Vocabulary size of the synthetic model
    #[arg(long)]
    vocab_size: Option<usize>,

    /// Maximum generated tokens per request
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sample from the k most likely tokens instead of greedy decoding
    #[arg(long)]
    top_k: Option<usize>,

    /// Sampling temperature (top-k only)
    #[arg(long)]
    temperature: Option<f32>,

    /// Seed for the sampling RNG
    #[arg(long)]
    seed: Option<u64>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Overrides {
    /// File config (explicit path or default location) with CLI flags on top.
    fn resolve(&self) -> anyhow::Result<WorkerFileConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerFileConfig::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => WorkerFileConfig::load(),
        };
        config.merge(&WorkerFileConfig {
            world_size: self.world_size,
            page_size: self.page_size,
            num_pages: self.num_pages,
            max_batch_size: self.max_batch_size,
            catch_up_timeout_ms: self.catch_up_timeout_ms,
            vocab_size: self.vocab_size,
            max_tokens: self.max_tokens,
            top_k: self.top_k,
            temperature: self.temperature,
            seed: self.seed,
            log_level: self.log_level.clone(),
        });
        Ok(config)
    }
}

fn parse_token_ids(text: &str) -> anyhow::Result<Vec<u32>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("invalid token id {s:?} in {text:?}"))
        })
        .collect()
}

fn run(
    prompts: &[String],
    stop_words: &[String],
    include_stop_str_in_output: bool,
    config: &WorkerFileConfig,
) -> anyhow::Result<()> {
    let vocab_size = config.vocab_size()?;
    let engine_config = config.engine_config()?;
    let executor_config = config.executor_config()?;

    let mut params = config.sampling_params();
    params.stop_words = stop_words
        .iter()
        .map(|s| parse_token_ids(s))
        .collect::<anyhow::Result<_>>()?;
    params.include_stop_str_in_output = include_stop_str_in_output;

    let mut executor = Executor::new(&executor_config, move |rank| {
        tracing::debug!(rank, vocab_size, "Building synthetic model");
        let model = SyntheticModel::new(vocab_size, engine_config.device.clone());
        Ok(DecodeEngine::new(model, &engine_config))
    })?;

    let mut results = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let ids = parse_token_ids(prompt)?;
        if let Some(&bad) = ids.iter().find(|&&t| t as usize >= vocab_size) {
            anyhow::bail!("token id {bad} is outside the vocabulary of {vocab_size}");
        }
        results.push(executor.submit(Request::new(ids, params.clone()))?);
    }

    for result in results {
        let request_id = result.request_id();
        for completion in result.wait()? {
            let tokens: Vec<String> = completion.token_ids.iter().map(u32::to_string).collect();
            println!(
                "request {request_id}: [{}] finish_reason={}",
                tokens.join(","),
                completion.finish_reason
            );
        }
    }

    executor.shutdown()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompts,
            stop_words,
            include_stop_str_in_output,
            overrides,
        } => {
            let config = overrides.resolve()?;
            logging::init_with_level_and_format(config.log_level.as_deref(), LogFormat::from_env());
            let source = overrides
                .config
                .clone()
                .or_else(|| WorkerFileConfig::default_path().filter(|p| p.exists()));
            if let Some(path) = source {
                tracing::info!(path = %path.display(), "Loaded config file");
            }
            run(&prompts, &stop_words, include_stop_str_in_output, &config)
        }
        Command::Config { save, overrides } => {
            let config = overrides.resolve()?;
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                let path = WorkerFileConfig::default_path()
                    .context("no config directory available")?;
                config.save_to(&path)?;
                eprintln!("Saved config to: {}", path.display());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_parse_with_spaces() {
        assert_eq!(parse_token_ids("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_token_ids("1,x").is_err());
        assert!(parse_token_ids("").unwrap().is_empty());
    }

    #[test]
    fn cli_parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "microbatch-worker",
            "run",
            "--prompt",
            "1,2",
            "--prompt",
            "3",
            "--stop",
            "7,8",
            "--world-size",
            "2",
            "--top-k",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                prompts,
                stop_words,
                overrides,
                ..
            } => {
                assert_eq!(prompts, vec!["1,2", "3"]);
                assert_eq!(stop_words, vec!["7,8"]);
                assert_eq!(overrides.world_size, Some(2));
                assert_eq!(overrides.top_k, Some(5));
            }
            Command::Config { .. } => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn run_decodes_inline_and_across_ranks() {
        for world_size in [0, 2] {
            let config = WorkerFileConfig {
                world_size: Some(world_size),
                vocab_size: Some(32),
                max_tokens: Some(3),
                num_pages: Some(16),
                ..Default::default()
            };
            run(&["1,2".into(), "4".into()], &["9".into()], false, &config).unwrap();
        }
    }

    #[test]
    fn run_rejects_out_of_vocab_prompt() {
        let config = WorkerFileConfig {
            vocab_size: Some(8),
            ..Default::default()
        };
        assert!(run(&["9".into()], &[], false, &config).is_err());
    }

    #[test]
    fn run_rejects_zero_sizes_before_building_engines() {
        for config in [
            WorkerFileConfig {
                page_size: Some(0),
                ..Default::default()
            },
            WorkerFileConfig {
                vocab_size: Some(0),
                ..Default::default()
            },
        ] {
            assert!(run(&["1".into()], &[], false, &config).is_err());
        }
    }
}
