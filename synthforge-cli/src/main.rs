//! Stage binaries for the synthforge pipelines.
//!
//! Every stage is a subcommand reading a JSONL input and appending to a
//! JSONL output, resumable by re-running with the same arguments. Judge
//! failures are in-band (safe-default scores), so a stage exits 0 even
//! when many records failed their judges.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use synthforge::agent::{AgentRunner, RunnerOptions, extract_query};
use synthforge::chainops::{ChainVerifier, Operator, split_sub_chains};
use synthforge::config::{ApiConfigs, DEFAULT_MAX_CONCURRENT, SandboxConfig};
use synthforge::graph::{SubChainReport, ToolGraph, parse_detected_chains};
use synthforge::jsonl::{JsonlWriter, read_values};
use synthforge::llm::ChatClient;
use synthforge::merge::MergeEngine;
use synthforge::message::ChatMessage;
use synthforge::necessity::check_necessity;
use synthforge::prompts::PromptStore;
use synthforge::query::{
    AugmentMode, augmentation_records, build_augment_prompt, build_gen_prompt, builtin_personas,
    load_personas, parse_augmentation_response, parse_generated_query, parse_quality_response,
    quality_score_info, query_record, sample_persona, tool_descriptions,
};
use synthforge::reward::RewardScorer;
use synthforge::runtime::Runtime;
use synthforge::stage::{StageOptions, StageOutcome, field_keyer, run_stage};
use synthforge::synth::{ToolSynthesizer, synthesize_record};
use synthforge::trace::DecompositionRecord;
use synthforge::verify::Verifier;
use synthforge::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "synthforge", version, about = "Agentic training-data synthesis pipelines")]
struct Cli {
    /// Path to the model configuration table (JSON).
    #[arg(long, env = "API_CONFIGS", default_value = "api_configs.json")]
    api_configs: PathBuf,

    /// Directory for rolling log files.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Per-workload concurrency for named semaphores.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct IoArgs {
    /// Input JSONL file.
    #[arg(long)]
    input_file: PathBuf,
    /// Output JSONL file (appended to on resume).
    #[arg(long)]
    output_file: PathBuf,
    /// Model name, a key into the configuration table.
    #[arg(long)]
    model_name: String,
    /// Records processed in parallel.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run raw completions and post-process them into decomposition records.
    Ingest {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Annotate per-step tool necessity and record legitimacy.
    CheckNecessity {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Run the four-judge decomposition verifier.
    Verify {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Synthesize an executable tool per tool-necessary hop.
    Synthesize {
        #[command(flatten)]
        io: IoArgs,
        /// Minimum composite verification score.
        #[arg(long)]
        threshold: f64,
        /// Sandbox endpoint; defaults to $SANDBOX_URL.
        #[arg(long)]
        sandbox_url: Option<String>,
    },
    /// Cluster synthesized tools by intent and merge each cluster.
    MergeTools {
        #[command(flatten)]
        io: IoArgs,
        /// Sandbox endpoint; defaults to $SANDBOX_URL.
        #[arg(long)]
        sandbox_url: Option<String>,
    },
    /// Detect tool dependency chains over MCP catalogs.
    DetectChains {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Enumerate bounded-length sub-chains from detected graphs.
    SubChains {
        /// Input JSONL file.
        #[arg(long)]
        input_file: PathBuf,
        /// Output JSONL file.
        #[arg(long)]
        output_file: PathBuf,
        /// Minimum chain length.
        #[arg(long, default_value_t = 2)]
        min_length: usize,
        /// Maximum chain length.
        #[arg(long, default_value_t = 5)]
        max_length: usize,
    },
    /// Verify sub-chains by voting and back-translation.
    VerifyChains {
        #[command(flatten)]
        io: IoArgs,
        /// Samples per vote.
        #[arg(long, default_value_t = 3)]
        n_samples: usize,
        /// Models for back-translation (comma separated); empty disables
        /// the operator.
        #[arg(long, value_delimiter = ',')]
        back_translation_models: Vec<String>,
    },
    /// Generate user queries for accepted sub-chains.
    GenQueries {
        #[command(flatten)]
        io: IoArgs,
        /// Samples per sub-chain.
        #[arg(long, default_value_t = 1)]
        n_samples: usize,
        /// Also keep chains with no operator verdicts.
        #[arg(long)]
        unverified: bool,
    },
    /// Augment generated queries.
    Augment {
        #[command(flatten)]
        io: IoArgs,
        /// Augmentation mode: diverse, complicate or add_ug.
        #[arg(long, default_value = "diverse")]
        mode: String,
        /// Variations requested per query.
        #[arg(long, default_value_t = 1)]
        variations_count: usize,
        /// Persona table (JSONL) for add_ug mode.
        #[arg(long)]
        persona_file: Option<PathBuf>,
    },
    /// Score query quality along four dimensions.
    ScoreQueries {
        #[command(flatten)]
        io: IoArgs,
    },
    /// Drive the agent loop over query records.
    Interact {
        #[command(flatten)]
        io: IoArgs,
        /// Parallel workers.
        #[arg(long, default_value_t = 4)]
        max_workers: usize,
        /// Per-task wall-clock timeout in seconds.
        #[arg(long, default_value_t = 90)]
        timeout: u64,
        /// System prompt for the agent.
        #[arg(long, default_value = "")]
        system_prompt: String,
        /// Smithery API key.
        #[arg(long, default_value = "")]
        smithery_api_key: String,
        /// Smithery profile.
        #[arg(long, default_value = "")]
        smithery_profile: String,
    },
    /// Score trajectories along the seven reward dimensions.
    Reward {
        #[command(flatten)]
        io: IoArgs,
    },
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    synthforge::logging::init(&cli.log_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "stage failed");
            std::process::ExitCode::FAILURE
        }
    }
}

fn build_runtime(cli: &Cli) -> Result<Runtime> {
    let configs = ApiConfigs::load(&cli.api_configs)?;
    let prompts = PromptStore::from_env()?;
    Ok(Runtime::new(configs, prompts, cli.max_concurrent))
}

fn sandbox_config(explicit: Option<String>) -> Result<SandboxConfig> {
    match explicit {
        Some(url) => Ok(SandboxConfig::new(url)),
        None => SandboxConfig::from_env(),
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let client = ChatClient::new();

    match &cli.command {
        Command::Ingest { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            synthforge::ingest::run_completions(&client, &cfg, inputs, &io.output_file, io.concurrency)
                .await?;

            let raw = read_values(&io.output_file)?;
            let (records, _stats) = synthforge::ingest::post_process(&raw, &io.model_name);
            let processed = processed_path(&io.output_file);
            let mut writer = JsonlWriter::truncate(&processed)?;
            for record in &records {
                writer.write(record)?;
            }
            info!(path = %processed.display(), count = records.len(), "processed records written");
        }

        Command::CheckNecessity { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = field_keyer("uuid");
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| async move {
                let mut record: DecompositionRecord = serde_json::from_value(value)?;
                check_necessity(runtime, client, cfg, &mut record).await?;
                Ok(StageOutcome::Emit(serde_json::to_value(&record)?))
            })
            .await?;
        }

        Command::Verify { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = field_keyer("uuid");
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| async move {
                let mut record: DecompositionRecord = serde_json::from_value(value)?;
                record.validate()?;
                Verifier::new(runtime, client, cfg).verify(&mut record).await?;
                Ok(StageOutcome::Emit(serde_json::to_value(&record)?))
            })
            .await?;
        }

        Command::Synthesize {
            io,
            threshold,
            sandbox_url,
        } => {
            let runtime = build_runtime(&cli)?.with_sandbox(sandbox_config(sandbox_url.clone())?);
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = field_keyer("uuid");
            let opts = stage_opts(io);
            let threshold = *threshold;
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| async move {
                let mut record: DecompositionRecord = serde_json::from_value(value)?;
                if record.tool_necessity_legitimacy == Some(false) {
                    info!(uuid = %record.uuid, "tool necessity illegitimate; skipping");
                    return Ok(StageOutcome::Drop);
                }
                let score = record
                    .verify_result
                    .as_ref()
                    .and_then(|v| v.get("score"))
                    .and_then(Value::as_f64)
                    .unwrap_or(f64::MIN);
                if score < threshold {
                    info!(uuid = %record.uuid, score, threshold, "below verification threshold; skipping");
                    return Ok(StageOutcome::Drop);
                }
                let synthesizer = ToolSynthesizer::new(runtime, client, cfg);
                synthesize_record(&synthesizer, &mut record).await?;
                Ok(StageOutcome::Emit(serde_json::to_value(&record)?))
            })
            .await?;
        }

        Command::MergeTools { io, sandbox_url } => {
            let runtime = build_runtime(&cli)?.with_sandbox(sandbox_config(sandbox_url.clone())?);
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = field_keyer("uuid");
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| async move {
                let record: DecompositionRecord = serde_json::from_value(value)?;
                let engine = MergeEngine::new(runtime, client, cfg);
                match engine.merge_tools(record).await? {
                    Some(record) => Ok(StageOutcome::Emit(serde_json::to_value(&record)?)),
                    None => Ok(StageOutcome::Drop),
                }
            })
            .await?;
        }

        Command::DetectChains { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = group_id_keyer();
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| {
                async move {
                    let group_info = value
                        .pointer("/base_info/group_info")
                        .cloned()
                        .unwrap_or(Value::Null);
                    let tool_list = value
                        .pointer("/base_info/tool_list")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let tool_lines: String = tool_list
                        .iter()
                        .map(|t| format!("{t}\n"))
                        .collect();
                    let prompt = runtime.prompts.render(
                        "tool_graph_detect",
                        &[
                            ("group_info", &serde_json::to_string(&group_info)?),
                            ("tool_list", tool_lines.as_str()),
                        ],
                    )?;
                    let outcome = client.chat(&[ChatMessage::user(prompt)], cfg).await?;
                    let detected = parse_detected_chains(outcome.text());
                    let num_chains = detected.len();
                    let mcp_info = serde_json::json!({
                        "base_info": value.get("base_info").cloned().unwrap_or(Value::Null),
                        "call_info": value.get("call_info").cloned().unwrap_or(Value::Null),
                        "features": value.get("features").cloned(),
                    });
                    Ok(StageOutcome::Emit(serde_json::json!({
                        "mcp_info": mcp_info,
                        "graph": {
                            "graph_detect": detected,
                            "num_chains": num_chains,
                            "raw_response": outcome.text(),
                        },
                    })))
                }
            })
            .await?;
        }

        Command::SubChains {
            input_file,
            output_file,
            min_length,
            max_length,
        } => {
            let inputs = read_values(input_file)?;
            let mut writer = JsonlWriter::truncate(output_file)?;
            let mut report = SubChainReport::default();
            for record in &inputs {
                let detected: Vec<Vec<String>> = record
                    .pointer("/graph/graph_detect")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|c| {
                                c.get("tool_graph_detect_chain")
                                    .and_then(|chain| serde_json::from_value(chain.clone()).ok())
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let graph = ToolGraph::from_chains(detected.iter().map(Vec::as_slice));
                let sub_chains = graph.enumerate_sub_chains(*min_length, *max_length);
                report.add_record(&sub_chains);

                let mut out = record.clone();
                if let Some(graph_obj) = out
                    .pointer_mut("/graph")
                    .and_then(Value::as_object_mut)
                {
                    graph_obj.insert("sub_chains".to_owned(), serde_json::to_value(&sub_chains)?);
                }
                writer.write(&out)?;
            }
            info!(
                records = report.records,
                total = report.total,
                per_length = ?report.per_length,
                "sub-chain extraction done",
            );
        }

        Command::VerifyChains {
            io,
            n_samples,
            back_translation_models,
        } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let split: Vec<Value> = inputs.iter().flat_map(split_sub_chains).collect();
            info!(records = inputs.len(), sub_chains = split.len(), "split into sub-chain records");

            let mut operators = vec![Operator::VoteVerify {
                n_samples: *n_samples,
            }];
            if !back_translation_models.is_empty() {
                operators.push(Operator::BackTranslation {
                    models: back_translation_models.clone(),
                });
            }

            let keyer = sub_chain_keyer();
            let opts = stage_opts(io);
            let (runtime, client, cfg, operators) = (&runtime, &client, &cfg, &operators);
            run_stage(split, &keyer, &io.output_file, &opts, |mut value| async move {
                ChainVerifier::new(runtime, client)
                    .run_operators(&mut value, operators, cfg)
                    .await?;
                Ok(StageOutcome::Emit(value))
            })
            .await?;
        }

        Command::GenQueries {
            io,
            n_samples,
            unverified,
        } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs: Vec<Value> = read_values(&io.input_file)?
                .into_iter()
                .filter(|r| *unverified || synthforge::chainops::chain_accepted(r))
                .collect();
            let keyer = sub_chain_keyer();
            let opts = stage_opts(io);
            let n_samples = (*n_samples).max(1);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| {
                async move {
                    let mcp_info = serde_json::from_value(
                        value.get("mcp_info").cloned().unwrap_or(Value::Null),
                    )
                    .unwrap_or_default();
                    let sub_chain: Vec<String> = value
                        .pointer("/chain_info/sub_chain")
                        .and_then(|c| serde_json::from_value(c.clone()).ok())
                        .unwrap_or_default();
                    let prompt = build_gen_prompt(runtime, &mcp_info, &sub_chain)?;

                    let mut records = Vec::new();
                    for _ in 0..n_samples {
                        let outcome = client.chat(&[ChatMessage::user(&prompt)], cfg).await?;
                        if let Some(query) = parse_generated_query(outcome.text()) {
                            records.push(query_record(&value, &query));
                        }
                    }
                    if records.is_empty() {
                        Ok(StageOutcome::Drop)
                    } else {
                        Ok(StageOutcome::EmitAll(records))
                    }
                }
            })
            .await?;
        }

        Command::Augment {
            io,
            mode,
            variations_count,
            persona_file,
        } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let mode = AugmentMode::parse(mode)
                .ok_or_else(|| Error::config(format!("unsupported augmentation mode '{mode}'")))?;
            let personas = match persona_file {
                Some(path) => load_personas(path)?,
                None => builtin_personas(),
            };
            let inputs = read_values(&io.input_file)?;
            let keyer = generated_question_keyer();
            let opts = stage_opts(io);
            let variations_count = *variations_count;
            let (runtime, client, cfg, personas) = (&runtime, &client, &cfg, &personas);
            run_stage(inputs, &keyer, &io.output_file, &opts, |value| {
                async move {
                    let question = value
                        .pointer("/query_info/generated_question")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let target_tools: Vec<String> = value
                        .pointer("/query_info/target_tools")
                        .and_then(|t| serde_json::from_value(t.clone()).ok())
                        .unwrap_or_default();
                    if question.is_empty() || target_tools.is_empty() {
                        return Ok(StageOutcome::Drop);
                    }
                    let mcp_info = serde_json::from_value(
                        value.get("mcp_info").cloned().unwrap_or(Value::Null),
                    )
                    .unwrap_or_default();
                    let descriptions = tool_descriptions(&mcp_info, &target_tools);
                    let persona = (mode == AugmentMode::AddUg)
                        .then(|| sample_persona(personas))
                        .flatten();
                    let prompt = build_augment_prompt(
                        runtime,
                        mode,
                        &question,
                        &target_tools,
                        &descriptions,
                        variations_count,
                        persona,
                    )?;
                    let outcome = client.chat(&[ChatMessage::user(prompt)], cfg).await?;
                    match parse_augmentation_response(outcome.text(), mode) {
                        Some(variations) => Ok(StageOutcome::EmitAll(augmentation_records(
                            &value, mode, &variations,
                        ))),
                        None => Ok(StageOutcome::Drop),
                    }
                }
            })
            .await?;
        }

        Command::ScoreQueries { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = generated_question_keyer();
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |mut value| {
                async move {
                    let question = value
                        .get("query_info")
                        .map(extract_query)
                        .unwrap_or_default();
                    let target_tools = value
                        .pointer("/query_info/target_tools")
                        .cloned()
                        .unwrap_or(Value::Null);
                    let prompt = runtime.prompts.render(
                        "query_score",
                        &[
                            (
                                "server_info",
                                &serde_json::to_string(
                                    &value.pointer("/mcp_info/base_info/group_info"),
                                )?,
                            ),
                            (
                                "tool_list",
                                &serde_json::to_string(
                                    &value.pointer("/mcp_info/base_info/tool_list"),
                                )?,
                            ),
                            ("target_tools", &serde_json::to_string(&target_tools)?),
                            ("question", &question),
                        ],
                    )?;
                    let outcome = client.chat(&[ChatMessage::user(prompt)], cfg).await?;
                    let Some(dimensions) = parse_quality_response(outcome.text()) else {
                        return Ok(StageOutcome::Drop);
                    };
                    if let Some(query_info) = value
                        .pointer_mut("/query_info")
                        .and_then(Value::as_object_mut)
                    {
                        query_info
                            .insert("query_score_info".to_owned(), quality_score_info(&dimensions));
                    }
                    Ok(StageOutcome::Emit(value))
                }
            })
            .await?;
        }

        Command::Interact {
            io,
            max_workers,
            timeout,
            system_prompt,
            smithery_api_key,
            smithery_profile,
        } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let opts = RunnerOptions {
                max_workers: *max_workers,
                timeout_secs: *timeout,
                max_steps: 10,
                system_prompt: (!system_prompt.is_empty()).then(|| system_prompt.clone()),
                smithery_api_key: smithery_api_key.clone(),
                smithery_profile: smithery_profile.clone(),
            };
            let runner = AgentRunner::new(&runtime, &client, &cfg, opts);

            // Tear MCP sessions down on interrupt; sessions abort on drop,
            // so exiting the process is enough once the writer flushed.
            tokio::spawn(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; shutting down");
                    std::process::exit(130);
                }
            });

            runner.run_all(inputs, &io.output_file).await?;
        }

        Command::Reward { io } => {
            let runtime = build_runtime(&cli)?;
            let cfg = runtime.configs.get(&io.model_name)?.clone();
            let inputs = read_values(&io.input_file)?;
            let keyer = generated_question_keyer();
            let opts = stage_opts(io);
            let (runtime, client, cfg) = (&runtime, &client, &cfg);
            run_stage(inputs, &keyer, &io.output_file, &opts, |mut value| async move {
                RewardScorer::new(runtime, client, cfg)
                    .score_record(&mut value)
                    .await?;
                Ok(StageOutcome::Emit(value))
            })
            .await?;
        }
    }
    Ok(())
}

fn stage_opts(io: &IoArgs) -> StageOptions {
    StageOptions {
        concurrency: io.concurrency,
        append: true,
    }
}

fn processed_path(path: &std::path::Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("jsonl");
    path.with_file_name(format!("{stem}_processed.{ext}"))
}

fn group_id_keyer() -> synthforge::stage::Keyer {
    std::sync::Arc::new(|value| {
        value
            .pointer("/mcp_info/base_info/group_info/group_id")
            .or_else(|| value.pointer("/base_info/group_info/group_id"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    })
}

fn sub_chain_keyer() -> synthforge::stage::Keyer {
    std::sync::Arc::new(|value| {
        let group = value
            .pointer("/mcp_info/base_info/group_info/group_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        value
            .pointer("/chain_info/sub_chain")
            .map(|chain| format!("{group}::{chain}"))
    })
}

fn generated_question_keyer() -> synthforge::stage::Keyer {
    std::sync::Arc::new(|value| {
        value
            .get("query_info")
            .map(extract_query)
            .filter(|q| !q.is_empty())
    })
}
