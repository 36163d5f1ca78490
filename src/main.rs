use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use riptide::config::{Cli, Config};
use riptide::error::RaceError;
use riptide::metrics::{InMemoryPreviewCache, LatencyTracker, PreviewCache};
use riptide::race::{self, Candidate};
use riptide::router::Router;
use riptide::router_state::CompositeRouterStateBackend;
#[cfg(feature = "external-router-state")]
use riptide::router_state::RedisRouterStateBackend;
use riptide::streaming::{StreamEvent, StreamingAgent};
use riptide::types::Strategy;

fn fake_candidates() -> (Vec<Candidate>, Arc<dyn StreamingAgent>) {
    use riptide::streaming::ScriptedAgent;

    let candidates = vec![
        Candidate {
            name: "fake-a".to_string(),
            agent: Arc::new(ScriptedAgent::new(
                "fake-a",
                vec![StreamEvent::TextDelta("a quick, terse answer to your question.".to_string())],
            )),
        },
        Candidate {
            name: "fake-b".to_string(),
            agent: Arc::new(ScriptedAgent::new(
                "fake-b",
                vec![StreamEvent::TextDelta("a longer, more thorough answer covering more ground.".to_string())],
            )),
        },
    ];
    let judge: Arc<dyn StreamingAgent> = Arc::new(ScriptedAgent::new(
        "fake-judge",
        vec![StreamEvent::TextDelta(
            "{\"winner_index\": 1, \"scores\": [{\"index\": 0, \"relevance\": 0.5, \"coverage\": 0.4, \"faithfulness\": 0.5, \"overall\": 0.5}, {\"index\": 1, \"relevance\": 0.8, \"coverage\": 0.9, \"faithfulness\": 0.8, \"overall\": 0.85}]}"
                .to_string(),
        )],
    ));
    (candidates, judge)
}

async fn run(cli: Cli) -> Result<(), RaceError> {
    let config = Config::from_env(&cli)?;

    let (candidates, judge_agent): (Vec<Candidate>, Arc<dyn StreamingAgent>) = if cli.fake {
        fake_candidates()
    } else {
        let names: Vec<String> = if cli.candidates.is_empty() {
            config.agents.keys().cloned().collect()
        } else {
            cli.candidates.clone()
        };
        let mut candidates = Vec::new();
        for name in &names {
            let Some(agent) = config.agents.get(name) else {
                return Err(RaceError::Config(format!("candidate {name} has no configured API key")));
            };
            candidates.push(Candidate { name: name.clone(), agent: agent.clone() as Arc<dyn StreamingAgent> });
        }
        let judge_agent = config
            .agents
            .get(&cli.judge_model)
            .ok_or_else(|| RaceError::Config(format!("judge model {} has no configured API key", cli.judge_model)))?
            .clone() as Arc<dyn StreamingAgent>;
        (candidates, judge_agent)
    };

    // Dimension actually follows whether an embedding provider was wired up,
    // not merely the requested `BANDIT_FEATURES` mode — a missing provider
    // (e.g. no OPENAI_API_KEY) falls back to length-only features at d=3.
    let d = match &config.embedding_provider {
        Some(provider) => riptide::features::length_features("").len() + provider.dim(),
        None => riptide::features::length_features("").len(),
    };

    let router = if config.tuning.strategy == Strategy::Bandit {
        let state_path = config
            .tuning
            .router_state_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from(".router_state.json"));

        #[cfg(feature = "external-router-state")]
        let backend: Box<dyn riptide::router_state::RouterStateBackend> = match &config.redis_url {
            Some(url) => {
                let key = config.router_state_kv_key(d);
                match RedisRouterStateBackend::new(url, key) {
                    Ok(external) => Box::new(CompositeRouterStateBackend::with_external(state_path, external)),
                    Err(e) => {
                        tracing::warn!("failed to connect to redis ({e}), falling back to local-only router state");
                        Box::new(CompositeRouterStateBackend::local_only(state_path))
                    }
                }
            }
            None => Box::new(CompositeRouterStateBackend::local_only(state_path)),
        };
        #[cfg(not(feature = "external-router-state"))]
        let backend: Box<dyn riptide::router_state::RouterStateBackend> =
            Box::new(CompositeRouterStateBackend::local_only(state_path));

        Some(Router::new(d, config.tuning.bandit_alpha, config.tuning.bandit_lambda, Some(backend)).await)
    } else {
        None
    };

    let latency_tracker = LatencyTracker::load(config.router_metrics_path.clone()).await;

    let preview_cache: Option<Arc<dyn PreviewCache>> = {
        #[cfg(feature = "external-router-state")]
        {
            match &config.redis_url {
                Some(url) => match riptide::metrics::RedisPreviewCache::new(url) {
                    Ok(cache) => Some(Arc::new(cache) as Arc<dyn PreviewCache>),
                    Err(e) => {
                        tracing::warn!("failed to connect to redis for preview cache ({e}), using in-memory cache");
                        Some(Arc::new(InMemoryPreviewCache::new()) as Arc<dyn PreviewCache>)
                    }
                },
                None => Some(Arc::new(InMemoryPreviewCache::new()) as Arc<dyn PreviewCache>),
            }
        }
        #[cfg(not(feature = "external-router-state"))]
        {
            Some(Arc::new(InMemoryPreviewCache::new()) as Arc<dyn PreviewCache>)
        }
    };

    let result = race::race(
        &cli.query,
        judge_agent.as_ref(),
        &candidates,
        &config.tuning,
        router.as_ref(),
        &latency_tracker,
        preview_cache,
        config.price_table.as_ref(),
        config.embedding_provider.as_ref(),
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&result).map_err(|e| RaceError::Other(e.to_string()))?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("riptide starting");

    let cli = Cli::parse();
    let outcome = run(cli).await;

    tracing::info!("riptide shutting down");

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
