use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use graphrag::cache::EmbeddingCache;
use graphrag::config::api_key_from_env;
use graphrag::connectors::{DataConnector, DirectoryConnector};
use graphrag::db::Db;
use graphrag::embeddings::OpenAIEmbedder;
use graphrag::graph::SqliteGraphRepository;
use graphrag::indexing::{IndexingPhase, IndexingStatus};
use graphrag::llm::OpenAIGenerator;
use graphrag::query::{GlobalQueryEvent, QueryOptions};
use graphrag::{Config, GraphRag, GraphRagSettings};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "graphrag", version, about = "Personal knowledge-graph retrieval")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, extract and summarize from the configured sources
    Index {
        /// Ignore sync state and re-fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Hybrid retrieval over entities and communities
    Query {
        text: String,
        /// Cypher query contributing exact matches
        #[arg(long)]
        cypher: Option<String>,
        /// Restrict embedding matches to one entity type
        #[arg(long = "type")]
        entity_type: Option<String>,
        /// Generate an answer from the retrieved context
        #[arg(long)]
        answer: bool,
        /// Print the answer as it is generated (implies --answer)
        #[arg(long)]
        stream: bool,
    },
    /// Map-reduce answer over community summaries
    Global {
        text: String,
        /// Community level; chosen from the question when omitted
        #[arg(long)]
        level: Option<u32>,
        #[arg(long)]
        stream: bool,
    },
    /// Run a Cypher query and print the matches as JSON
    Cypher { query: String },
    /// Print graph statistics as JSON
    Stats,
    /// Delete all graph data and sync state
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &config.graphrag.log_level))
        .init();

    let rag = build_engine(&config).await?;

    match cli.command {
        Command::Index { full } => run_index(&rag, full).await,
        Command::Query {
            text,
            cypher,
            entity_type,
            answer,
            stream,
        } => {
            let mut options = QueryOptions::default();
            if let Some(cypher) = cypher {
                options = options.with_cypher(cypher);
            }
            if let Some(entity_type) = entity_type {
                options = options.with_entity_type(entity_type);
            }
            run_query(&rag, &text, &options, answer, stream).await
        }
        Command::Global { text, level, stream } => run_global(&rag, &text, level, stream).await,
        Command::Cypher { query } => {
            let result = rag.cypher_query(&query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Stats => {
            let stats = rag.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Clear => {
            rag.clear_graph().await?;
            println!("Graph cleared");
            Ok(())
        }
    }
}

async fn build_engine(config: &Config) -> Result<GraphRag> {
    let repository = SqliteGraphRepository::new(Db::new(config.db_path()));
    repository.initialize().await?;

    let llm = &config.llm;
    let generator = OpenAIGenerator::new(
        api_key_from_env(&llm.api_key_env)?,
        llm.model.clone(),
        Duration::from_secs(llm.timeout_secs),
    )?
    .with_base_url(llm.base_url.clone())
    .with_temperature(llm.temperature);

    // repeated query texts skip the API
    let emb = &config.embeddings;
    let cache = (emb.cache_capacity > 0).then(|| Arc::new(EmbeddingCache::new(emb.cache_capacity)));
    let embedder = OpenAIEmbedder::new(api_key_from_env(&emb.api_key_env)?, emb.model.clone(), emb.batch_size)?
        .with_base_url(emb.base_url.clone())
        .with_dimensions(emb.dimensions)
        .with_cache(cache);

    let mut connectors: Vec<Arc<dyn DataConnector>> = Vec::new();
    if let Some(root) = &config.connectors.documents_root {
        let state_path = config
            .connectors
            .sync_state_path
            .clone()
            .unwrap_or_else(|| config.db_path().with_extension("sync.json"));
        connectors.push(Arc::new(DirectoryConnector::new(root).with_state_file(state_path)?));
    } else {
        log::warn!("No documents_root configured; indexing has no sources");
    }

    Ok(GraphRag::new(
        Arc::new(repository),
        Arc::new(generator),
        Arc::new(embedder),
        connectors,
        GraphRagSettings::from(config),
    ))
}

async fn run_index(rag: &GraphRag, full: bool) -> Result<()> {
    rag.start_indexing(full).await?;

    let mut progress = rag.progress_stream();
    let mut phase = IndexingPhase::Idle;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                log::warn!("Interrupted, cancelling indexing");
                if let Err(e) = rag.cancel_indexing() {
                    log::warn!("{}", e);
                }
            }
            next = progress.next() => {
                let Some(snapshot) = next else { break };
                if snapshot.current_phase != phase {
                    phase = snapshot.current_phase;
                    log::info!("{} ({}/{} items)", phase, snapshot.processed_items, snapshot.total_items);
                }
                if !snapshot.status.is_active() {
                    break;
                }
            }
        }
    }

    let done = rag.wait_for_indexing().await;
    println!(
        "{}: {}/{} items ({} failed), {} entities, {} relationships, {} communities ({} summarized)",
        done.status,
        done.processed_items,
        done.total_items,
        done.failed_items,
        done.entities_stored,
        done.relationships_stored,
        done.communities_detected,
        done.communities_summarized
    );
    for skipped in &done.skipped_connectors {
        println!("skipped source: {}", skipped);
    }
    if done.status == IndexingStatus::Failed {
        bail!("Indexing failed: {}", done.error.unwrap_or_default());
    }
    Ok(())
}

async fn run_query(rag: &GraphRag, text: &str, options: &QueryOptions, answer: bool, stream: bool) -> Result<()> {
    if stream {
        let mut streaming = rag
            .query_with_answer_streaming(text, options, CancellationToken::new())
            .await?;
        print_entities(&streaming.result.entities);
        let mut stdout = std::io::stdout();
        while let Some(token) = streaming.tokens.next().await {
            write!(stdout, "{}", token?)?;
            stdout.flush()?;
        }
        println!();
        return Ok(());
    }

    let result = if answer {
        rag.query_with_answer(text, options).await?
    } else {
        rag.query(text, options).await?
    };
    print_entities(&result.entities);
    match result.answer {
        Some(answer) => println!("\n{}", answer),
        None => println!("\n{}", result.context),
    }
    log::info!(
        "{} cypher, {} embedding, {} communities searched in {}ms",
        result.metadata.cypher_matches,
        result.metadata.embedding_matches,
        result.metadata.communities_searched,
        result.metadata.execution_time_ms
    );
    Ok(())
}

fn print_entities(entities: &[graphrag::query::ScoredQueryEntity]) {
    for (i, hit) in entities.iter().enumerate() {
        println!("{:>2}. {:.3}  {} ({})", i + 1, hit.score, hit.entity.name, hit.entity.entity_type);
    }
}

async fn run_global(rag: &GraphRag, text: &str, level: Option<u32>, stream: bool) -> Result<()> {
    if !stream {
        let result = match level {
            Some(level) => rag.global_query(text, level).await?,
            None => rag.global_query_auto(text).await?,
        };
        println!("{}", result.answer);
        log::info!(
            "level {}: {} communities, {} useful answers in {}ms",
            result.community_level,
            result.communities_processed,
            result.useful_answers,
            result.total_duration_ms
        );
        return Ok(());
    }

    let mut events = rag.global_query_streaming(text, level, CancellationToken::new());
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            GlobalQueryEvent::Started {
                community_level,
                total_communities,
            } => log::info!("level {}: {} communities", community_level, total_communities),
            GlobalQueryEvent::ProcessingCommunity { current, total, .. } => log::info!("community {}/{}", current, total),
            GlobalQueryEvent::Reducing { useful_answers } => log::info!("reducing {} answers", useful_answers),
            GlobalQueryEvent::Token { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            GlobalQueryEvent::Completed { result } => {
                // no tokens are streamed when nothing survived the map phase
                if result.useful_answers == 0 {
                    write!(stdout, "{}", result.answer)?;
                }
                println!();
            }
            GlobalQueryEvent::Cancelled { processed } => bail!("Cancelled after {} communities", processed),
            GlobalQueryEvent::Failed { message } => bail!("Global query failed: {}", message),
        }
    }
    Ok(())
}
