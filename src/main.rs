use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

use model_arena::config::OrchestratorConfig;
use model_arena::logger::init_logger;
use model_arena::models::{ChatRequest, ChatSession, Message, ModelConfig, StreamChunk};
use model_arena::orchestrator::{init_status_registry, StreamCallback};

const USAGE: &str = "usage: model_arena \"<prompt>\" [model ids...]";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

/// 未指定模型时，每个已配置凭证的供应商取目录中的第一个模型
fn default_models(catalog: &[ModelConfig], configured: &[model_arena::Provider]) -> Vec<String> {
    let mut seen = HashSet::new();
    catalog
        .iter()
        .filter(|m| configured.contains(&m.provider) && seen.insert(m.provider))
        .map(|m| m.id.clone())
        .collect()
}

/// 按模型缓冲增量，只输出完整的行；终止块时输出剩余部分
#[derive(Default)]
struct LinePrinter {
    /// (model_id, 是否为推理内容) -> 未成行的文本
    pending: Mutex<HashMap<(String, bool), String>>,
}

impl LinePrinter {
    fn print(&self, model_id: &str, chunk: &StreamChunk) {
        let mut out = std::io::stdout().lock();
        let _ = self.write(&mut out, model_id, chunk);
        let _ = out.flush();
    }

    fn write(&self, out: &mut impl Write, model_id: &str, chunk: &StreamChunk) -> std::io::Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reasoning) = chunk.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            Self::feed(out, &mut pending, model_id, true, reasoning)?;
        }
        if !chunk.content.is_empty() {
            // 正文开始后，推理的残行不会再继续
            Self::flush(out, &mut pending, model_id, true)?;
            Self::feed(out, &mut pending, model_id, false, &chunk.content)?;
        }
        if chunk.finished {
            Self::flush(out, &mut pending, model_id, true)?;
            Self::flush(out, &mut pending, model_id, false)?;
            if let Some(error) = &chunk.error {
                writeln!(out, "[{}] !! {}", model_id, error)?;
            }
        }
        Ok(())
    }

    fn feed(
        out: &mut impl Write,
        pending: &mut HashMap<(String, bool), String>,
        model_id: &str,
        thinking: bool,
        delta: &str,
    ) -> std::io::Result<()> {
        let buffer = pending.entry((model_id.to_string(), thinking)).or_default();
        buffer.push_str(delta);
        while let Some(end) = buffer.find('\n') {
            let line: String = buffer.drain(..=end).collect();
            Self::line(out, model_id, thinking, line.trim_end_matches(['\r', '\n']))?;
        }
        Ok(())
    }

    fn flush(
        out: &mut impl Write,
        pending: &mut HashMap<(String, bool), String>,
        model_id: &str,
        thinking: bool,
    ) -> std::io::Result<()> {
        match pending.remove(&(model_id.to_string(), thinking)) {
            Some(rest) if !rest.is_empty() => Self::line(out, model_id, thinking, &rest),
            _ => Ok(()),
        }
    }

    fn line(out: &mut impl Write, model_id: &str, thinking: bool, text: &str) -> std::io::Result<()> {
        if thinking {
            writeln!(out, "[{}] (thinking) {}", model_id, text)
        } else {
            writeln!(out, "[{}] {}", model_id, text)
        }
    }
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let prompt = args.next().context(USAGE)?;
    let mut model_ids: Vec<String> = args.collect();

    //*
    //* Load config
    //*
    let config = match std::env::var("MODEL_ARENA_CONFIG") {
        Ok(path) => OrchestratorConfig::from_json_file(path)?,
        Err(_) => OrchestratorConfig::default(),
    }
    .with_env_keys();

    //*
    //* Initialize logger and status registry
    //*
    let _guard = init_logger(config.log.clone())?;
    init_status_registry();
    info!("Logger initialized successfully");

    let dispatcher = config.build_dispatcher().await?;
    if model_ids.is_empty() {
        model_ids = default_models(&config.model_catalog(), &dispatcher.credentials().providers());
    }
    if model_ids.is_empty() {
        bail!("No models selected and no API keys configured\n{}", USAGE);
    }

    //*
    //* Dispatch
    //*
    let session = Arc::new(ChatSession::new());
    session.push_message(Message::user(prompt));
    let request = ChatRequest::new(session.messages());

    let printer = Arc::new(LinePrinter::default());
    let callback: StreamCallback = Arc::new(move |model_id: &str, chunk: &StreamChunk| printer.print(model_id, chunk));
    let handle = dispatcher
        .dispatch(&session, request, model_ids, Some(callback))
        .await?;

    let cancel = handle.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let results = handle.wait().await;
    ctrl_c.abort();

    //*
    //* Summary
    //*
    println!();
    let mut ids: Vec<&String> = results.keys().collect();
    ids.sort();
    for id in ids {
        let response = &results[id];
        let outcome = match (&response.error, response.cancelled) {
            (Some(error), _) => format!("error: {}", error),
            (None, true) => "cancelled".to_string(),
            (None, false) => "ok".to_string(),
        };
        println!(
            "{:<28} {:<10} tokens={:<6} cost={:<10.6} time={}ms chars={}",
            id,
            outcome,
            response.tokens.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
            response.cost.unwrap_or(0.0),
            response.response_time_ms.unwrap_or(0),
            response.content.chars().count()
        );
    }

    let totals = session.totals();
    println!("\nsession: tokens={} cost={:.6}", totals.tokens, totals.cost);

    let mut status: Vec<_> = dispatcher.get_service_status().into_iter().collect();
    status.sort();
    for (provider, healthy) in status {
        println!("service {:<11} {}", provider, if healthy { "healthy" } else { "unhealthy" });
    }
    let mut queues: Vec<_> = dispatcher.get_queue_status().into_iter().collect();
    queues.sort_by_key(|(provider, _)| *provider);
    for (provider, queue) in queues {
        println!(
            "queue   {:<11} active={} queued={} capacity={}",
            provider, queue.active, queue.queued, queue.capacity
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_arena::llm_api::ResponseError;

    fn render(printer: &LinePrinter, chunks: &[(&str, StreamChunk)]) -> String {
        let mut out = Vec::new();
        for (model_id, chunk) in chunks {
            printer.write(&mut out, model_id, chunk).unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_deltas_are_joined_into_lines() {
        let printer = LinePrinter::default();
        let output = render(
            &printer,
            &[
                ("m1", StreamChunk::content("Hel")),
                ("m2", StreamChunk::content("Bon")),
                ("m1", StreamChunk::content("lo\nwor")),
                ("m2", StreamChunk::content("jour")),
                ("m1", StreamChunk::content("ld")),
                ("m1", StreamChunk::finished(Some(3), None)),
                ("m2", StreamChunk::finished(None, None)),
            ],
        );
        assert_eq!(output, "[m1] Hello\n[m1] world\n[m2] Bonjour\n");
    }

    #[test]
    fn test_reasoning_flushed_before_answer() {
        let printer = LinePrinter::default();
        let output = render(
            &printer,
            &[
                ("r1", StreamChunk::reasoning("let me ")),
                ("r1", StreamChunk::reasoning("think")),
                ("r1", StreamChunk::content("42")),
                ("r1", StreamChunk::finished(None, None)),
            ],
        );
        assert_eq!(output, "[r1] (thinking) let me think\n[r1] 42\n");
    }

    #[test]
    fn test_terminal_content_and_error() {
        let printer = LinePrinter::default();
        let mut whole = StreamChunk::finished(Some(5), None);
        whole.content = "full answer".to_string();
        let output = render(
            &printer,
            &[
                ("m1", whole),
                ("m2", StreamChunk::content("part")),
                ("m2", StreamChunk::failed(ResponseError::protocol("boom"))),
            ],
        );
        assert!(output.starts_with("[m1] full answer\n[m2] part\n[m2] !! "));
        assert!(output.contains("boom"));
    }
}
