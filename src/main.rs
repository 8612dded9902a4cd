//! Bee RAG 命令行入口
//!
//! 加载配置，回答命令行给出的一个问题，把每一帧以 JSON 行输出到 stdout。
//! 用法：bee-rag [--config <path>] [--session <id>] <问题...>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_rag::stream::{CancelRegistry, Frame};
use bee_rag::{build_chat_service, load_config, observability, ChatRequest};
use tokio::sync::mpsc;

struct CliArgs {
    config: Option<PathBuf>,
    session_id: String,
    query: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config = None;
    let mut session_id = "cli".to_string();
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--session" => session_id = args.next().context("--session needs an id")?,
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        anyhow::bail!("usage: bee-rag [--config <path>] [--session <id>] <question...>");
    }
    Ok(CliArgs {
        config,
        session_id,
        query: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config).context("Failed to load config")?;
    let service = build_chat_service(&cfg, Arc::new(CancelRegistry::new()))
        .await
        .context("Failed to build chat service")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let printer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to encode frame"),
            }
        }
    });

    let request = ChatRequest {
        query: args.query,
        session_id: args.session_id,
        user_id: "cli".to_string(),
        custom_message_id: None,
    };
    let outcome = service.handle("cli", request, &tx).await;
    drop(tx);
    printer.await.context("Frame printer failed")?;

    tracing::info!(status = outcome.status.as_str(), chars = outcome.text.chars().count(), "done");
    Ok(())
}
