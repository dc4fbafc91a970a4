//! Hive - 命令行入口
//!
//! 逐行读取标准输入：以 / 开头的是本地命令，其余作为一个用户回合交给编排引擎。
//! 过程事件由独立任务渲染到标准输出；回合进行中按 Ctrl-C 取消当前回合。

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use hive::agent::{create_runtime, Command, CommandOutcome, COMMAND_HELP};
use hive::config::load_config;
use hive::react::ReactEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let mut runtime = create_runtime(&cfg, None)
        .await
        .context("Failed to create agent runtime")?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ReactEvent>();
    let renderer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            render(&event);
        }
    });

    println!("hive ready ({}). Commands: {}", cfg.llm.model, COMMAND_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        let outcome = runtime.handle(command, Some(&event_tx), &cancel).await;
        watcher.abort();

        match outcome {
            // 回复内容已经由事件渲染
            Ok(CommandOutcome::Reply(_)) => {}
            Ok(CommandOutcome::Info(text)) => println!("{}", text),
            Ok(CommandOutcome::Quit) => break,
            Err(e) => tracing::debug!(error = %e, "turn ended with error"),
        }
    }

    drop(event_tx);
    let _ = renderer.await;
    Ok(())
}

fn render(event: &ReactEvent) {
    match event {
        ReactEvent::StepUpdate { step, max_steps } => println!("\n[step {}/{}]", step, max_steps),
        ReactEvent::Reasoning { text, new_step } => {
            if *new_step {
                print!("\n(thinking) ");
            }
            print!("{}", text);
        }
        ReactEvent::Content { text } => print!("{}", text),
        ReactEvent::ToolCall { tool, args } => println!("\n-> {} {}", tool, args),
        ReactEvent::Observation { tool, ok, preview, .. } => {
            println!("<- {} [{}] {}", tool, if *ok { "ok" } else { "failed" }, preview)
        }
        ReactEvent::System { text } => println!("\n[system] {}", text),
        ReactEvent::MessageDone => println!(),
        ReactEvent::Error { text } => println!("\n[error] {}", text),
    }
    let _ = std::io::stdout().flush();
}
