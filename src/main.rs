//! Hive 命令行对话
//!
//! 入口：加载配置、初始化日志、构建引擎并启动后台任务，然后逐行读取 stdin，每行跑完整一轮。
//! 输入 `exit` 或 Ctrl+C 退出，退出前停止后台任务。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::core::shutdown::{BackgroundCleanup, DatabaseCleanup};
use hive::core::{create_engine_builder, Engine, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use hive::managers::{ACTOR_INSIGHTS, RELEVANT_INTERACTIONS, SESSION_INSIGHTS};
use tokio::io::{AsyncBufReadExt, BufReader};

const SYSTEM_TEMPLATE: &str = "Your core configuration:
{{base_personality}}

Respond naturally as a participant in the conversation and keep replies concise.

# Conversation insights
{{session_insights}}

# User insights
{{actor_insights}}

# Relevant interactions
{{relevant_interactions}}
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let builder = create_engine_builder(config_path);
    let app = builder.config().app.clone();

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let root = shutdown.token();

    let engine = Arc::new(builder.build(&root).await.context("Failed to build engine")?);
    engine
        .start_background_processes()
        .await
        .context("Failed to start background processes")?;

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(BackgroundCleanup::new(Arc::clone(&engine)));
    coordinator.register(DatabaseCleanup::new(engine.stores().db.clone()));

    println!("Chat started. Type 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nYou: ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(input) = line else { break };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        }

        if let Err(e) = run_turn(&engine, &app.user_id, &app.session_id, input, root.child_token()).await {
            if e.is_recoverable() {
                tracing::error!(error = %e, "turn failed");
            } else {
                return Err(e).context("Unrecoverable engine error");
            }
        }
    }

    let failed = coordinator.run_cleanup().await;
    if !failed.is_empty() {
        tracing::warn!(?failed, "some cleanup tasks failed");
    }
    println!("\nChat ended. Goodbye!");
    Ok(())
}

async fn run_turn(
    engine: &Engine,
    user_id: &str,
    session_id: &str,
    input: &str,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), hive::HiveError> {
    let mut state = engine.new_state(user_id, session_id, input, cancel).await?;
    engine.process(&mut state).await?;

    let request = engine
        .prompt_builder()
        .system(SYSTEM_TEMPLATE)
        .build(&state);
    tracing::debug!(
        session_insights = state.fragments(SESSION_INSIGHTS).map_or(0, |f| f.len()),
        actor_insights = state.fragments(ACTOR_INSIGHTS).map_or(0, |f| f.len()),
        relevant = state.fragments(RELEVANT_INTERACTIONS).map_or(0, |f| f.len()),
        "context assembled"
    );

    print!("\nAssistant: ");
    std::io::stdout().flush().ok();
    let response = engine
        .generate_streaming_response(&mut state, &request, |chunk| {
            print!("{chunk}");
            std::io::stdout().flush().ok();
        })
        .await?;
    println!();

    let report = engine.post_process(response, &mut state).await?;
    for warning in &report.warnings {
        tracing::warn!(error = %warning, "post-process warning");
    }
    Ok(())
}
