//! Process lifecycle against a scripted stand-in for the game server.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Fixture, LEAVES_CHILD, STUBBORN, WELL_BEHAVED, install_server_jar, wait_for_console, wait_until};
use craft_agent::{Error, InstanceOrchestrator, InstanceRef, InstanceStack};
use craft_process::ServerState;
use futures_util::StreamExt;

async fn stack_for(cfg: craft_agent::AgentConfig) -> (InstanceOrchestrator, Arc<InstanceStack>) {
    let orch = InstanceOrchestrator::new(cfg).await.unwrap();
    let stack = orch.resolve(&InstanceRef::Current).await.unwrap();
    install_server_jar(&stack.paths().server_dir());
    (orch, stack)
}

/// A script written moments ago can still be open for writing in a process
/// forked by a parallel test; exec then fails with ETXTBSY.
async fn start_with_retry(stack: &InstanceStack) {
    for _ in 0..20 {
        match stack.controller().start().await {
            Ok(()) => return,
            Err(Error::DownstreamUnavailable(_)) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("start failed: {e}"),
        }
    }
    panic!("server never started");
}

#[tokio::test]
async fn start_command_stop_round_trip() {
    let fx = Fixture::new(WELL_BEHAVED);
    let (orch, stack) = stack_for(fx.config()).await;
    let controller = stack.controller();

    start_with_retry(&stack).await;
    let status = controller.status().await;
    assert_eq!(status.state, ServerState::Running);
    assert!(status.is_running);
    assert!(status.pid.is_some());
    assert_eq!(status.version, "1.20.1");

    let again = controller.start().await.unwrap_err();
    assert_eq!(again.code(), "invalid_transition");

    assert!(std::fs::read_to_string(stack.paths().server_dir().join("eula.txt"))
        .unwrap()
        .contains("eula=true"));

    controller.send_command("say hi").await.unwrap();
    wait_for_console(stack.console(), "got: say hi").await;

    let empty = controller.send_command("   ").await.unwrap_err();
    assert_eq!(empty.code(), "invalid_argument");

    controller.stop().await.unwrap();
    assert_eq!(controller.state().await, ServerState::Stopped);
    assert!(controller.status().await.pid.is_none());

    let err = controller.stop().await.unwrap_err();
    assert_eq!(err.code(), "invalid_transition");
    let err = controller.send_command("say hi").await.unwrap_err();
    assert_eq!(err.code(), "invalid_transition");

    orch.shutdown().await;
}

#[tokio::test]
async fn restart_runs_a_new_process() {
    let fx = Fixture::new(WELL_BEHAVED);
    let (orch, stack) = stack_for(fx.config()).await;
    let controller = stack.controller();

    start_with_retry(&stack).await;
    let first = controller.status().await.pid.unwrap();

    controller.restart().await.unwrap();
    let second = controller.status().await.pid.unwrap();
    assert_ne!(first, second);
    assert!(controller.is_running().await);

    orch.shutdown().await;
    assert_eq!(controller.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn unexpected_exit_returns_to_stopped() {
    let fx = Fixture::new(WELL_BEHAVED);
    let (orch, stack) = stack_for(fx.config()).await;
    let controller = stack.controller().clone();

    start_with_retry(&stack).await;
    controller.send_command("crash").await.unwrap();

    wait_until(|| {
        let c = controller.clone();
        async move { c.state().await == ServerState::Stopped }
    })
    .await;
    let lines = wait_for_console(stack.console(), "exited unexpectedly").await;
    assert!(lines.iter().any(|l| l.contains("exit code 3")));

    // A crashed server can be started again.
    start_with_retry(&stack).await;
    orch.shutdown().await;
}

#[tokio::test]
async fn stubborn_server_is_killed_after_grace() {
    let fx = Fixture::new(STUBBORN);
    let mut cfg = fx.config();
    cfg.stop_grace = Duration::from_millis(500);
    let (orch, stack) = stack_for(cfg).await;
    let controller = stack.controller();

    start_with_retry(&stack).await;
    wait_for_console(stack.console(), "Done").await;

    let began = std::time::Instant::now();
    controller.stop().await.unwrap();
    assert!(began.elapsed() >= Duration::from_millis(500));
    assert_eq!(controller.state().await, ServerState::Stopped);

    orch.shutdown().await;
}

#[tokio::test]
async fn console_output_feeds_tick_rate() {
    let fx = Fixture::new(WELL_BEHAVED);
    let (orch, stack) = stack_for(fx.config()).await;

    start_with_retry(&stack).await;
    wait_for_console(stack.console(), "TPS from last 1m").await;
    let telemetry = stack.telemetry().clone();
    wait_until(|| {
        let t = telemetry.clone();
        async move { t.current_metrics().sample.tick_rate == 19.5 }
    })
    .await;

    orch.shutdown().await;
}

#[tokio::test]
async fn subscribers_after_stop_get_replay_only() {
    let fx = Fixture::new(WELL_BEHAVED);
    let (orch, stack) = stack_for(fx.config()).await;

    start_with_retry(&stack).await;
    stack.controller().stop().await.unwrap();
    wait_until(|| {
        let console = stack.console().clone();
        async move { !console.is_attached().await }
    })
    .await;

    let lines: Vec<String> = stack.console().subscribe().await.unwrap().collect().await;
    assert!(lines.iter().any(|l| l == "[craft-agent] start requested"));
    assert!(lines.iter().any(|l| l.contains("stop requested")));

    orch.shutdown().await;
}

#[tokio::test]
async fn stop_detaches_console_even_if_a_child_keeps_the_pipe() {
    let fx = Fixture::new(LEAVES_CHILD);
    let (orch, stack) = stack_for(fx.config()).await;

    start_with_retry(&stack).await;
    let pid = stack.controller().status().await.pid.unwrap();
    wait_for_console(stack.console(), "Done").await;

    stack.controller().stop().await.unwrap();
    assert_eq!(stack.controller().state().await, ServerState::Stopped);
    assert!(!stack.console().is_attached().await);

    let stream = stack.console().subscribe().await.unwrap();
    let lines: Vec<String> = tokio::time::timeout(Duration::from_secs(3), stream.collect())
        .await
        .expect("replay-only stream should end");
    assert!(lines.iter().any(|l| l.contains("stop requested")));

    // The server ran as its own group leader; clean up the stray sleep.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
    orch.shutdown().await;
}
