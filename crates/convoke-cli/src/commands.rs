// ABOUTME: Implementations of the convoke subcommands: serve, orchestrate and agent.
// ABOUTME: Each long-running command stops cleanly on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use convoke_connect::{Connector, HandlerError, TaskContext, TcpTransport};
use convoke_orchestrator::Orchestrator;
use convoke_serve::shutdown_signal;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;

/// Agent type the orchestrator registers as.
pub const ORCHESTRATOR_TYPE: &str = "orchestrator";

/// Run the router until interrupted.
pub async fn serve(config: &Config, listen: Option<String>) -> Result<()> {
    let mut router = config.router.to_router_config();
    if let Some(listen) = listen {
        router.listen_addr = listen;
    }
    convoke_serve::run(router).await
}

fn tcp_connector(config: &Config, router_addr: &str, connector: convoke_connect::ConnectorConfig) -> Connector {
    let transport = TcpTransport::new(router_addr)
        .with_connect_timeout(Duration::from_millis(config.connector.connect_timeout_ms));
    Connector::new(connector, Arc::new(transport))
}

/// Run `connector` until it gives up or a shutdown signal arrives.
async fn run_until_signal(connector: &Connector) -> Result<()> {
    let runner = connector.clone();
    let mut task = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        joined = &mut task => {
            joined.context("connector task failed")?.context("connector stopped")?;
        }
        _ = shutdown_signal() => {
            connector.shutdown().await;
            task.await
                .context("connector task failed")?
                .context("connector stopped")?;
        }
    }
    Ok(())
}

/// Run the workflow orchestrator as an agent of the router at `router_addr`.
pub async fn orchestrate(config: &Config, router_addr: &str, agent_id: Option<String>) -> Result<()> {
    let orchestrator_config = config.orchestrator.to_orchestrator_config()?;
    let agent_id = agent_id.unwrap_or_else(|| config.orchestrator.agent_id.clone());
    let connector_config = config.connector.to_connector_config(
        &agent_id,
        ORCHESTRATOR_TYPE,
        convoke_orchestrator::capabilities(),
    );
    let connector = tcp_connector(config, router_addr, connector_config);

    let orchestrator = Orchestrator::new(orchestrator_config, Arc::new(connector.clone()));
    orchestrator.register_handlers(&connector);

    let runner = orchestrator.clone();
    let queue = tokio::spawn(async move { runner.process_queue().await });

    let mut events = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(state) => match &state.error {
                    Some(failure) => warn!(
                        context_id = %state.context_id,
                        stage = %failure.stage,
                        error = %failure.message,
                        "Workflow finished as {}", state.stage
                    ),
                    None => info!(context_id = %state.context_id, "Workflow finished as {}", state.stage),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "Workflow events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(agent_id = %agent_id, router = %router_addr, "Starting orchestrator");
    let result = run_until_signal(&connector).await;

    orchestrator.shutdown().await;
    if let Ok(Err(e)) = queue.await {
        warn!(error = %e, "Workflow queue ended with an error");
    }
    reporter.abort();
    result
}

async fn echo(ctx: TaskContext, payload: Value) -> Result<Value, HandlerError> {
    Ok(json!({
        "agent_id": ctx.agent_id,
        "action": ctx.action,
        "echo": payload,
    }))
}

/// Run a stand-in agent that echoes every task back for the given capabilities.
pub async fn agent(
    config: &Config,
    router_addr: &str,
    agent_id: &str,
    agent_type: &str,
    capabilities: Vec<String>,
) -> Result<()> {
    if capabilities.is_empty() {
        bail!("an agent needs at least one --capability");
    }
    let connector_config =
        config
            .connector
            .to_connector_config(agent_id, agent_type, capabilities.clone());
    let connector = tcp_connector(config, router_addr, connector_config);
    for action in &capabilities {
        connector.register_handler(action.clone(), echo);
    }

    info!(agent_id = %agent_id, agent_type = %agent_type, router = %router_addr, "Starting echo agent");
    run_until_signal(&connector).await
}
