// ABOUTME: End-to-end workflow through a live router with one connector per stage agent.
// ABOUTME: Connections are in-memory links served by the router's own connection task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoke_connect::{
    Connector, ConnectorConfig, ConnectorError, HandlerError, RegistrationConfig, TaskContext,
    Transport,
};
use convoke_orchestrator::{capabilities, Orchestrator, OrchestratorConfig, Stage};
use convoke_proto::{Envelope, Link, MessageType};
use convoke_serve::{serve_link, Router, RouterConfig, RouterHandle};
use serde_json::{json, Value};

struct InMemory {
    router: RouterHandle,
}

#[async_trait]
impl Transport for InMemory {
    async fn connect(&self) -> Result<Link, ConnectorError> {
        let (ours, theirs) = Link::pair(64);
        tokio::spawn(serve_link(theirs, "in-memory".to_string(), self.router.clone()));
        Ok(ours)
    }

    fn describe(&self) -> String {
        "in-memory router".to_string()
    }
}

fn connector(router: &RouterHandle, agent_id: &str, agent_type: &str, caps: Vec<String>) -> Connector {
    let registration = RegistrationConfig::new(agent_id, agent_type).with_capabilities(caps);
    Connector::new(
        ConnectorConfig::new(registration),
        Arc::new(InMemory {
            router: router.clone(),
        }),
    )
}

async fn start(connector: &Connector) {
    let runner = connector.clone();
    tokio::spawn(async move { runner.run().await });
    tokio::time::timeout(Duration::from_secs(5), connector.wait_connected())
        .await
        .expect("connector did not register");
}

#[tokio::test]
async fn test_research_request_through_router() {
    let (router, _actor) = Router::spawn(RouterConfig::default());

    let stage_agents = OrchestratorConfig::default().stages;
    let mut agents = Vec::new();
    for (stage, target) in &stage_agents {
        let agent_id = format!("{}-1", target.agent_type);
        let agent = connector(&router, &agent_id, &target.agent_type, vec![target.action.clone()]);
        let stage = *stage;
        agent.register_handler(
            target.action.clone(),
            move |ctx: TaskContext, payload: Value| async move {
                if stage == Stage::LiteratureReview {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok::<Value, HandlerError>(json!({
                    "by": ctx.agent_id,
                    "seen": payload["previous"].as_object().map(|m| m.len()).unwrap_or(0),
                }))
            },
        );
        start(&agent).await;
        agents.push(agent);
    }

    let orchestrator_agent = connector(&router, "orchestrator-1", "orchestrator", capabilities());
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(orchestrator_agent.clone()),
    );
    orchestrator.register_handlers(&orchestrator_agent);
    let runner = orchestrator.clone();
    tokio::spawn(async move { runner.process_queue().await });
    start(&orchestrator_agent).await;
    let mut events = orchestrator.subscribe();

    let accepted = router
        .request(
            Envelope::task("orchestrator", "research_request", json!({"query": "X"})),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(accepted.kind, MessageType::TaskResult);
    let context_id = accepted.payload["context_id"].as_str().unwrap().to_string();

    let done = tokio::time::timeout(Duration::from_millis(500), events.recv())
        .await
        .expect("workflow did not finish within 500ms")
        .unwrap();
    assert_eq!(done.context_id, context_id);
    assert_eq!(done.stage, Stage::Complete);
    assert_eq!(
        done.outputs[&Stage::LiteratureReview],
        json!({"by": "literature-1", "seen": 2})
    );
    assert_eq!(
        done.outputs[&Stage::Synthesis],
        json!({"by": "synthesizer-1", "seen": 4})
    );

    let status = router
        .request(
            Envelope::task(
                "orchestrator",
                "workflow_status",
                json!({ "context_id": context_id }),
            ),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(status.payload["stage"], "COMPLETE");

    for agent in &agents {
        agent.shutdown_with_grace(Duration::from_millis(50)).await;
    }
    orchestrator_agent
        .shutdown_with_grace(Duration::from_millis(50))
        .await;
    orchestrator.shutdown().await;
}
