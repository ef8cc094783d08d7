//! Shared fixtures for the integration suites

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;

use agora_engine::board::CreateTaskRequest;
use agora_engine::identity::RegisterAgentRequest;
use agora_engine::judge::{JudgePanel, JudgeVote, NullJudgePanel};
use agora_engine::{EconomyNode, Settings};

/// In-memory node with a deterministic panel and a scratch asset dir.
pub async fn test_node(panel: Arc<dyn JudgePanel>, panel_size: usize) -> EconomyNode {
    test_node_with_window(panel, panel_size, None).await
}

/// Same, with an explicit rebuttal window for the timeout tests.
pub async fn test_node_with_window(
    panel: Arc<dyn JudgePanel>,
    panel_size: usize,
    rebuttal_window_seconds: Option<i64>,
) -> EconomyNode {
    let mut settings = Settings::default();
    settings.database_path = ":memory:".into();
    settings.asset_storage_dir = std::env::temp_dir()
        .join(format!("agora-test-{}", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned();
    settings.judge_panel_size = panel_size;
    settings.judge_timeout_seconds = 5;
    settings.rebuttal_window_seconds = rebuttal_window_seconds;
    EconomyNode::with_judge_panel(settings, panel)
        .await
        .expect("node builds")
}

pub async fn abstaining_node() -> EconomyNode {
    test_node(Arc::new(NullJudgePanel), 3).await
}

/// Register an agent with a deterministic key and fund its account.
pub async fn agent_with_coins(node: &EconomyNode, seed: u8, name: &str, coins: i64) -> String {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let agent = node
        .identity()
        .register(RegisterAgentRequest {
            name: name.into(),
            public_key: format!("ed25519:{}", BASE64.encode(key.verifying_key().to_bytes())),
        })
        .await
        .expect("registration succeeds");
    if coins > 0 {
        node.bank()
            .credit(&agent.agent_id, coins, &format!("genesis_{}", name))
            .await
            .expect("funding succeeds");
    }
    agent.agent_id
}

/// A task request with explicit short deadlines.
pub fn task_request(
    poster: &str,
    title: &str,
    reward: i64,
    bidding: i64,
    execution: i64,
    review: i64,
) -> CreateTaskRequest {
    CreateTaskRequest {
        poster_id: poster.into(),
        title: title.into(),
        spec: format!("specification for {}", title),
        reward,
        bidding_deadline_seconds: Some(bidding),
        execution_deadline_seconds: Some(execution),
        review_deadline_seconds: Some(review),
    }
}

pub fn vote(spec: i64, delivery: i64) -> JudgeVote {
    JudgeVote {
        spec_quality_pct: spec,
        delivery_quality_pct: delivery,
        brief_reason: "seeded opinion".into(),
    }
}

pub async fn balance(node: &EconomyNode, agent: &str) -> i64 {
    node.bank().get_account(agent).await.expect("account").balance
}
