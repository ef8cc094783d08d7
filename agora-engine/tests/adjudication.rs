//! Dispute pipeline end-to-end: claims, rebuttals, judging, escrow splits
//! and the sealed feedback exchange that follows a ruling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agora_engine::board::{
    AcceptBidRequest, DisputeTaskRequest, PlaceBidRequest, SubmitWorkRequest,
};
use agora_engine::court::SubmitRebuttalRequest;
use agora_engine::judge::FixedJudgePanel;
use agora_engine::models::{ClaimStatus, Rating, TaskStatus};
use agora_engine::reputation::SubmitFeedbackRequest;
use agora_engine::EconomyNode;

use common::{
    abstaining_node, agent_with_coins, balance, task_request, test_node, test_node_with_window,
    vote,
};

/// Drive a task to `submitted` and dispute it. Returns (task_id, claim_id).
async fn disputed_task(
    node: &EconomyNode,
    poster: &str,
    worker: &str,
    reward: i64,
) -> (String, String) {
    let task = node
        .board()
        .create_task(task_request(poster, "contested work", reward, 60, 60, 60))
        .await
        .unwrap();
    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: worker.into(),
                proposal: "will deliver".into(),
            },
        )
        .await
        .unwrap();
    node.board()
        .accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: poster.into(),
                bid_id: bid.bid_id,
            },
        )
        .await
        .unwrap();
    node.board()
        .submit_work(
            &task.task_id,
            SubmitWorkRequest {
                worker_id: worker.into(),
            },
        )
        .await
        .unwrap();

    let (task, claim) = node
        .board()
        .dispute(
            &task.task_id,
            DisputeTaskRequest {
                poster_id: poster.into(),
                reason: "delivery does not match the spec".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Disputed);
    assert_eq!(claim.status, ClaimStatus::Rebuttal);
    (task.task_id, claim.claim_id)
}

#[tokio::test]
async fn worker_at_fault_splits_forty_sixty() {
    // One judge: spec 60 / delivery 40 -> worker share 40%.
    let node = test_node(Arc::new(FixedJudgePanel::new(vec![vote(60, 40)])), 1).await;
    let alice = agent_with_coins(&node, 30, "alice", 100).await;
    let bob = agent_with_coins(&node, 31, "bob", 50).await;

    let (task_id, claim_id) = disputed_task(&node, &alice, &bob, 10).await;

    node.court()
        .submit_rebuttal(
            &claim_id,
            SubmitRebuttalRequest {
                respondent_id: bob.clone(),
                content: "the spec never said otherwise".into(),
            },
        )
        .await
        .unwrap();
    let ruling = node.court().run_judging(&claim_id).await.unwrap();
    assert_eq!(ruling.worker_pct, 40);

    let task = node.board().get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ruled);
    assert_eq!(task.worker_pct, Some(40));
    assert!(task.ruling_summary.is_some());

    // Escrow of 10 splits 4 / 6.
    assert_eq!(balance(&node, &bob).await, 54);
    assert_eq!(balance(&node, &alice).await, 96);
    assert!(node.bank().audit().await.unwrap().consistent);

    // The ruling is final.
    let err = node.court().run_judging(&claim_id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn vague_spec_favors_the_worker() {
    // One judge: spec 5 / delivery 95 -> worker share 95%.
    let node = test_node(Arc::new(FixedJudgePanel::new(vec![vote(5, 95)])), 1).await;
    let alice = agent_with_coins(&node, 32, "alice", 100).await;
    let bob = agent_with_coins(&node, 33, "bob", 50).await;

    let (task_id, claim_id) = disputed_task(&node, &alice, &bob, 10).await;

    node.court()
        .submit_rebuttal(
            &claim_id,
            SubmitRebuttalRequest {
                respondent_id: bob.clone(),
                content: "I built exactly what was written".into(),
            },
        )
        .await
        .unwrap();
    node.court().run_judging(&claim_id).await.unwrap();

    assert_eq!(balance(&node, &bob).await, 59);
    assert_eq!(balance(&node, &alice).await, 91);

    // Feedback opens after the ruling; both rows stay sealed until the
    // second arrives, then reveal together and move the scores.
    let sealed = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id: task_id.clone(),
            from_agent_id: bob.clone(),
            rating: Rating::Dissatisfied,
            comment: Some("spec was vague".into()),
        })
        .await
        .unwrap();
    assert!(!sealed.visible);
    assert!(sealed.rating.is_none());

    let views = node.reputation().feedback_for_task(&task_id).await.unwrap();
    assert_eq!(views.len(), 1);
    assert!(views[0].rating.is_none(), "sealed rating must stay hidden");

    // Scores unchanged while sealed.
    assert_eq!(node.reputation().scores(&alice).await.unwrap().spec_quality, 100);

    let revealed = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id: task_id.clone(),
            from_agent_id: alice.clone(),
            rating: Rating::Satisfied,
            comment: None,
        })
        .await
        .unwrap();
    assert!(revealed.visible);

    let views = node.reputation().feedback_for_task(&task_id).await.unwrap();
    assert_eq!(views.len(), 2);
    assert!(views.iter().all(|view| view.visible));

    let poster_scores = node.reputation().scores(&alice).await.unwrap();
    assert_eq!(poster_scores.spec_quality, 0);
    let worker_scores = node.reputation().scores(&bob).await.unwrap();
    assert_eq!(worker_scores.delivery_quality, 50);
}

#[tokio::test]
async fn every_judge_abstaining_awards_the_worker_everything() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 34, "alice", 100).await;
    let bob = agent_with_coins(&node, 35, "bob", 0).await;

    let (task_id, claim_id) = disputed_task(&node, &alice, &bob, 10).await;
    node.court()
        .submit_rebuttal(
            &claim_id,
            SubmitRebuttalRequest {
                respondent_id: bob.clone(),
                content: String::new(),
            },
        )
        .await
        .unwrap();

    let ruling = node.court().run_judging(&claim_id).await.unwrap();
    assert_eq!(ruling.worker_pct, 100);

    let task = node.board().get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ruled);
    assert_eq!(balance(&node, &bob).await, 10);
    assert_eq!(balance(&node, &alice).await, 90);
}

#[tokio::test]
async fn unanswered_rebuttal_window_goes_to_judging() {
    // One-second rebuttal window so the expiry path fires.
    let node = test_node_with_window(
        Arc::new(FixedJudgePanel::new(vec![vote(50, 50)])),
        1,
        Some(1),
    )
    .await;
    let alice = agent_with_coins(&node, 36, "alice", 100).await;
    let bob = agent_with_coins(&node, 37, "bob", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "silent respondent", 10, 60, 60, 60))
        .await
        .unwrap();
    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "ok".into(),
            },
        )
        .await
        .unwrap();
    node.board()
        .accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: alice.clone(),
                bid_id: bid.bid_id,
            },
        )
        .await
        .unwrap();
    node.board()
        .submit_work(
            &task.task_id,
            SubmitWorkRequest {
                worker_id: bob.clone(),
            },
        )
        .await
        .unwrap();
    let (_, claim) = node
        .board()
        .dispute(
            &task.task_id,
            DisputeTaskRequest {
                poster_id: alice.clone(),
                reason: "not what I asked".into(),
            },
        )
        .await
        .unwrap();

    // Window still open: nothing expires.
    assert!(node.court().expire_rebuttals().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let expired = node.court().expire_rebuttals().await.unwrap();
    assert_eq!(expired, vec![claim.claim_id.clone()]);

    let ruling = node.court().run_judging(&claim.claim_id).await.unwrap();
    assert_eq!(ruling.worker_pct, 50);

    let detail = node.court().claim_detail(&claim.claim_id).await.unwrap();
    assert_eq!(detail.claim.status, ClaimStatus::Ruled);
    assert!(detail.rebuttal.is_none(), "no rebuttal was ever filed");
    assert!(detail.ruling.is_some());
}

#[tokio::test]
async fn feedback_is_locked_before_terminal_states_and_unique() {
    let node = test_node(Arc::new(FixedJudgePanel::new(vec![vote(50, 50)])), 1).await;
    let alice = agent_with_coins(&node, 38, "alice", 100).await;
    let bob = agent_with_coins(&node, 39, "bob", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "no feedback yet", 10, 60, 60, 60))
        .await
        .unwrap();

    let err = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id: task.task_id.clone(),
            from_agent_id: alice.clone(),
            rating: Rating::Satisfied,
            comment: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    let (task_id, claim_id) = disputed_task(&node, &alice, &bob, 10).await;
    node.court()
        .submit_rebuttal(
            &claim_id,
            SubmitRebuttalRequest {
                respondent_id: bob.clone(),
                content: "see assets".into(),
            },
        )
        .await
        .unwrap();
    node.court().run_judging(&claim_id).await.unwrap();

    node.reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id: task_id.clone(),
            from_agent_id: alice.clone(),
            rating: Rating::Satisfied,
            comment: None,
        })
        .await
        .unwrap();

    // One entry per direction.
    let err = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id: task_id.clone(),
            from_agent_id: alice.clone(),
            rating: Rating::ExtremelySatisfied,
            comment: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Outsiders cannot rate.
    let eve = agent_with_coins(&node, 40, "eve", 0).await;
    let err = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id,
            from_agent_id: eve,
            rating: Rating::Satisfied,
            comment: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
}

#[tokio::test]
async fn comment_length_is_capped() {
    let node = test_node(Arc::new(FixedJudgePanel::new(vec![vote(50, 50)])), 1).await;
    let alice = agent_with_coins(&node, 41, "alice", 100).await;
    let bob = agent_with_coins(&node, 42, "bob", 0).await;

    let (task_id, claim_id) = disputed_task(&node, &alice, &bob, 10).await;
    node.court()
        .submit_rebuttal(
            &claim_id,
            SubmitRebuttalRequest {
                respondent_id: bob.clone(),
                content: "done".into(),
            },
        )
        .await
        .unwrap();
    node.court().run_judging(&claim_id).await.unwrap();

    let err = node
        .reputation()
        .submit_feedback(SubmitFeedbackRequest {
            task_id,
            from_agent_id: alice,
            rating: Rating::Satisfied,
            comment: Some("x".repeat(257)),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}
