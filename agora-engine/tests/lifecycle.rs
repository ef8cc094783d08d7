//! Task lifecycle end-to-end: the board, the bank and the event log
//! working against one shared store.

mod common;

use std::time::Duration;

use agora_engine::board::{
    AcceptBidRequest, ApproveTaskRequest, CancelTaskRequest, PlaceBidRequest, SubmitWorkRequest,
    UploadAssetRequest,
};
use agora_engine::models::TaskStatus;
use agora_engine::projection::EconomyProjection;

use common::{abstaining_node, agent_with_coins, balance, task_request};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[tokio::test]
async fn happy_path_pays_the_worker() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 1, "alice", 100).await;
    let bob = agent_with_coins(&node, 2, "bob", 50).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "write parser", 10, 60, 60, 60))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Open);
    assert_eq!(balance(&node, &alice).await, 90);

    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "I will write it".into(),
            },
        )
        .await
        .unwrap();

    let task = node
        .board()
        .accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: alice.clone(),
                bid_id: bid.bid_id.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Accepted);
    assert_eq!(task.worker_id.as_deref(), Some(bob.as_str()));
    assert!(task.execution_deadline.is_some());

    let task = node
        .board()
        .submit_work(
            &task.task_id,
            SubmitWorkRequest {
                worker_id: bob.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Submitted);

    let task = node
        .board()
        .approve(
            &task.task_id,
            ApproveTaskRequest {
                poster_id: alice.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Approved);

    assert_eq!(balance(&node, &alice).await, 90);
    assert_eq!(balance(&node, &bob).await, 60);

    let kinds: Vec<String> = node
        .events_for_task(&task.task_id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "escrow.locked",
            "task.created",
            "bid.submitted",
            "task.accepted",
            "task.submitted",
            "task.approved",
            "escrow.released",
        ]
    );

    let audit = node.bank().audit().await.unwrap();
    assert!(audit.consistent);

    // The log alone reconstructs the derived aggregates.
    let events = node.events_after(0, 500).await.unwrap();
    let projection = EconomyProjection::replay(&events).unwrap();
    assert_eq!(projection.agent(&alice).tasks_posted, 1);
    assert_eq!(projection.agent(&alice).total_spent, 10);
    assert_eq!(projection.agent(&bob).tasks_completed, 1);
    assert_eq!(projection.agent(&bob).total_earned, 10);
}

#[tokio::test]
async fn competitive_bidding_pays_the_chosen_worker() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 3, "alice", 100).await;
    let bob = agent_with_coins(&node, 4, "bob", 50).await;
    let carol = agent_with_coins(&node, 5, "carol", 50).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "design logo", 8, 60, 60, 60))
        .await
        .unwrap();

    node.board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "sketch in ink".into(),
            },
        )
        .await
        .unwrap();
    let carols = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: carol.clone(),
                proposal: "vector art".into(),
            },
        )
        .await
        .unwrap();

    node.board()
        .accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: alice.clone(),
                bid_id: carols.bid_id.clone(),
            },
        )
        .await
        .unwrap();
    node.board()
        .submit_work(
            &task.task_id,
            SubmitWorkRequest {
                worker_id: carol.clone(),
            },
        )
        .await
        .unwrap();
    node.board()
        .approve(
            &task.task_id,
            ApproveTaskRequest {
                poster_id: alice.clone(),
            },
        )
        .await
        .unwrap();

    assert_eq!(balance(&node, &carol).await, 58);
    assert_eq!(balance(&node, &bob).await, 50);

    // The losing bid stays attached for audit.
    let bids = node.board().list_bids(&task.task_id).await.unwrap();
    assert_eq!(bids.len(), 2);
    assert!(bids.iter().any(|bid| bid.bidder_id == bob));
}

#[tokio::test]
async fn one_bid_per_bidder_and_no_self_bids() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 6, "alice", 100).await;
    let bob = agent_with_coins(&node, 7, "bob", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "task", 5, 60, 60, 60))
        .await
        .unwrap();

    let err = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: alice.clone(),
                proposal: "me".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    node.board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "first".into(),
            },
        )
        .await
        .unwrap();
    let err = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "second".into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn review_timeout_auto_approves() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 8, "alice", 100).await;
    let bob = agent_with_coins(&node, 9, "bob", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "quick job", 5, 60, 60, 1))
        .await
        .unwrap();
    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "on it".into(),
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

    // Review window still open: nothing to do.
    let report = node.board().sweep().await.unwrap();
    assert_eq!(report.auto_approved, 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let report = node.board().sweep().await.unwrap();
    assert_eq!(report.auto_approved, 1);

    let task = node.board().get_task(&task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Approved);
    assert_eq!(balance(&node, &bob).await, 5);

    let events = node.events_for_task(&task.task_id).await.unwrap();
    let auto = events
        .iter()
        .find(|event| event.kind == "task.auto_approved")
        .expect("auto approval event");
    assert_eq!(auto.payload["auto"], true);

    // Idempotent: a second pass changes nothing.
    let report = node.board().sweep().await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(
        node.events_for_task(&task.task_id).await.unwrap().len(),
        events.len()
    );
}

#[tokio::test]
async fn bidding_timeout_refunds_the_poster() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 10, "alice", 20).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "nobody bids", 5, 1, 60, 60))
        .await
        .unwrap();
    assert_eq!(balance(&node, &alice).await, 15);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let report = node.board().sweep().await.unwrap();
    assert_eq!(report.expired_bidding, 1);

    let task = node.board().get_task(&task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Expired);
    assert_eq!(task.expired_reason.as_deref(), Some("bidding"));
    assert_eq!(balance(&node, &alice).await, 20);
    assert!(node.bank().audit().await.unwrap().consistent);
}

#[tokio::test]
async fn cancel_refunds_and_only_works_while_open() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 11, "alice", 30).await;
    let bob = agent_with_coins(&node, 12, "bob", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "changed my mind", 10, 60, 60, 60))
        .await
        .unwrap();
    assert_eq!(balance(&node, &alice).await, 20);

    node.board()
        .cancel(
            &task.task_id,
            CancelTaskRequest {
                poster_id: alice.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(balance(&node, &alice).await, 30);

    // Accepted tasks cannot be cancelled.
    let task = node
        .board()
        .create_task(task_request(&alice, "committed", 10, 60, 60, 60))
        .await
        .unwrap();
    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "mine".into(),
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
    let err = node
        .board()
        .cancel(
            &task.task_id,
            CancelTaskRequest {
                poster_id: alice.clone(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn concurrent_accepts_resolve_to_one_winner() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 13, "alice", 100).await;
    let bob = agent_with_coins(&node, 14, "bob", 0).await;
    let carol = agent_with_coins(&node, 15, "carol", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "contested", 10, 60, 60, 60))
        .await
        .unwrap();
    let bob_bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "bob".into(),
            },
        )
        .await
        .unwrap();
    let carol_bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: carol.clone(),
                proposal: "carol".into(),
            },
        )
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        node.board().accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: alice.clone(),
                bid_id: bob_bid.bid_id.clone(),
            },
        ),
        node.board().accept_bid(
            &task.task_id,
            AcceptBidRequest {
                poster_id: alice.clone(),
                bid_id: carol_bid.bid_id.clone(),
            },
        ),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    let loser = outcomes
        .iter()
        .find(|o| o.is_err())
        .unwrap()
        .as_ref()
        .unwrap_err();
    assert_eq!(loser.kind(), "conflict");
    assert!(loser.to_string().contains("accepted"));

    let task = node.board().get_task(&task.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Accepted);
}

#[tokio::test]
async fn assets_are_worker_only_and_participant_visible() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 16, "alice", 50).await;
    let bob = agent_with_coins(&node, 17, "bob", 0).await;
    let eve = agent_with_coins(&node, 18, "eve", 0).await;

    let task = node
        .board()
        .create_task(task_request(&alice, "deliverable", 10, 60, 60, 60))
        .await
        .unwrap();

    let upload = UploadAssetRequest {
        uploader_id: bob.clone(),
        filename: "result.txt".into(),
        content_type: "text/plain".into(),
        content_base64: BASE64.encode(b"done"),
    };

    // No upload while the task is still open.
    let err = node
        .board()
        .upload_asset(&task.task_id, upload.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    let bid = node
        .board()
        .place_bid(
            &task.task_id,
            PlaceBidRequest {
                bidder_id: bob.clone(),
                proposal: "mine".into(),
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

    // Only the assigned worker may upload.
    let mut from_eve = upload.clone();
    from_eve.uploader_id = eve.clone();
    let err = node
        .board()
        .upload_asset(&task.task_id, from_eve)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let asset = node
        .board()
        .upload_asset(&task.task_id, upload)
        .await
        .unwrap();
    assert_eq!(asset.size_bytes, 4);

    let listed = node
        .board()
        .list_assets(&task.task_id, Some(&alice))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let err = node
        .board()
        .list_assets(&task.task_id, Some(&eve))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
}

#[tokio::test]
async fn salary_rounds_are_idempotent_across_the_node() {
    let node = abstaining_node().await;
    let alice = agent_with_coins(&node, 19, "alice", 0).await;
    let bob = agent_with_coins(&node, 20, "bob", 0).await;

    for _ in 0..3 {
        node.bank().pay_salary(42, 10).await.unwrap();
    }
    assert_eq!(balance(&node, &alice).await, 10);
    assert_eq!(balance(&node, &bob).await, 10);
    assert!(node.bank().audit().await.unwrap().consistent);
}
