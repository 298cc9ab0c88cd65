//! End-to-end retrievals: proposal, unseal, block transfer, completion.

use std::time::Duration;

use wharf_integration_tests::{Client, TestNode, params};
use wharf_retrieval::{TrackerError, TransferAction, TransferEvent};
use wharf_types::events::DealUpdated;
use wharf_types::{DealStatus, PayloadCid, RetrievalAsk, ShardKey, ShardState, TokenAmount};

const FREE_INTERVAL: u64 = 1 << 20;

fn free_params() -> wharf_types::DealParams {
    params(0, FREE_INTERVAL, FREE_INTERVAL, 0)
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_free_retrieval_delivers_payload() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(1, 1000, false).await;
    let client = Client::new(11);

    let mut pull = client.propose(&node, 1, stored.payload_cid, free_params()).await;
    assert!(pull.validation.accepted);
    assert!(pull.validation.force_pause);
    assert_eq!(pull.status(), DealStatus::Accepted);

    let outcome = pull.run().await.expect("finalize is handled");
    assert_eq!(outcome.action, TransferAction::Complete);
    assert_eq!(pull.received, stored.data.to_vec());
    assert!(pull.payments.is_empty(), "free deal should never ask for money");

    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(deal.total_sent, 1000);
    assert!(node.transfer.view(&pull.chid).closed);
    assert!(matches!(
        node.provider.blockstore(&pull.id),
        Err(wharf_retrieval::RetrievalError::Tracker(TrackerError::NotFound(_)))
    ));
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_sealed_piece_is_served_and_shard_released() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(2, 700, true).await;
    let client = Client::new(12);

    let mut pull = client.propose(&node, 1, stored.payload_cid, free_params()).await;
    pull.open().await;
    let key = ShardKey::from(stored.piece_cid);
    assert_eq!(
        node.dagstore.store().get_shard_info(&key).unwrap().state(),
        ShardState::Serving
    );

    // `run` re-opens; Accept on an unsealed deal is a no-op.
    pull.run().await;
    assert_eq!(pull.received, stored.data.to_vec());
    assert_eq!(node.deal(&pull.id).status, DealStatus::Completed);
    assert_eq!(
        node.dagstore.store().get_shard_info(&key).unwrap().state(),
        ShardState::Available
    );
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_unseal_price_paid_before_transfer() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(RetrievalAsk {
        unseal_price: TokenAmount::from(500u64),
        ..RetrievalAsk::default()
    });
    let stored = node.add_payload(3, 400, true).await;
    let client = Client::new(13);

    let mut pull = client
        .propose(&node, 1, stored.payload_cid, params(0, FREE_INTERVAL, FREE_INTERVAL, 500))
        .await;
    assert!(pull.validation.accepted);
    assert_eq!(pull.status(), DealStatus::FundsNeededUnseal);
    assert_eq!(
        pull.validation.response.as_ref().unwrap().payment_owed,
        TokenAmount::from(500u64)
    );

    // Accepting the channel alone does not unseal.
    pull.event(TransferEvent::Accept).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.deal(&pull.id).status, DealStatus::FundsNeededUnseal);
    assert_eq!(node.transfer.view(&pull.chid).resumes, 0);

    pull.run().await;
    assert_eq!(pull.payments, vec![TokenAmount::from(500u64)]);
    assert_eq!(pull.received, stored.data.to_vec());
    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(deal.funds_received, TokenAmount::from(500u64));
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_unsealed_piece_waives_unseal_price() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(RetrievalAsk {
        unseal_price: TokenAmount::from(500u64),
        ..RetrievalAsk::default()
    });
    let stored = node.add_payload(4, 300, false).await;
    let client = Client::new(14);

    let pull = client.propose(&node, 1, stored.payload_cid, free_params()).await;
    assert!(pull.validation.accepted);
    assert_eq!(pull.status(), DealStatus::Accepted);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_concurrent_clients_share_one_shard() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(5, 2048, true).await;
    let alice = Client::new(21);
    let bob = Client::new(22);

    let mut a = alice.propose(&node, 1, stored.payload_cid, free_params()).await;
    let mut b = bob.propose(&node, 1, stored.payload_cid, free_params()).await;
    assert_ne!(a.id, b.id, "same deal number from different clients are distinct deals");

    tokio::join!(a.run(), b.run());

    assert_eq!(a.received, stored.data.to_vec());
    assert_eq!(b.received, stored.data.to_vec());
    assert_eq!(node.deal(&a.id).status, DealStatus::Completed);
    assert_eq!(node.deal(&b.id).status, DealStatus::Completed);
    let key = ShardKey::from(stored.piece_cid);
    let info = node.dagstore.store().get_shard_info(&key).unwrap();
    assert_eq!(info.state(), ShardState::Available);
    assert_eq!(info.refs, 0);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_rejected_proposals_are_not_persisted() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(RetrievalAsk {
        price_per_byte: TokenAmount::from(3u64),
        ..RetrievalAsk::default()
    });
    let stored = node.add_payload(6, 256, false).await;
    let client = Client::new(16);

    let cheap = client
        .propose(&node, 1, stored.payload_cid, params(1, FREE_INTERVAL, FREE_INTERVAL, 0))
        .await;
    assert!(!cheap.validation.accepted);
    assert_eq!(cheap.status(), DealStatus::Rejected);
    assert!(node.provider.get_deal(&cheap.id).unwrap().is_none());

    let missing = client
        .propose(&node, 2, PayloadCid::from([0xee; 32]), params(3, FREE_INTERVAL, FREE_INTERVAL, 0))
        .await;
    assert!(!missing.validation.accepted);
    assert_eq!(missing.status(), DealStatus::DealNotFound);
    assert!(node.provider.get_deal(&missing.id).unwrap().is_none());

    // A rejected deal number can be proposed again with better terms.
    let retry = client
        .propose(&node, 1, stored.payload_cid, params(3, FREE_INTERVAL, FREE_INTERVAL, 0))
        .await;
    assert!(retry.validation.accepted);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_client_without_payment_address_is_rejected() {
    let node = TestNode::with_payment(wharf_retrieval::PaymentAddresses::new());
    node.start().await;
    let stored = node.add_payload(7, 128, false).await;

    let pull = Client::new(17)
        .propose(&node, 1, stored.payload_cid, free_params())
        .await;
    assert!(!pull.validation.accepted);
    assert_eq!(pull.status(), DealStatus::Errored);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_client_cancel_releases_blockstore() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(8, 512, false).await;

    let mut pull = Client::new(18)
        .propose(&node, 1, stored.payload_cid, free_params())
        .await;
    pull.open().await;
    assert!(node.provider.blockstore(&pull.id).is_ok());

    pull.event(TransferEvent::Cancel).await;
    assert_eq!(node.deal(&pull.id).status, DealStatus::Cancelled);
    assert!(node.transfer.view(&pull.chid).closed);
    assert!(node.provider.blockstore(&pull.id).is_err());
    let key = ShardKey::from(stored.piece_cid);
    assert_eq!(
        node.dagstore.store().get_shard_info(&key).unwrap().state(),
        ShardState::Available
    );

    // Late events for the finished deal change nothing.
    assert!(pull.event(TransferEvent::Completed).await.is_none());
    assert_eq!(node.deal(&pull.id).status, DealStatus::Cancelled);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_disconnect_errors_deal() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(9, 256, false).await;

    let mut pull = Client::new(19)
        .propose(&node, 1, stored.payload_cid, free_params())
        .await;
    pull.open().await;
    pull.event(TransferEvent::Disconnected {
        message: "peer went away".into(),
    })
    .await;

    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Errored);
    assert!(deal.message.contains("peer went away"));
    assert!(node.provider.blockstore(&pull.id).is_err());
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_deal_updates_follow_lifecycle() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(10, 300, false).await;
    let mut updates = node.events.subscribe::<DealUpdated>();

    let mut pull = Client::new(20)
        .propose(&node, 1, stored.payload_cid, free_params())
        .await;
    pull.run().await;

    let mut statuses = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), updates.recv()).await
    {
        if event.deal == pull.id {
            statuses.push(event.status);
        }
    }
    statuses.dedup();
    assert_eq!(
        statuses,
        vec![
            DealStatus::Accepted,
            DealStatus::Unsealing,
            DealStatus::Unsealed,
            DealStatus::BlocksComplete,
            DealStatus::Finalizing,
            DealStatus::Completed,
        ]
    );
    assert_eq!(
        node.deal(&pull.id).sel_storage_proposal_cid,
        Some(stored.proposal_cid)
    );
    node.close().await;
}
