//! State that must survive closing and reopening a node.

use wharf_integration_tests::{Client, TestNode, eventually, params};
use wharf_types::{DealStatus, RetrievalAsk, ShardKey, ShardState, TokenAmount};

const WIDE: u64 = 1 << 20;

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_deals_and_ask_survive_restart() {
    let node = TestNode::new();
    node.start().await;
    let ask = RetrievalAsk {
        price_per_byte: TokenAmount::from(1u64),
        unseal_price: TokenAmount::ZERO,
        payment_interval: WIDE,
        payment_interval_increase: WIDE,
    };
    node.set_ask(ask.clone());
    let stored = node.add_payload(1, 300, false).await;

    let mut pull = Client::new(51)
        .propose(&node, 1, stored.payload_cid, params(1, WIDE, WIDE, 0))
        .await;
    pull.run().await;
    let id = pull.id;
    assert_eq!(pull.paid, TokenAmount::from(300u64));

    let node = node.restart().await;
    node.start().await;
    assert_eq!(node.provider.get_ask().unwrap(), ask);
    let deal = node.deal(&id);
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(deal.total_sent, 300);
    assert_eq!(deal.funds_received, TokenAmount::from(300u64));
    assert_eq!(node.provider.list_deals().unwrap().len(), 1);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_interrupted_unseal_resumes_on_start() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(2, 400, true).await;

    let pull = Client::new(52)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    let (id, chid) = (pull.id, pull.chid);
    // Crash between entering Unsealing and loading the shard.
    let mut deal = node.deal(&id);
    deal.status = DealStatus::Unsealing;
    node.meta.put_retrieval_deal(&deal).unwrap();

    let node = node.restart().await;
    node.start().await;
    let transfer = node.transfer.clone();
    eventually("restarted unseal to resume the channel", move || {
        transfer.view(&chid).resumes == 1
    })
    .await;
    assert_eq!(node.deal(&id).status, DealStatus::Unsealed);
    assert!(node.provider.blockstore(&id).is_ok());
    assert_eq!(
        node.dagstore
            .store()
            .get_shard_info(&ShardKey::from(stored.piece_cid))
            .unwrap()
            .state(),
        ShardState::Serving
    );
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_serving_shard_reopens_available() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(3, 256, true).await;
    let key = ShardKey::from(stored.piece_cid);

    let mut pull = Client::new(53)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    pull.open().await;
    let id = pull.id;
    assert_eq!(
        node.dagstore.store().get_shard_info(&key).unwrap().state(),
        ShardState::Serving
    );

    let node = node.restart().await;
    let info = node.dagstore.store().get_shard_info(&key).unwrap();
    assert_eq!(info.state(), ShardState::Available);
    assert_eq!(info.refs, 0);

    // The open deal is not unsealing, so start leaves it alone.
    node.start().await;
    assert_eq!(node.deal(&id).status, DealStatus::Unsealed);
    assert!(node.provider.blockstore(&id).is_err());
    node.close().await;
}
