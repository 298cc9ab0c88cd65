//! Paid retrievals: interval metering, partial payments and final payment.

use wharf_integration_tests::{Client, TestNode, params};
use wharf_retrieval::{TransferAction, payment_owed};
use wharf_types::{DealStatus, RetrievalAsk, TokenAmount};

const WIDE: u64 = 1 << 20;

fn amounts(values: &[u64]) -> Vec<TokenAmount> {
    values.iter().map(|&v| TokenAmount::from(v)).collect()
}

fn priced(price: u64, unseal: u64) -> RetrievalAsk {
    RetrievalAsk {
        price_per_byte: TokenAmount::from(price),
        unseal_price: TokenAmount::from(unseal),
        payment_interval: WIDE,
        payment_interval_increase: WIDE,
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_each_interval_is_paid_once() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(priced(2, 0));
    let stored = node.add_payload(1, 1000, false).await;

    // 64-byte blocks, intervals end at 128, 320, 576, 896, 1280.
    let mut pull = Client::new(31)
        .propose(&node, 1, stored.payload_cid, params(2, 128, 64, 0))
        .await;
    let outcome = pull.run().await.expect("finalize is handled");

    assert_eq!(outcome.action, TransferAction::Complete);
    assert_eq!(pull.received, stored.data.to_vec());
    assert_eq!(pull.payments, amounts(&[256, 384, 512, 640, 208]));
    assert_eq!(pull.paid, TokenAmount::from(2000u64));

    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(deal.funds_received, TokenAmount::from(2000u64));
    assert_eq!(payment_owed(&deal), TokenAmount::ZERO);
    assert_eq!(node.transfer.view(&pull.chid).pauses, 5);
    assert_eq!(node.provider.new_status_anomalies(), 0);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_unseal_and_transfer_payments_combined() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(priced(1, 300));
    let stored = node.add_payload(2, 512, true).await;

    let mut pull = Client::new(32)
        .propose(&node, 1, stored.payload_cid, params(1, 256, 0, 300))
        .await;
    assert_eq!(pull.status(), DealStatus::FundsNeededUnseal);
    pull.run().await;

    assert_eq!(pull.payments, amounts(&[300, 256, 256]));
    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Completed);
    assert_eq!(deal.funds_received, TokenAmount::from(812u64));
    assert_eq!(deal.total_sent, 512);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_partial_payment_keeps_channel_paused() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(priced(1, 0));
    let stored = node.add_payload(3, 256, false).await;

    let mut pull = Client::new(33)
        .propose(&node, 1, stored.payload_cid, params(1, 128, 0, 0))
        .await;
    pull.open().await;

    let first = node.provider.on_pull_data_sent(pull.chid, 64).await.unwrap().unwrap();
    assert_eq!(first.action, TransferAction::Continue);
    let second = node.provider.on_pull_data_sent(pull.chid, 64).await.unwrap().unwrap();
    assert_eq!(second.action, TransferAction::Pause);
    assert_eq!(second.response.unwrap().payment_owed, TokenAmount::from(128u64));
    assert!(node.transfer.view(&pull.chid).paused);

    let partial = pull.pay(TokenAmount::from(100u64)).await.unwrap();
    assert_eq!(partial.action, TransferAction::Pause);
    let response = partial.response.unwrap();
    assert_eq!(response.status, DealStatus::FundsNeeded);
    assert_eq!(response.payment_owed, TokenAmount::from(28u64));
    assert_eq!(node.deal(&pull.id).funds_received, TokenAmount::from(100u64));

    let rest = pull.pay(TokenAmount::from(28u64)).await.unwrap();
    assert_eq!(rest.action, TransferAction::Resume);
    assert!(!node.transfer.view(&pull.chid).paused);
    let deal = node.deal(&pull.id);
    assert_eq!(deal.status, DealStatus::Ongoing);
    assert_eq!(deal.current_interval, 256);
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_replayed_voucher_credits_nothing() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(priced(1, 0));
    let stored = node.add_payload(4, 256, false).await;

    let mut pull = Client::new(34)
        .propose(&node, 1, stored.payload_cid, params(1, 128, 0, 0))
        .await;
    pull.open().await;
    node.provider.on_pull_data_sent(pull.chid, 128).await.unwrap();
    pull.pay(TokenAmount::from(50u64)).await;

    // Same cumulative amount on a newer nonce: nothing new is credited.
    let replay = pull.pay(TokenAmount::ZERO).await.unwrap();
    assert_eq!(replay.action, TransferAction::Pause);
    assert_eq!(replay.response.unwrap().payment_owed, TokenAmount::from(78u64));
    assert_eq!(node.deal(&pull.id).funds_received, TokenAmount::from(50u64));
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_free_transfer_never_pauses() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(5, 640, false).await;

    let mut pull = Client::new(35)
        .propose(&node, 1, stored.payload_cid, params(0, 64, 0, 0))
        .await;
    pull.run().await;

    assert!(pull.payments.is_empty());
    assert_eq!(node.transfer.view(&pull.chid).pauses, 0);
    assert_eq!(node.deal(&pull.id).status, DealStatus::Completed);
    node.close().await;
}
