//! Shards behind retrievals: registration, failure and recovery, block
//! lookups, deal migration and transient GC.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wharf_dagstore::DagStoreError;
use wharf_integration_tests::{BLOCK_SIZE, Client, TestNode, eventually, params, test_data};
use wharf_piece::PieceStore;
use wharf_retrieval::TransferEvent;
use wharf_types::events::{ShardFailed, ShardReady};
use wharf_types::{
    BlockHash, DealStatus, MinerDealState, PieceCid, ProposalCid, ShardKey, ShardState,
};

const WIDE: u64 = 1 << 20;

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_failed_fetch_cancels_deal_then_shard_recovers() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(1, 512, true).await;
    let key = ShardKey::from(stored.piece_cid);
    node.pieces.set_failing(stored.piece_cid, true);
    let mut failures = node.events.subscribe::<ShardFailed>();

    let first = Client::new(41)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    assert!(first.validation.accepted);
    let accepted = node.provider.on_event(first.chid, TransferEvent::Accept).await;
    assert!(accepted.is_err(), "accept should surface the failed unseal");

    let deal = node.deal(&first.id);
    assert_eq!(deal.status, DealStatus::Cancelled);
    assert!(deal.message.contains("failed to load shard"), "{}", deal.message);
    assert!(node.transfer.view(&first.chid).closed);
    assert_eq!(
        node.dagstore.store().get_shard_info(&key).unwrap().state(),
        ShardState::Errored
    );
    let failed = tokio::time::timeout(Duration::from_secs(1), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.key, key);

    // Once the piece is readable again the next load recovers the shard.
    node.pieces.set_failing(stored.piece_cid, false);
    let mut second = Client::new(42)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    second.run().await;
    assert_eq!(second.received, stored.data.to_vec());
    assert_eq!(node.deal(&second.id).status, DealStatus::Completed);
    let info = node.dagstore.store().get_shard_info(&key).unwrap();
    assert_eq!(info.state(), ShardState::Available);
    assert!(info.record.last_error.is_none());
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_eager_registration_indexes_blocks() {
    let node = TestNode::new();
    node.start().await;
    let mut ready = node.events.subscribe::<ShardReady>();

    // Two pieces sharing their first block.
    let shared = test_data(1, BLOCK_SIZE as usize);
    let mut a = shared.clone();
    a.extend(test_data(2, BLOCK_SIZE as usize));
    let mut b = shared.clone();
    b.extend(test_data(3, BLOCK_SIZE as usize));
    let piece_a = node.pieces.put(Bytes::from(a)).await.unwrap();
    let piece_b = node.pieces.put(Bytes::from(b)).await.unwrap();

    for piece in [piece_a, piece_b] {
        let (tx, rx) = oneshot::channel();
        node.dagstore.register_shard(piece, "", true, Some(tx)).unwrap();
        rx.await.unwrap().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), ready.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, ShardKey::from(piece));
    }

    let shared_hash = BlockHash::from_data(&shared);
    let mut pieces = node.dagstore.get_pieces_containing_block(&shared_hash).unwrap();
    pieces.sort();
    let mut expected = vec![piece_a, piece_b];
    expected.sort();
    assert_eq!(pieces, expected);

    let accessor = node
        .dagstore
        .load_shard(piece_a, &CancellationToken::new())
        .await
        .unwrap();
    let blockstore = accessor.blockstore();
    assert_eq!(blockstore.hashes().len(), 2);
    for hash in blockstore.hashes() {
        let found = node.dagstore.get_pieces_containing_block(&hash).unwrap();
        assert!(found.contains(&piece_a));
    }
    accessor.close();

    let missing = node.dagstore.get_pieces_containing_block(&BlockHash::from_data(b"nowhere"));
    assert!(matches!(missing, Err(DagStoreError::BlockNotFound(_))));
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_register_is_idempotent_without_result_channel() {
    let node = TestNode::new();
    node.start().await;
    let piece = node.pieces.put(Bytes::from(test_data(4, 200))).await.unwrap();

    node.dagstore.register_shard(piece, "", false, None).unwrap();
    node.dagstore.register_shard(piece, "", false, None).unwrap();
    assert_eq!(
        node.dagstore
            .store()
            .get_shard_info(&ShardKey::from(piece))
            .unwrap()
            .state(),
        ShardState::New
    );

    let (tx, _rx) = oneshot::channel();
    let again = node.dagstore.register_shard(piece, "", false, Some(tx));
    assert!(matches!(again, Err(DagStoreError::ShardExists(_))));
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_migrate_deals_registers_sealed_deals_once() {
    let node = TestNode::new();
    node.start().await;
    let sealed_a = node.add_payload(5, 300, true).await;
    let sealed_b = node.add_payload(6, 300, false).await;

    // A deal still transferring has nothing to serve yet.
    let mut pending = node.meta.get_miner_deal(&sealed_a.proposal_cid).unwrap().unwrap();
    pending.proposal_cid = ProposalCid::from([0x77; 32]);
    pending.piece_cid = PieceCid::from([0x77; 32]);
    pending.state = MinerDealState::Transferring;
    node.meta.put_miner_deal(&pending).unwrap();

    let deals = node.meta.list_miner_deals().unwrap();
    assert_eq!(deals.len(), 3);
    assert!(node.dagstore.migrate_deals(&deals).await.unwrap());

    let store = node.dagstore.store();
    for stored in [&sealed_a, &sealed_b] {
        let info = store.get_shard_info(&ShardKey::from(stored.piece_cid)).unwrap();
        assert_eq!(info.state(), ShardState::New);
    }
    assert!(matches!(
        store.get_shard_info(&ShardKey::from(pending.piece_cid)),
        Err(DagStoreError::ShardUnknown(_))
    ));

    // The marker stops a second run.
    node.dagstore
        .destroy_shard(sealed_a.piece_cid, None)
        .unwrap();
    eventually("shard to be destroyed", || {
        store.get_shard_info(&ShardKey::from(sealed_a.piece_cid)).is_err()
    })
    .await;
    assert!(!node.dagstore.migrate_deals(&deals).await.unwrap());
    assert!(store.get_shard_info(&ShardKey::from(sealed_a.piece_cid)).is_err());
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_gc_reclaims_idle_transients() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(7, 400, true).await;
    let key = ShardKey::from(stored.piece_cid);

    let mut first = Client::new(43)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    first.open().await;
    let store = node.dagstore.store().clone();

    // Serving shards keep their transient.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let info = store.get_shard_info(&key).unwrap();
    assert_eq!(info.state(), ShardState::Serving);
    assert!(info.record.transient_path.is_some());

    first.run().await;
    eventually("transient to be reclaimed", || {
        store
            .get_shard_info(&key)
            .map(|i| i.record.transient_path.is_none())
            .unwrap_or(false)
    })
    .await;

    // A reclaimed shard is fetched again on the next load.
    let mut second = Client::new(44)
        .propose(&node, 1, stored.payload_cid, params(0, WIDE, WIDE, 0))
        .await;
    second.run().await;
    assert_eq!(second.received, stored.data.to_vec());
    node.close().await;
}
