//! The query protocol over TCP, answered by a running provider.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wharf_integration_tests::{PAYMENT, TestNode};
use wharf_net::{QueryResponder, QueryServer, QueryServerConfig, query};
use wharf_retrieval::PaymentAddresses;
use wharf_types::{
    PayloadCid, PieceCid, QueryItemStatus, QueryRequest, QueryResponseStatus, RetrievalAsk,
    TokenAmount,
};

async fn serve(node: &TestNode) -> (SocketAddr, CancellationToken) {
    let responder: Arc<dyn QueryResponder> = node.provider.query_handler();
    let listen = "127.0.0.1:0".parse().unwrap();
    let server = QueryServer::bind(listen, responder, QueryServerConfig::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(cancel.clone()));
    (addr, cancel)
}

fn request(payload: PayloadCid, piece: Option<PieceCid>) -> QueryRequest {
    QueryRequest {
        payload_cid: payload,
        piece_cid: piece,
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_query_available_payload() {
    let node = TestNode::new();
    node.start().await;
    node.set_ask(RetrievalAsk {
        price_per_byte: TokenAmount::from(4u64),
        unseal_price: TokenAmount::from(90u64),
        payment_interval: 4096,
        payment_interval_increase: 1024,
    });
    let sealed = node.add_payload(1, 900, true).await;
    let unsealed = node.add_payload(2, 300, false).await;
    let (addr, cancel) = serve(&node).await;

    let response = query(addr, &request(sealed.payload_cid, None)).await.unwrap();
    assert_eq!(response.status, QueryResponseStatus::Available);
    assert_eq!(response.piece_cid_found, QueryItemStatus::Unknown);
    assert_eq!(response.size, 900);
    assert_eq!(response.min_price_per_byte, TokenAmount::from(4u64));
    assert_eq!(response.unseal_price, TokenAmount::from(90u64));
    assert_eq!(response.max_payment_interval, 4096);
    assert_eq!(response.max_payment_interval_increase, 1024);
    assert_eq!(response.payment_address, Some(PAYMENT));

    // An unsealed copy needs no unseal.
    let response = query(addr, &request(unsealed.payload_cid, Some(unsealed.piece_cid)))
        .await
        .unwrap();
    assert_eq!(response.status, QueryResponseStatus::Available);
    assert_eq!(response.piece_cid_found, QueryItemStatus::Available);
    assert_eq!(response.size, 300);
    assert_eq!(response.unseal_price, TokenAmount::ZERO);

    cancel.cancel();
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_query_unknown_payload_or_piece() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(3, 128, false).await;
    let (addr, cancel) = serve(&node).await;

    let response = query(addr, &request(PayloadCid::from([0xab; 32]), None)).await.unwrap();
    assert_eq!(response.status, QueryResponseStatus::Unavailable);
    assert!(response.payment_address.is_none());

    // The payload exists, but not in the requested piece.
    let response = query(addr, &request(stored.payload_cid, Some(PieceCid::from([0xcd; 32]))))
        .await
        .unwrap();
    assert_eq!(response.status, QueryResponseStatus::Unavailable);

    cancel.cancel();
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_query_without_payment_address_errors() {
    let node = TestNode::with_payment(PaymentAddresses::new());
    node.start().await;
    let stored = node.add_payload(4, 128, false).await;
    let (addr, cancel) = serve(&node).await;

    let response = query(addr, &request(stored.payload_cid, None)).await.unwrap();
    assert_eq!(response.status, QueryResponseStatus::Error);
    assert!(response.message.contains("no payment address"));

    cancel.cancel();
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_query_reflects_ask_updates() {
    let node = TestNode::new();
    node.start().await;
    let stored = node.add_payload(5, 128, false).await;
    let (addr, cancel) = serve(&node).await;

    let before = query(addr, &request(stored.payload_cid, None)).await.unwrap();
    assert_eq!(before.min_price_per_byte, TokenAmount::ZERO);

    node.set_ask(RetrievalAsk {
        price_per_byte: TokenAmount::from(7u64),
        ..RetrievalAsk::default()
    });
    let after = query(addr, &request(stored.payload_cid, None)).await.unwrap();
    assert_eq!(after.min_price_per_byte, TokenAmount::from(7u64));

    cancel.cancel();
    node.close().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_concurrent_queries() {
    let node = TestNode::new();
    node.start().await;
    let mut payloads = Vec::new();
    for seed in 10..20u8 {
        payloads.push(node.add_payload(seed, 64 * seed as usize, false).await);
    }
    let (addr, cancel) = serve(&node).await;

    let mut handles = Vec::new();
    for stored in &payloads {
        let req = request(stored.payload_cid, None);
        handles.push(tokio::spawn(async move { query(addr, &req).await }));
    }
    for (handle, stored) in handles.into_iter().zip(&payloads) {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, QueryResponseStatus::Available);
        assert_eq!(response.size, stored.data.len() as u64);
    }

    cancel.cancel();
    node.close().await;
}
