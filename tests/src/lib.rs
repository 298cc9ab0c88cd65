//! Shared test harness for Wharf integration tests.
//!
//! Provides [`TestNode`], a full retrieval provider over an on-disk
//! metadata store, an in-memory piece store and a [`ChannelTransport`] that
//! records how the provider drives each channel, and [`Client`], a scripted
//! retrieval client that pulls a payload block by block and pays whatever
//! the provider asks for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use wharf_dagstore::{
    DagStore, DagStoreConfig, DagStoreWrapper, MountRegistry, PieceMountFactory, WrapperConfig,
};
use wharf_meta::MetaStore;
use wharf_piece::{MemoryPieceStore, PieceStore};
use wharf_retrieval::{
    AcceptAll, DataTransfer, DefaultPricing, PaymentAddresses, ProviderDeps, PullRequest,
    RetrievalProvider, RevalidationResult, TransferAction, TransferError, TransferEvent,
    ValidationResult, VoucherLedger,
};
use wharf_types::events::EventBus;
use wharf_types::*;

/// Storage provider address every test deal is made with.
pub const PROVIDER: Address = Address::from_bytes([5u8; 32]);
/// Address clients are told to pay.
pub const PAYMENT: Address = Address::from_bytes([6u8; 32]);
/// Peer id of the provider node.
pub const SELF_PEER: PeerId = PeerId::from_bytes([9u8; 32]);
/// Block size shards are indexed with.
pub const BLOCK_SIZE: u32 = 64;

// =========================================================================
// Recording transport
// =========================================================================

/// How the provider has driven one channel so far.
#[derive(Debug, Clone, Default)]
pub struct ChannelView {
    pub paused: bool,
    pub closed: bool,
    /// Pause calls, including repeated ones.
    pub pauses: usize,
    pub resumes: usize,
    /// Voucher results in the order they were sent.
    pub results: Vec<DealResponse>,
}

/// Transport double that keeps a [`ChannelView`] per channel.
#[derive(Default)]
pub struct ChannelTransport {
    voucher_types: Mutex<Vec<&'static str>>,
    channels: Mutex<HashMap<ChannelId, ChannelView>>,
}

impl ChannelTransport {
    /// Snapshot of `chid`. Unknown channels read as untouched.
    pub fn view(&self, chid: &ChannelId) -> ChannelView {
        self.channels.lock().unwrap().get(chid).cloned().unwrap_or_default()
    }

    pub fn voucher_types(&self) -> Vec<&'static str> {
        self.voucher_types.lock().unwrap().clone()
    }

    fn update(
        &self,
        chid: ChannelId,
        f: impl FnOnce(&mut ChannelView),
    ) -> Result<(), TransferError> {
        let mut channels = self.channels.lock().unwrap();
        let view = channels.entry(chid).or_default();
        if view.closed {
            return Err(TransferError::AlreadyTerminated(chid));
        }
        f(view);
        Ok(())
    }
}

#[async_trait]
impl DataTransfer for ChannelTransport {
    async fn register_voucher_type(&self, type_id: &'static str) -> Result<(), TransferError> {
        self.voucher_types.lock().unwrap().push(type_id);
        Ok(())
    }

    async fn pause(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.update(chid, |v| {
            v.paused = true;
            v.pauses += 1;
        })
    }

    async fn resume(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.update(chid, |v| {
            v.paused = false;
            v.resumes += 1;
        })
    }

    async fn close(&self, chid: ChannelId) -> Result<(), TransferError> {
        self.update(chid, |v| v.closed = true)
    }

    async fn send_voucher_result(
        &self,
        chid: ChannelId,
        response: DealResponse,
    ) -> Result<(), TransferError> {
        self.update(chid, |v| v.results.push(response))
    }
}

// =========================================================================
// TestNode
// =========================================================================

/// A payload stored in the node's piece store with a backing storage deal.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub payload_cid: PayloadCid,
    pub piece_cid: PieceCid,
    pub proposal_cid: ProposalCid,
    pub data: Bytes,
}

/// A retrieval provider with every collaborator wired in-process.
pub struct TestNode {
    dir: Arc<TempDir>,
    payment: PaymentAddresses,
    pub meta: Arc<MetaStore>,
    pub events: EventBus,
    pub pieces: Arc<MemoryPieceStore>,
    pub dagstore: Arc<DagStoreWrapper>,
    pub transfer: Arc<ChannelTransport>,
    pub provider: Arc<RetrievalProvider>,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_payment(PaymentAddresses::new().with(PROVIDER, PAYMENT))
    }

    /// A node whose payment address table is `payment`.
    pub fn with_payment(payment: PaymentAddresses) -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        Self::open(dir, Arc::new(MemoryPieceStore::new()), payment)
    }

    fn open(dir: Arc<TempDir>, pieces: Arc<MemoryPieceStore>, payment: PaymentAddresses) -> Self {
        let meta = Arc::new(MetaStore::open(dir.path().join("meta")).unwrap());
        let events = EventBus::new();
        let mounts = MountRegistry::new().with(Arc::new(PieceMountFactory::new(pieces.clone())));

        let mut store_config = DagStoreConfig::new(dir.path().join("transients"));
        store_config.block_size = BLOCK_SIZE;
        let store = DagStore::open(meta.clone(), &mounts, store_config, events.clone()).unwrap();
        let mut wrapper_config = WrapperConfig::new(dir.path());
        wrapper_config.gc_interval = Duration::from_millis(50);
        let dagstore = Arc::new(DagStoreWrapper::new(
            store,
            pieces.clone(),
            mounts,
            wrapper_config,
        ));

        let transfer = Arc::new(ChannelTransport::default());
        let provider = Arc::new(RetrievalProvider::new(
            PROVIDER,
            ProviderDeps {
                meta: meta.clone(),
                events: events.clone(),
                dagstore: dagstore.clone(),
                pieces: pieces.clone(),
                transfer: transfer.clone(),
                paych: Arc::new(VoucherLedger::new()),
                payment: Arc::new(payment.clone()),
                pricing: Arc::new(DefaultPricing::default()),
                decider: Arc::new(AcceptAll),
            },
        ));

        Self {
            dir,
            payment,
            meta,
            events,
            pieces,
            dagstore,
            transfer,
            provider,
        }
    }

    /// Start the dagstore loops and the provider.
    pub async fn start(&self) {
        self.dagstore.start();
        self.provider.start().await.unwrap();
    }

    pub async fn close(&self) {
        self.provider.close();
        self.dagstore.close().await;
    }

    /// Close the node and reopen it over the same data directory and piece
    /// store. The returned node is not started.
    pub async fn restart(self) -> Self {
        self.close().await;
        let Self {
            dir,
            payment,
            pieces,
            meta,
            events,
            dagstore,
            transfer,
            provider,
        } = self;
        drop((provider, dagstore, transfer, events, meta));
        // Give tasks that still hold the old store a moment to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self::open(dir, pieces, payment)
    }

    /// Store `len` bytes derived from `seed` as a piece, plus the storage
    /// deal that makes `payload_cid` retrievable from it.
    pub async fn add_payload(&self, seed: u8, len: usize, sealed: bool) -> StoredPayload {
        let data = Bytes::from(test_data(seed, len));
        let piece_cid = if sealed {
            self.pieces.put_sealed(data.clone())
        } else {
            self.pieces.put(data.clone()).await.unwrap()
        };
        let payload_cid = PayloadCid::from([seed; 32]);
        let proposal_cid = ProposalCid::from([seed; 32]);
        self.meta
            .put_miner_deal(&MinerDeal {
                proposal_cid,
                client: PeerId::from([seed; 32]),
                provider: PROVIDER,
                payload_cid,
                piece_cid,
                piece_size: data.len() as u64,
                state: MinerDealState::Active,
                sector: seed as u64,
                offset: 0,
                length: data.len() as u64,
                verified: false,
                fast_retrieval: true,
            })
            .unwrap();
        StoredPayload {
            payload_cid,
            piece_cid,
            proposal_cid,
            data,
        }
    }

    pub fn set_ask(&self, ask: RetrievalAsk) {
        self.provider.set_ask(&ask).unwrap();
    }

    /// The stored deal. Panics if it does not exist.
    pub fn deal(&self, id: &ProviderDealIdentifier) -> ProviderDealState {
        self.provider.get_deal(id).unwrap().expect("deal should exist")
    }

    /// Poll until deal `id` reaches `status`.
    pub async fn wait_for_status(&self, id: &ProviderDealIdentifier, status: DealStatus) {
        eventually(&format!("deal {id} to reach {status}"), || {
            self.provider.get_deal(id).unwrap().map(|d| d.status) == Some(status)
        })
        .await;
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Client
// =========================================================================

/// Terms a client proposes.
pub fn params(price: u64, interval: u64, increase: u64, unseal: u64) -> DealParams {
    DealParams {
        selector: None,
        piece_cid: None,
        price_per_byte: TokenAmount::from(price),
        payment_interval: interval,
        payment_interval_increase: increase,
        unseal_price: TokenAmount::from(unseal),
    }
}

/// A retrieval client identified by its peer id. Each client pays from its
/// own payment channel.
pub struct Client {
    pub peer: PeerId,
    pub paych: Address,
}

impl Client {
    pub fn new(seed: u8) -> Self {
        Self {
            peer: PeerId::from([seed; 32]),
            paych: Address::from([seed; 32]),
        }
    }

    /// Open a pull for `payload` on a fresh channel and have the provider
    /// validate it.
    pub async fn propose<'a>(
        &self,
        node: &'a TestNode,
        deal: u64,
        payload: PayloadCid,
        params: DealParams,
    ) -> Retrieval<'a> {
        let proposal = DealProposal {
            id: DealId(deal),
            payload_cid: payload,
            params,
        };
        let chid = ChannelId {
            initiator: self.peer,
            responder: SELF_PEER,
            id: deal,
        };
        let request = PullRequest {
            channel_id: chid,
            receiver: self.peer,
            voucher: Voucher::encode(&proposal).unwrap(),
            base_cid: payload,
            selector: ALL_SELECTOR_BYTES.to_vec(),
        };
        let validation = node.provider.validate_pull(&request).await.unwrap();
        Retrieval {
            node,
            chid,
            id: ProviderDealIdentifier {
                receiver: self.peer,
                deal_id: proposal.id,
            },
            proposal,
            paych: self.paych,
            validation,
            nonce: 0,
            paid: TokenAmount::ZERO,
            received: Vec::new(),
            payments: Vec::new(),
        }
    }
}

/// One pull in progress.
pub struct Retrieval<'a> {
    node: &'a TestNode,
    pub chid: ChannelId,
    pub id: ProviderDealIdentifier,
    pub proposal: DealProposal,
    paych: Address,
    pub validation: ValidationResult,
    nonce: u64,
    /// Cumulative amount of every voucher sent so far.
    pub paid: TokenAmount,
    /// Payload bytes in the order they were sent.
    pub received: Vec<u8>,
    /// Amount of each payment made, in order.
    pub payments: Vec<TokenAmount>,
}

impl Retrieval<'_> {
    /// Status the provider answered the proposal with.
    pub fn status(&self) -> DealStatus {
        self.validation
            .response
            .as_ref()
            .map(|r| r.status)
            .expect("validation carries a response")
    }

    /// Raise a transport event on this pull's channel.
    pub async fn event(&self, event: TransferEvent) -> Option<RevalidationResult> {
        self.node.provider.on_event(self.chid, event).await.unwrap()
    }

    /// Send a voucher raising the cumulative amount by `amount`.
    pub async fn pay(&mut self, amount: TokenAmount) -> Option<RevalidationResult> {
        self.nonce += 1;
        self.paid += amount;
        self.payments.push(amount);
        let payment = DealPayment {
            id: self.proposal.id,
            payment_channel: self.paych,
            payment_voucher: SignedVoucher {
                channel_addr: self.paych,
                lane: 0,
                nonce: self.nonce,
                amount: self.paid,
                signature: vec![0xaa],
            },
        };
        self.event(TransferEvent::NewVoucher(Voucher::encode(&payment).unwrap()))
            .await
    }

    /// Accept the channel, pay any unseal price, and wait until the
    /// provider resumes the transfer.
    pub async fn open(&mut self) {
        assert!(self.validation.accepted, "pull was rejected: {:?}", self.validation.response);
        self.event(TransferEvent::Accept).await;
        if self.status() == DealStatus::FundsNeededUnseal {
            let owed = self
                .validation
                .response
                .as_ref()
                .map(|r| r.payment_owed)
                .unwrap_or_default();
            self.pay(owed).await;
        }
        let transfer = self.node.transfer.clone();
        let chid = self.chid;
        eventually("transfer to resume", move || {
            let view = transfer.view(&chid);
            view.resumes > 0 && !view.paused
        })
        .await;
    }

    /// Stream every block of the deal's shard, paying each time the
    /// provider pauses, then finalize. Returns the last outcome.
    pub async fn run(&mut self) -> Option<RevalidationResult> {
        self.open().await;
        let blockstore = self.node.provider.blockstore(&self.id).unwrap();
        for hash in blockstore.hashes() {
            let block = blockstore.get(&hash).unwrap();
            self.received.extend_from_slice(&block);
            let outcome = self
                .node
                .provider
                .on_pull_data_sent(self.chid, block.len() as u64)
                .await
                .unwrap();
            self.settle(outcome).await;
        }
        let outcome = self.event(TransferEvent::BeginFinalizing).await;
        let outcome = self.settle(outcome).await;
        self.event(TransferEvent::Completed).await;
        outcome
    }

    /// Pay until the provider stops asking.
    async fn settle(
        &mut self,
        mut outcome: Option<RevalidationResult>,
    ) -> Option<RevalidationResult> {
        for _ in 0..16 {
            let owed = match &outcome {
                Some(RevalidationResult {
                    action: TransferAction::Pause,
                    response: Some(response),
                }) if !response.payment_owed.is_zero() => response.payment_owed,
                _ => return outcome,
            };
            outcome = self.pay(owed).await;
        }
        panic!("provider kept asking for payment on {}", self.chid);
    }
}

// =========================================================================
// Helpers
// =========================================================================

/// Deterministic, non-repeating test data, so no two blocks share a hash.
pub fn test_data(seed: u8, size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF ^ u32::from(seed);
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Poll `cond` for up to two seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
