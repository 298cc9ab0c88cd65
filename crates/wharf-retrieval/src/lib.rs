//! Retrieval market provider.
//!
//! A client asks for a price over the query protocol ([`QueryHandler`]),
//! then opens a pull transfer carrying a deal proposal. The
//! [`RequestValidator`] checks the proposal against the current ask,
//! persists the deal and pauses the transfer. The [`DealHandler`] loads the
//! deal's shard and resumes the channel; from then on the [`Revalidator`]
//! meters bytes sent against payment vouchers, pausing whenever a payment
//! interval is crossed, until the final payment completes the deal.
//!
//! [`RetrievalProvider`] wires all of it together and is the surface the
//! data-transfer transport talks to.

pub mod ask;
pub mod deals;
pub mod error;
pub mod handler;
pub mod legacy;
pub mod paych;
pub mod provider;
pub mod query;
pub mod revalidator;
pub mod subscriber;
pub mod tracker;
pub mod transfer;
pub mod validator;

pub use ask::{
    AskHandler, DefaultPricing, PaymentAddressResolver, PaymentAddresses, PricingContext,
    PricingFunc, PricingInput, PricingInputProvider, StoredDealInputs,
};
pub use deals::DealStore;
pub use error::{Result, RetrievalError};
pub use handler::DealHandler;
pub use legacy::LegacyRevalidator;
pub use paych::{PaymentChannel, VoucherLedger};
pub use provider::{ProviderDeps, RetrievalProvider, VOUCHER_TYPES};
pub use query::QueryHandler;
pub use revalidator::{PaymentRevalidator, Revalidator, payment_owed};
pub use subscriber::EventSubscriber;
pub use tracker::{ReadOnlyBlockstoreTracker, TrackerError};
pub use transfer::{
    DataTransfer, RevalidationResult, TransferAction, TransferError, TransferEvent,
    ValidationResult,
};
pub use validator::{AcceptAll, DealDecider, PullRequest, RequestValidator};
