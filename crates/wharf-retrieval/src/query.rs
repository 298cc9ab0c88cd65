//! Answers price queries arriving over the query protocol.

use std::sync::Arc;

use tracing::{debug, warn};
use wharf_net::QueryResponder;
use wharf_piece::PieceAccessor;
use wharf_types::{QueryItemStatus, QueryRequest, QueryResponse, QueryResponseStatus};

use crate::ask::{AskHandler, PaymentAddressResolver, related_proposals};

/// Answers [`QueryRequest`]s with the ask of the first storage deal that has
/// a payment address.
pub struct QueryHandler {
    asks: Arc<AskHandler>,
    payment: Arc<dyn PaymentAddressResolver>,
    pieces: Arc<dyn PieceAccessor>,
}

impl QueryHandler {
    pub fn new(
        asks: Arc<AskHandler>,
        payment: Arc<dyn PaymentAddressResolver>,
        pieces: Arc<dyn PieceAccessor>,
    ) -> Self {
        Self { asks, payment, pieces }
    }

    /// Never fails: lookup errors are reported in the response status.
    pub async fn handle(&self, request: &QueryRequest) -> QueryResponse {
        let deals = match self
            .asks
            .resolve_deals(&request.payload_cid, request.piece_cid.as_ref())
        {
            Ok(deals) => deals,
            Err(e) => {
                warn!(
                    payload = %request.payload_cid,
                    error = %e,
                    "query: storage deal lookup failed"
                );
                return QueryResponse::error(format!("failed to look up storage deals: {e}"));
            }
        };
        if deals.is_empty() {
            debug!(
                payload = %request.payload_cid,
                piece = ?request.piece_cid,
                "query: no storage deals"
            );
            return QueryResponse::unavailable("no storage deals found for payload");
        }

        for deal in &deals {
            let Some(payment_address) = self.payment.payment_address(&deal.provider).await else {
                continue;
            };
            let related = related_proposals(&deals, &deal.piece_cid);
            let ask = match self
                .asks
                .get_ask_for_deal(request.payload_cid, deal, &related, None, &deal.provider)
                .await
            {
                Ok(ask) => ask,
                Err(e) => {
                    warn!(
                        payload = %request.payload_cid,
                        piece = %deal.piece_cid,
                        error = %e,
                        "query: pricing failed"
                    );
                    return QueryResponse::error(format!("failed to price retrieval: {e}"));
                }
            };
            let size = self
                .pieces
                .get_unpadded_size(deal.piece_cid)
                .await
                .unwrap_or(deal.piece_size);

            debug!(
                payload = %request.payload_cid,
                piece = %deal.piece_cid,
                size,
                "query: available"
            );
            return QueryResponse {
                status: QueryResponseStatus::Available,
                piece_cid_found: if request.piece_cid.is_some() {
                    QueryItemStatus::Available
                } else {
                    QueryItemStatus::Unknown
                },
                size,
                min_price_per_byte: ask.price_per_byte,
                max_payment_interval: ask.payment_interval,
                max_payment_interval_increase: ask.payment_interval_increase,
                unseal_price: ask.unseal_price,
                payment_address: Some(payment_address),
                message: String::new(),
            };
        }
        QueryResponse::error("no payment address configured for any storage deal")
    }
}

#[async_trait::async_trait]
impl QueryResponder for QueryHandler {
    async fn respond(&self, request: QueryRequest) -> QueryResponse {
        self.handle(&request).await
    }
}
