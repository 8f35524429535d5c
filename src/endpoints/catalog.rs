//! Static catalog of Kraken spot REST endpoints and their rate limit costs.

use std::borrow::Cow;

use super::EndpointDescriptor;
use crate::rate_limit::AgePenaltyKind;
use crate::types::EndpointCategory;

/// Base URL path prefix for public endpoints.
pub const PUBLIC_PREFIX: &str = "/0/public/";
/// Base URL path prefix for private endpoints.
pub const PRIVATE_PREFIX: &str = "/0/private/";

/// Public endpoint names.
pub mod public {
    /// Get server time.
    pub const TIME: &str = "Time";
    /// Get system status.
    pub const SYSTEM_STATUS: &str = "SystemStatus";
    /// Get asset info.
    pub const ASSETS: &str = "Assets";
    /// Get tradable asset pairs.
    pub const ASSET_PAIRS: &str = "AssetPairs";
    /// Get ticker information.
    pub const TICKER: &str = "Ticker";
    /// Get OHLC data.
    pub const OHLC: &str = "OHLC";
    /// Get order book.
    pub const DEPTH: &str = "Depth";
    /// Get recent trades.
    pub const TRADES: &str = "Trades";
    /// Get recent spreads.
    pub const SPREAD: &str = "Spread";
}

/// Private endpoint names.
pub mod private {
    // Account endpoints
    /// Get account balance.
    pub const BALANCE: &str = "Balance";
    /// Get extended balance.
    pub const BALANCE_EX: &str = "BalanceEx";
    /// Get trade balance.
    pub const TRADE_BALANCE: &str = "TradeBalance";
    /// Get open orders.
    pub const OPEN_ORDERS: &str = "OpenOrders";
    /// Get closed orders.
    pub const CLOSED_ORDERS: &str = "ClosedOrders";
    /// Query orders info.
    pub const QUERY_ORDERS: &str = "QueryOrders";
    /// Get order amends.
    pub const ORDER_AMENDS: &str = "OrderAmends";
    /// Get trades history.
    pub const TRADES_HISTORY: &str = "TradesHistory";
    /// Query trades info.
    pub const QUERY_TRADES: &str = "QueryTrades";
    /// Get open positions.
    pub const OPEN_POSITIONS: &str = "OpenPositions";
    /// Get ledgers.
    pub const LEDGERS: &str = "Ledgers";
    /// Query ledgers.
    pub const QUERY_LEDGERS: &str = "QueryLedgers";
    /// Get trade volume.
    pub const TRADE_VOLUME: &str = "TradeVolume";

    // Export endpoints
    /// Request export report.
    pub const ADD_EXPORT: &str = "AddExport";
    /// Get export status.
    pub const EXPORT_STATUS: &str = "ExportStatus";
    /// Retrieve export report.
    pub const RETRIEVE_EXPORT: &str = "RetrieveExport";
    /// Remove export report.
    pub const REMOVE_EXPORT: &str = "RemoveExport";

    // Trading endpoints
    /// Add order.
    pub const ADD_ORDER: &str = "AddOrder";
    /// Add order batch.
    pub const ADD_ORDER_BATCH: &str = "AddOrderBatch";
    /// Amend order.
    pub const AMEND_ORDER: &str = "AmendOrder";
    /// Edit order.
    pub const EDIT_ORDER: &str = "EditOrder";
    /// Cancel order.
    pub const CANCEL_ORDER: &str = "CancelOrder";
    /// Cancel all orders.
    pub const CANCEL_ALL: &str = "CancelAll";
    /// Cancel all orders after timeout.
    pub const CANCEL_ALL_ORDERS_AFTER: &str = "CancelAllOrdersAfter";
    /// Cancel order batch.
    pub const CANCEL_ORDER_BATCH: &str = "CancelOrderBatch";

    // Funding endpoints
    /// Get deposit methods.
    pub const DEPOSIT_METHODS: &str = "DepositMethods";
    /// Get deposit addresses.
    pub const DEPOSIT_ADDRESSES: &str = "DepositAddresses";
    /// Get deposit status.
    pub const DEPOSIT_STATUS: &str = "DepositStatus";
    /// Get withdrawal methods.
    pub const WITHDRAW_METHODS: &str = "WithdrawMethods";
    /// Get withdrawal addresses.
    pub const WITHDRAW_ADDRESSES: &str = "WithdrawAddresses";
    /// Get withdrawal info.
    pub const WITHDRAW_INFO: &str = "WithdrawInfo";
    /// Withdraw funds.
    pub const WITHDRAW: &str = "Withdraw";
    /// Get withdrawal status.
    pub const WITHDRAW_STATUS: &str = "WithdrawStatus";
    /// Cancel withdrawal.
    pub const WITHDRAW_CANCEL: &str = "WithdrawCancel";
    /// Wallet transfer.
    pub const WALLET_TRANSFER: &str = "WalletTransfer";

    // Earn endpoints
    /// Allocate earn funds.
    pub const EARN_ALLOCATE: &str = "Earn/Allocate";
    /// Deallocate earn funds.
    pub const EARN_DEALLOCATE: &str = "Earn/Deallocate";
    /// Get earn allocation status.
    pub const EARN_ALLOCATE_STATUS: &str = "Earn/AllocateStatus";
    /// Get earn deallocation status.
    pub const EARN_DEALLOCATE_STATUS: &str = "Earn/DeallocateStatus";
    /// List earn strategies.
    pub const EARN_STRATEGIES: &str = "Earn/Strategies";
    /// List earn allocations.
    pub const EARN_ALLOCATIONS: &str = "Earn/Allocations";

    // WebSocket token
    /// Get WebSocket authentication token.
    pub const GET_WEBSOCKETS_TOKEN: &str = "GetWebSocketsToken";
}

const fn public(name: &'static str) -> EndpointDescriptor {
    EndpointDescriptor {
        name: Cow::Borrowed(name),
        category: EndpointCategory::Public,
        weight: 1,
        base_penalty_points: 0.0,
        max_requests_per_minute: 60,
        requires_auth: false,
        is_trading_endpoint: false,
        age_penalty: None,
    }
}

const fn account(name: &'static str, cost: u32) -> EndpointDescriptor {
    EndpointDescriptor {
        name: Cow::Borrowed(name),
        category: EndpointCategory::Private,
        weight: cost,
        base_penalty_points: cost as f64,
        max_requests_per_minute: 20,
        requires_auth: true,
        is_trading_endpoint: false,
        age_penalty: None,
    }
}

const fn trading(
    name: &'static str,
    base_penalty_points: f64,
    age_penalty: Option<AgePenaltyKind>,
) -> EndpointDescriptor {
    EndpointDescriptor {
        name: Cow::Borrowed(name),
        category: EndpointCategory::Private,
        weight: 1,
        base_penalty_points,
        max_requests_per_minute: 60,
        requires_auth: true,
        is_trading_endpoint: true,
        age_penalty,
    }
}

/// Every known endpoint.
pub static ENDPOINTS: &[EndpointDescriptor] = &[
    public(public::TIME),
    public(public::SYSTEM_STATUS),
    public(public::ASSETS),
    public(public::ASSET_PAIRS),
    public(public::TICKER),
    public(public::OHLC),
    public(public::DEPTH),
    public(public::TRADES),
    public(public::SPREAD),
    account(private::BALANCE, 1),
    account(private::BALANCE_EX, 1),
    account(private::TRADE_BALANCE, 1),
    account(private::OPEN_ORDERS, 1),
    account(private::CLOSED_ORDERS, 1),
    account(private::QUERY_ORDERS, 1),
    account(private::ORDER_AMENDS, 1),
    // History and ledger queries cost double.
    account(private::TRADES_HISTORY, 2),
    account(private::QUERY_TRADES, 2),
    account(private::OPEN_POSITIONS, 1),
    account(private::LEDGERS, 2),
    account(private::QUERY_LEDGERS, 2),
    account(private::TRADE_VOLUME, 1),
    account(private::ADD_EXPORT, 1),
    account(private::EXPORT_STATUS, 1),
    account(private::RETRIEVE_EXPORT, 1),
    account(private::REMOVE_EXPORT, 1),
    trading(private::ADD_ORDER, 1.0, None),
    trading(private::ADD_ORDER_BATCH, 1.0, None),
    trading(private::AMEND_ORDER, 1.0, Some(AgePenaltyKind::Amend)),
    trading(private::EDIT_ORDER, 1.0, Some(AgePenaltyKind::Edit)),
    trading(private::CANCEL_ORDER, 0.0, Some(AgePenaltyKind::Cancel)),
    trading(private::CANCEL_ALL, 1.0, None),
    trading(private::CANCEL_ALL_ORDERS_AFTER, 1.0, None),
    trading(private::CANCEL_ORDER_BATCH, 0.0, Some(AgePenaltyKind::Cancel)),
    account(private::DEPOSIT_METHODS, 1),
    account(private::DEPOSIT_ADDRESSES, 1),
    account(private::DEPOSIT_STATUS, 1),
    account(private::WITHDRAW_METHODS, 1),
    account(private::WITHDRAW_ADDRESSES, 1),
    account(private::WITHDRAW_INFO, 1),
    account(private::WITHDRAW, 1),
    account(private::WITHDRAW_STATUS, 1),
    account(private::WITHDRAW_CANCEL, 1),
    account(private::WALLET_TRANSFER, 1),
    account(private::EARN_ALLOCATE, 1),
    account(private::EARN_DEALLOCATE, 1),
    account(private::EARN_ALLOCATE_STATUS, 1),
    account(private::EARN_DEALLOCATE_STATUS, 1),
    account(private::EARN_STRATEGIES, 1),
    account(private::EARN_ALLOCATIONS, 1),
    account(private::GET_WEBSOCKETS_TOKEN, 1),
];

/// Descriptor used for names missing from [`ENDPOINTS`].
///
/// Priced like the most expensive private query.
pub(crate) fn fallback(name: &str) -> EndpointDescriptor {
    EndpointDescriptor {
        name: Cow::Owned(name.to_string()),
        category: EndpointCategory::Private,
        weight: 2,
        base_penalty_points: 2.0,
        max_requests_per_minute: 15,
        requires_auth: true,
        is_trading_endpoint: false,
        age_penalty: None,
    }
}
