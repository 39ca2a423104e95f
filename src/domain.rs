//! Shared domain model (§2 component F): money, asset/currency identity, the canonical
//! transaction shape, accounts/cursors/sessions, transfer links, and cost-basis lots.

pub mod account;
pub mod asset;
pub mod dedup;
pub mod link;
pub mod lot;
pub mod money;
pub mod transaction;

pub use account::{Account, AccountType, CursorState, CursorType, CursorValue, ImportSession, ImportSessionStatus};
pub use asset::{AssetId, AssetKind, Currency};
pub use dedup::DedupRing;
pub use link::{LinkIndex, LinkType, TransactionLink};
pub use lot::{AcquisitionLot, LotDisposal, LotError, LotTransfer, Strategy};
pub use money::{Amount, MoneyError};
pub use transaction::{
    BlockchainContext, Fee, FeeScope, FeeSettlement, Movement, Movements, Note, NoteSeverity,
    Operation, OperationCategory, OperationType, Price, PriceAtTxTime, PriceGranularity,
    PriceSource, SourceType, Transaction, TransactionStatus,
};
