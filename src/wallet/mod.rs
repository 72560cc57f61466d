//! Fund ingress and egress: deposits, withdrawals, external collaborators.

pub mod amount;
pub mod custodian;
pub mod deposits;
pub mod ledger_rpc;
pub mod withdrawals;

pub use amount::parse_amount_micro;
pub use custodian::{CustodialProvider, HttpCustodian, MockCustodian};
pub use deposits::DepositMonitor;
pub use ledger_rpc::{HttpLedgerRpc, LedgerRpc, MockLedger, TransferDetail};
pub use withdrawals::{JobQueue, WithdrawalPipeline};
