//! Transaction context threaded through requests.

use crate::error::{Result, WireError, XsError};
use crate::protocol::{NUL, Operation};
use crate::router::Router;

/// Where a transaction is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// A server-side transaction, identified by its non-zero id.
#[derive(Debug)]
pub struct Transaction {
    id: u32,
    state: TransactionState,
}

impl Transaction {
    /// Start a transaction.
    pub async fn begin(router: &Router) -> Result<Self> {
        let reply = router
            .request(Operation::TransactionStart, 0, vec![NUL])
            .await?;
        let id = parse_id(&reply)?;
        log::debug!("Started transaction {}", id);
        Ok(Self {
            id,
            state: TransactionState::Active,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// End the transaction, committing or discarding its writes.
    ///
    /// Returns `Ok(false)` when the server refuses a commit because of a
    /// conflicting transaction; the whole body must then be retried in a new
    /// transaction. The transaction is over after this call whatever the
    /// outcome.
    pub async fn end(&mut self, router: &Router, commit: bool) -> Result<bool> {
        if !self.is_active() {
            return Err(XsError::invalid_operation(format!(
                "transaction {} is already {}",
                self.id, self.state
            )));
        }

        let flag: &[u8] = if commit { b"T\0" } else { b"F\0" };
        let result = router
            .request(Operation::TransactionEnd, self.id, flag.to_vec())
            .await;

        let outcome = match result {
            Ok(reply) if is_ok(&reply) => Ok(true),
            Ok(reply) => Err(XsError::UnexpectedPacket(format!(
                "TRANSACTION_END replied {:?}",
                String::from_utf8_lossy(&reply)
            ))),
            Err(e) if commit && e.wire_code() == Some(WireError::Again.code()) => Ok(false),
            Err(e) if e.is_not_found() => Err(XsError::InvalidOperation {
                message: format!("transaction {} is not known to the server", self.id),
                code: e.wire_code().map(str::to_string),
            }),
            Err(e) => Err(e),
        };

        self.state = match outcome {
            Ok(true) if commit => TransactionState::Committed,
            _ => TransactionState::Aborted,
        };
        log::debug!("Transaction {} {}", self.id, self.state);
        outcome
    }
}

fn parse_id(reply: &[u8]) -> Result<u32> {
    let text = reply.strip_suffix(&[NUL]).unwrap_or(reply);
    let id = std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|id| *id != 0);
    id.ok_or_else(|| {
        XsError::UnexpectedPacket(format!(
            "invalid transaction id {:?}",
            String::from_utf8_lossy(reply)
        ))
    })
}

pub(crate) fn is_ok(reply: &[u8]) -> bool {
    reply.strip_suffix(&[NUL]).unwrap_or(reply) == b"OK"
}
