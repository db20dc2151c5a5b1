//! Client - the public XenStore API.
//!
//! Every data operation is one [`Router::request`] carrying the id of the
//! transaction active on this client, or `0` outside a transaction.

use std::sync::Arc;

use crate::error::{Result, WireError, XsError};
use crate::monitor::Monitor;
use crate::protocol::{NUL, Operation};
use crate::router::Router;
use crate::transaction::{Transaction, is_ok};
use crate::transport::{TransportConfig, XsStream};
use crate::validate::{validate_path, validate_payload_bytes, validate_permissions};

/// One node yielded by [`Client::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: Vec<u8>,
    pub value: Vec<u8>,
    pub children: Vec<Vec<u8>>,
}

/// XenStore client.
///
/// Cloning shares the connection but not the transaction: a clone always
/// starts in direct mode.
#[derive(Debug)]
pub struct Client {
    router: Arc<Router>,
    transaction: Option<Transaction>,
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self::with_router(Arc::clone(&self.router))
    }
}

impl Client {
    /// Connect using the given transport settings.
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let transport = config.transport();
        let router = Router::connect(transport.as_ref()).await?;
        Ok(Self::with_router(Arc::new(router)))
    }

    /// Run a client over an already-open stream.
    pub fn from_stream(stream: Box<dyn XsStream>) -> Result<Self> {
        Ok(Self::with_router(Arc::new(Router::new(stream)?)))
    }

    /// Share an existing router.
    pub fn with_router(router: Arc<Router>) -> Self {
        Self {
            router,
            transaction: None,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn is_connected(&self) -> bool {
        self.router.is_connected()
    }

    /// Close the connection shared by this client, its clones and monitors.
    pub async fn close(&self) -> Result<()> {
        if let Some(tx) = self.transaction.as_ref().filter(|tx| tx.is_active()) {
            log::warn!("Closing XenStore client with uncommitted transaction {}", tx.id());
        }
        self.router.close().await
    }

    fn tx_id(&self) -> u32 {
        self.transaction.as_ref().map_or(0, Transaction::id)
    }

    async fn execute(&self, op: Operation, args: &[&[u8]]) -> Result<Vec<u8>> {
        for arg in args {
            validate_payload_bytes(arg)?;
        }
        let payload = args.concat();
        let mut reply = self.router.request(op, self.tx_id(), payload).await?;
        while reply.last() == Some(&NUL) {
            reply.pop();
        }
        Ok(reply)
    }

    async fn ack(&self, op: Operation, args: &[&[u8]]) -> Result<()> {
        debug_assert!(op.expects_ack(), "{} does not reply OK", op);
        let reply = self.execute(op, args).await?;
        if is_ok(&reply) {
            Ok(())
        } else {
            Err(XsError::UnexpectedPacket(format!(
                "{} replied {:?} instead of OK",
                op,
                String::from_utf8_lossy(&reply)
            )))
        }
    }

    /// Read the value stored at `path`.
    pub async fn read(&self, path: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        validate_path(path)?;
        self.execute(Operation::Read, &[path, &[NUL]]).await
    }

    /// Read `path`, falling back to `default` if it does not exist.
    pub async fn read_or(
        &self,
        path: impl AsRef<[u8]>,
        default: impl Into<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        match self.read(path).await {
            Err(e) if e.is_not_found() => Ok(default.into()),
            other => other,
        }
    }

    pub async fn write(&self, path: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        validate_path(path)?;
        self.ack(Operation::Write, &[path, &[NUL], value.as_ref()]).await
    }

    /// Create `path` and any missing parents with empty values.
    pub async fn mkdir(&self, path: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        validate_path(path)?;
        self.ack(Operation::Mkdir, &[path, &[NUL]]).await
    }

    /// Delete `path` and everything below it.
    ///
    /// A missing `path` is fine; a missing parent is not.
    pub async fn rm(&self, path: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        validate_path(path)?;
        self.ack(Operation::Rm, &[path, &[NUL]]).await
    }

    /// Names of the immediate children of `path`.
    pub async fn list(&self, path: impl AsRef<[u8]>) -> Result<Vec<Vec<u8>>> {
        let path = path.as_ref();
        validate_path(path)?;
        let reply = self.execute(Operation::Directory, &[path, &[NUL]]).await?;
        Ok(split_nul(&reply))
    }

    pub async fn exists(&self, path: impl AsRef<[u8]>) -> Result<bool> {
        match self.list(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Permission entries of `path`, owner first.
    pub async fn get_permissions(&self, path: impl AsRef<[u8]>) -> Result<Vec<Vec<u8>>> {
        let path = path.as_ref();
        validate_path(path)?;
        let reply = self.execute(Operation::GetPerms, &[path, &[NUL]]).await?;
        Ok(split_nul(&reply))
    }

    pub async fn set_permissions<P: AsRef<[u8]>>(
        &self,
        path: impl AsRef<[u8]>,
        perms: &[P],
    ) -> Result<()> {
        let path = path.as_ref();
        validate_path(path)?;
        validate_permissions(perms)?;

        let mut args: Vec<&[u8]> = Vec::with_capacity(2 + 2 * perms.len());
        args.push(path);
        args.push(&[NUL]);
        for perm in perms {
            args.push(perm.as_ref());
            args.push(&[NUL]);
        }
        self.ack(Operation::SetPerms, &args).await
    }

    /// Depth-first, top-down listing of the tree rooted at `top`.
    ///
    /// Nodes whose value cannot be read get an empty value.
    pub async fn walk(&self, top: impl AsRef<[u8]>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut stack = vec![top.as_ref().to_vec()];

        while let Some(path) = stack.pop() {
            let children = self.list(&path).await?;
            let value = match self.read(&path).await {
                Ok(value) => value,
                Err(e) if e.is_connection() => return Err(e),
                Err(_) => Vec::new(),
            };
            for child in children.iter().rev() {
                stack.push(join_path(&path, child));
            }
            nodes.push(Node {
                path,
                value,
                children,
            });
        }
        Ok(nodes)
    }

    /// Base path of a domain, e.g. `/local/domain/<domid>`.
    pub async fn get_domain_path(&self, domid: u32) -> Result<Vec<u8>> {
        let domid = decimal(domid);
        self.execute(Operation::GetDomainPath, &[&domid, &[NUL]]).await
    }

    pub async fn is_domain_introduced(&self, domid: u32) -> Result<bool> {
        let domid = decimal(domid);
        let reply = self
            .execute(Operation::IsDomainIntroduced, &[&domid, &[NUL]])
            .await?;
        match reply.as_slice() {
            b"T" => Ok(true),
            b"F" => Ok(false),
            other => Err(XsError::UnexpectedPacket(format!(
                "IS_DOMAIN_INTRODUCED replied {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Tell xenstored to start talking to a domain.
    pub async fn introduce_domain(&self, domid: u32, mfn: u64, eventchn: u32) -> Result<()> {
        if domid == 0 {
            return Err(XsError::invalid_operation("domain 0 cannot be introduced"));
        }
        let (domid, mfn, eventchn) = (decimal(domid), decimal(mfn), decimal(eventchn));
        self.ack(
            Operation::Introduce,
            &[&domid, &[NUL], &mfn, &[NUL], &eventchn, &[NUL]],
        )
        .await
    }

    pub async fn release_domain(&self, domid: u32) -> Result<()> {
        let domid = decimal(domid);
        self.ack(Operation::Release, &[&domid, &[NUL]]).await
    }

    /// Clear a domain's shutdown flag so its next shutdown fires watches.
    pub async fn resume_domain(&self, domid: u32) -> Result<()> {
        let domid = decimal(domid);
        self.ack(Operation::Resume, &[&domid, &[NUL]]).await
    }

    /// Give `domid` the privileges of `target`.
    pub async fn set_target(&self, domid: u32, target: u32) -> Result<()> {
        let (domid, target) = (decimal(domid), decimal(target));
        self.ack(Operation::SetTarget, &[&domid, &[NUL], &target, &[NUL]])
            .await
    }

    /// Drop this connection's privileges to those of `domid`.
    pub async fn restrict(&self, domid: u32) -> Result<()> {
        let domid = decimal(domid);
        self.ack(Operation::Restrict, &[&domid, &[NUL]]).await
    }

    /// Start a transaction on this client and return its id.
    pub async fn transaction(&mut self) -> Result<u32> {
        if let Some(tx) = self.transaction.as_ref().filter(|tx| tx.is_active()) {
            return Err(XsError::InvalidOperation {
                message: format!("transaction {} already in progress", tx.id()),
                code: Some(WireError::Already.code().to_string()),
            });
        }
        let tx = Transaction::begin(&self.router).await?;
        let id = tx.id();
        self.transaction = Some(tx);
        Ok(id)
    }

    /// Commit the current transaction.
    ///
    /// `Ok(false)` means a concurrent change won; start a new transaction
    /// and repeat the work. The transaction is finished either way.
    pub async fn commit(&mut self) -> Result<bool> {
        let mut tx = self.take_transaction()?;
        tx.end(&self.router, true).await
    }

    /// Discard the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        let mut tx = self.take_transaction()?;
        tx.end(&self.router, false).await.map(|_| ())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.as_ref().is_some_and(Transaction::is_active)
    }

    /// Id of the active transaction, `0` in direct mode.
    pub fn transaction_id(&self) -> u32 {
        self.tx_id()
    }

    fn take_transaction(&mut self) -> Result<Transaction> {
        self.transaction
            .take()
            .ok_or_else(|| XsError::invalid_operation("no transaction in progress"))
    }

    /// New monitor sharing this client's connection.
    pub fn monitor(&self) -> Result<Monitor> {
        Monitor::new(Arc::clone(&self.router))
    }
}

fn decimal(n: impl std::fmt::Display) -> Vec<u8> {
    n.to_string().into_bytes()
}

fn split_nul(payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload.split(|b| *b == NUL).map(<[u8]>::to_vec).collect()
}

fn join_path(parent: &[u8], child: &[u8]) -> Vec<u8> {
    let mut path = parent.to_vec();
    if !path.ends_with(b"/") {
        path.push(b'/');
    }
    path.extend_from_slice(child);
    path
}
