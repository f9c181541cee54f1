//! Local transactions that group deletes of locked messages and sends. Operations are recorded
//!  while the transaction is active and applied all-or-nothing on commit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::delivery::destination::Destination;
use crate::delivery::message::{MessageHandle, SessionId};
use crate::error::{ErrorKind, MqError, MqResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    RolledBack,
    /// commit failed part way, some operations may have been applied
    Unknown,
}

/// Gets told about the outcome of deletes it made under a transaction
pub trait DeleteParticipant: Send + Sync + 'static {
    /// called before a rolled back delete becomes visible again. Returning a duration hides the
    ///  message for that long.
    fn delete_rolled_back(&self, handle: MessageHandle, redelivery_count: u32) -> Option<Duration>;
    fn delete_committed(&self, handle: MessageHandle);
    /// called once per participant after all of a rollback's operations were undone
    fn rollback_completed(&self);
}

enum PendingOperation {
    Delete {
        destination: Arc<Destination>,
        handle: MessageHandle,
        owner: SessionId,
        participant: Option<Arc<dyn DeleteParticipant>>,
    },
    Send {
        destination: Arc<Destination>,
        payload: Bytes,
    },
}

struct TransactionData {
    state: TransactionState,
    rollback_only: bool,
    operations: Vec<PendingOperation>,
}

struct TransactionInner {
    id: u64,
    data: Mutex<TransactionData>,
}

/// The handle passed to send, receive and delete operations
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction({}, {:?})", self.id(), self.state())
    }
}

impl Transaction {
    pub(crate) fn new(id: u64) -> Transaction {
        Transaction {
            inner: Arc::new(TransactionInner {
                id,
                data: Mutex::new(TransactionData {
                    state: TransactionState::Active,
                    rollback_only: false,
                    operations: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.data.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The transaction can no longer commit, a commit attempt rolls it back
    pub fn set_rollback_only(&self) {
        self.inner.data.lock().unwrap().rollback_only = true;
    }

    pub fn num_pending_operations(&self) -> usize {
        self.inner.data.lock().unwrap().operations.len()
    }

    pub(crate) fn check_active(&self) -> MqResult<()> {
        Self::check_data_active(self.inner.id, &self.inner.data.lock().unwrap())
    }

    fn check_data_active(id: u64, data: &TransactionData) -> MqResult<()> {
        if data.state != TransactionState::Active {
            return Err(MqError::incorrect_call(format!("transaction {} is {:?}", id, data.state)));
        }
        Ok(())
    }

    /// Deletes a locked message under this transaction: it leaves its owner's locks right away,
    ///  and is removed on commit
    pub(crate) fn delete_locked(&self, destination: &Arc<Destination>, handle: MessageHandle, owner: SessionId, participant: Option<Arc<dyn DeleteParticipant>>) -> MqResult<()> {
        let mut data = self.inner.data.lock().unwrap();
        Self::check_data_active(self.inner.id, &data)?;

        destination.delete_under_transaction(handle, owner, self.inner.id)?;
        data.operations.push(PendingOperation::Delete {
            destination: destination.clone(),
            handle,
            owner,
            participant,
        });
        Ok(())
    }

    pub(crate) fn send(&self, destination: &Arc<Destination>, payload: Bytes) -> MqResult<()> {
        let mut data = self.inner.data.lock().unwrap();
        Self::check_data_active(self.inner.id, &data)?;
        data.operations.push(PendingOperation::Send {
            destination: destination.clone(),
            payload,
        });
        Ok(())
    }

    fn validate(id: u64, operations: &[PendingOperation]) -> MqResult<()> {
        let mut sends_per_destination: Vec<(&Arc<Destination>, usize)> = Vec::new();

        for op in operations {
            match op {
                PendingOperation::Delete { destination, handle, .. } => {
                    if !destination.is_pending_delete(*handle, id) {
                        return Err(MqError::new(ErrorKind::Rollback, format!("{:?} in {} is no longer locked to the transaction", handle, destination.name())));
                    }
                }
                PendingOperation::Send { destination, .. } => {
                    match sends_per_destination.iter_mut().find(|(d, _)| Arc::ptr_eq(d, destination)) {
                        Some((_, n)) => *n += 1,
                        None => sends_per_destination.push((destination, 1)),
                    }
                }
            }
        }

        for (destination, n) in sends_per_destination {
            if !destination.has_room_for(n) {
                return Err(MqError::new(ErrorKind::Rollback, format!("destination {} has no room for {} messages", destination.name(), n)));
            }
        }
        Ok(())
    }

    /// Validates, then applies everything. Validation failure rolls back and returns
    ///  Rollback, a failure while applying leaves the outcome unknown.
    fn do_commit(&self) -> MqResult<()> {
        let id = self.inner.id;
        let mut data = self.inner.data.lock().unwrap();
        match data.state {
            TransactionState::Active | TransactionState::Prepared => {}
            other => return Err(MqError::incorrect_call(format!("transaction {} is {:?}", id, other))),
        }
        let operations = std::mem::take(&mut data.operations);

        let validation = if data.rollback_only {
            Err(MqError::new(ErrorKind::Rollback, format!("transaction {} is marked rollback-only", id)))
        }
        else {
            Self::validate(id, &operations)
        };
        if let Err(e) = validation {
            debug!("transaction {} cannot commit: {}", id, e);
            data.state = TransactionState::RolledBack;
            drop(data);
            Self::undo(id, operations);
            return Err(e);
        }

        let mut committed = Vec::new();
        for op in &operations {
            let result = match op {
                PendingOperation::Delete { destination, handle, participant, .. } => {
                    destination.commit_delete(*handle, id)
                        .map(|_| if let Some(p) = participant { committed.push((p.clone(), *handle)); })
                }
                PendingOperation::Send { destination, payload } => {
                    destination.put(payload.clone()).map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!("transaction {} failed part way through its commit: {}", id, e);
                data.state = TransactionState::Unknown;
                return Err(MqError::new(ErrorKind::Resource, format!("commit of transaction {} failed, outcome unknown: {}", id, e)));
            }
        }

        data.state = TransactionState::Committed;
        drop(data);
        debug!("committed transaction {} with {} operations", id, operations.len());

        for (participant, handle) in committed {
            participant.delete_committed(handle);
        }
        Ok(())
    }

    fn do_rollback(&self) -> MqResult<()> {
        let id = self.inner.id;
        let operations = {
            let mut data = self.inner.data.lock().unwrap();
            match data.state {
                TransactionState::Active | TransactionState::Prepared => {}
                other => return Err(MqError::incorrect_call(format!("transaction {} is {:?}", id, other))),
            }
            data.state = TransactionState::RolledBack;
            std::mem::take(&mut data.operations)
        };
        debug!("rolling back transaction {} with {} operations", id, operations.len());
        Self::undo(id, operations);
        Ok(())
    }

    /// Pending deletes become available again with an increment, pending sends are discarded
    fn undo(id: u64, operations: Vec<PendingOperation>) {
        let mut participants: Vec<Arc<dyn DeleteParticipant>> = Vec::new();

        for op in operations {
            if let PendingOperation::Delete { destination, handle, owner, participant } = op {
                let hide_for = participant.as_ref().and_then(|p| {
                    let redelivery_count = destination.message(handle).map(|m| m.redelivery_count).unwrap_or(0);
                    p.delete_rolled_back(handle, redelivery_count)
                });
                if let Err(e) = destination.rollback_delete(handle, id, owner, hide_for) {
                    warn!("could not roll back delete of {:?}: {}", handle, e);
                }
                if let Some(p) = participant {
                    if !participants.iter().any(|known| Arc::ptr_eq(known, &p)) {
                        participants.push(p);
                    }
                }
            }
        }

        for p in participants {
            p.rollback_completed();
        }
    }
}

/// A transaction the application commits or rolls back itself
#[derive(Debug, Clone)]
pub struct UncoordinatedTransaction {
    transaction: Transaction,
}

impl UncoordinatedTransaction {
    pub fn new(id: u64) -> UncoordinatedTransaction {
        UncoordinatedTransaction { transaction: Transaction::new(id) }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    pub fn commit(&self) -> MqResult<()> {
        self.transaction.check_active()?;
        self.transaction.do_commit()
    }

    pub fn rollback(&self) -> MqResult<()> {
        self.transaction.check_active()?;
        self.transaction.do_rollback()
    }
}

/// A transaction driven by an external coordinator through two-phase commit
#[derive(Debug, Clone)]
pub struct XaResource {
    transaction: Transaction,
}

impl XaResource {
    pub fn new(id: u64) -> XaResource {
        XaResource { transaction: Transaction::new(id) }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Validates the transaction's operations. After a successful prepare, the transaction
    ///  accepts no more operations and can only be committed or rolled back.
    pub fn prepare(&self) -> MqResult<()> {
        let id = self.transaction.id();
        let mut data = self.transaction.inner.data.lock().unwrap();
        Transaction::check_data_active(id, &data)?;

        let validation = if data.rollback_only {
            Err(MqError::new(ErrorKind::Rollback, format!("transaction {} is marked rollback-only", id)))
        }
        else {
            Transaction::validate(id, &data.operations)
        };
        match validation {
            Ok(()) => {
                data.state = TransactionState::Prepared;
                Ok(())
            }
            Err(e) => {
                data.state = TransactionState::RolledBack;
                let operations = std::mem::take(&mut data.operations);
                drop(data);
                Transaction::undo(id, operations);
                Err(e)
            }
        }
    }

    pub fn commit(&self, one_phase: bool) -> MqResult<()> {
        let expected = if one_phase { TransactionState::Active } else { TransactionState::Prepared };
        let state = self.transaction.state();
        if state != expected {
            return Err(MqError::incorrect_call(format!("{} commit of a transaction that is {:?}", if one_phase { "one-phase" } else { "two-phase" }, state)));
        }
        self.transaction.do_commit()
    }

    pub fn rollback(&self) -> MqResult<()> {
        self.transaction.do_rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationConfig;
    use rstest::rstest;

    const OWNER: SessionId = SessionId(1);

    #[derive(Default)]
    struct RecordingParticipant {
        rolled_back: Mutex<Vec<(MessageHandle, u32)>>,
        committed: Mutex<Vec<MessageHandle>>,
        num_rollbacks: Mutex<usize>,
        hide_for: Option<Duration>,
    }

    impl DeleteParticipant for RecordingParticipant {
        fn delete_rolled_back(&self, handle: MessageHandle, redelivery_count: u32) -> Option<Duration> {
            self.rolled_back.lock().unwrap().push((handle, redelivery_count));
            self.hide_for
        }
        fn delete_committed(&self, handle: MessageHandle) {
            self.committed.lock().unwrap().push(handle);
        }
        fn rollback_completed(&self) {
            *self.num_rollbacks.lock().unwrap() += 1;
        }
    }

    fn destination_with(n: usize) -> (Arc<Destination>, Vec<MessageHandle>) {
        let destination = Destination::new("q", DestinationConfig::default());
        let handles = (0..n)
            .map(|i| destination.put(Bytes::from(format!("m{}", i))).unwrap())
            .collect();
        destination.lock_batch(OWNER, n, None);
        (destination, handles)
    }

    #[test]
    fn test_commit_applies_exactly_once() {
        let (destination, handles) = destination_with(2);
        let participant = Arc::new(RecordingParticipant::default());
        let tran = UncoordinatedTransaction::new(1);

        for h in &handles {
            tran.transaction().delete_locked(&destination, *h, OWNER, Some(participant.clone())).unwrap();
        }
        tran.transaction().send(&destination, Bytes::from_static(b"new")).unwrap();
        // nothing visible before commit
        assert_eq!(destination.num_available(), 0);
        assert_eq!(destination.depth(), 2);

        tran.commit().unwrap();
        assert_eq!(tran.state(), TransactionState::Committed);
        assert_eq!(destination.depth(), 1);
        assert_eq!(destination.num_available(), 1);
        assert_eq!(*participant.committed.lock().unwrap(), handles);

        assert_eq!(tran.commit().unwrap_err().kind, ErrorKind::IncorrectCall);
        assert_eq!(tran.rollback().unwrap_err().kind, ErrorKind::IncorrectCall);
        assert_eq!(destination.depth(), 1);
    }

    #[test]
    fn test_rollback() {
        let (destination, handles) = destination_with(2);
        let participant = Arc::new(RecordingParticipant::default());
        let tran = UncoordinatedTransaction::new(1);
        for h in &handles {
            tran.transaction().delete_locked(&destination, *h, OWNER, Some(participant.clone())).unwrap();
        }
        tran.transaction().send(&destination, Bytes::from_static(b"new")).unwrap();

        tran.rollback().unwrap();
        assert_eq!(tran.state(), TransactionState::RolledBack);
        assert_eq!(destination.depth(), 2);
        assert_eq!(destination.num_available(), 2);
        for h in &handles {
            assert_eq!(destination.message(*h).unwrap().redelivery_count, 1);
        }
        assert_eq!(*participant.rolled_back.lock().unwrap(), vec![(handles[0], 0), (handles[1], 0)]);
        assert_eq!(*participant.num_rollbacks.lock().unwrap(), 1);

        assert_eq!(tran.rollback().unwrap_err().kind, ErrorKind::IncorrectCall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_hides() {
        let (destination, handles) = destination_with(1);
        let participant = Arc::new(RecordingParticipant { hide_for: Some(Duration::from_secs(2)), ..Default::default() });
        let tran = UncoordinatedTransaction::new(1);
        tran.transaction().delete_locked(&destination, handles[0], OWNER, Some(participant)).unwrap();

        tran.rollback().unwrap();
        assert_eq!(destination.num_available(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        destination.expire(tokio::time::Instant::now());
        assert_eq!(destination.num_available(), 1);
    }

    #[test]
    fn test_operations_on_completed_transaction() {
        let (destination, handles) = destination_with(1);
        let tran = UncoordinatedTransaction::new(1);
        tran.commit().unwrap();

        let e = tran.transaction().delete_locked(&destination, handles[0], OWNER, None).unwrap_err();
        assert_eq!(e.kind, ErrorKind::IncorrectCall);
        assert!(destination.is_locked_to(handles[0], OWNER));
        assert_eq!(tran.transaction().send(&destination, Bytes::new()).unwrap_err().kind, ErrorKind::IncorrectCall);
    }

    #[test]
    fn test_rollback_only() {
        let (destination, handles) = destination_with(1);
        let tran = UncoordinatedTransaction::new(1);
        tran.transaction().delete_locked(&destination, handles[0], OWNER, None).unwrap();
        tran.transaction().set_rollback_only();

        assert_eq!(tran.commit().unwrap_err().kind, ErrorKind::Rollback);
        assert_eq!(tran.state(), TransactionState::RolledBack);
        assert_eq!(destination.num_available(), 1);
    }

    #[test]
    fn test_validation_failure_rolls_back() {
        let destination = Destination::new("q", DestinationConfig { max_depth: 2, max_failed_deliveries: 5, ..Default::default() });
        let handle = destination.put(Bytes::from_static(b"a")).unwrap();
        destination.lock_batch(OWNER, 1, None);

        let tran = UncoordinatedTransaction::new(1);
        tran.transaction().delete_locked(&destination, handle, OWNER, None).unwrap();
        tran.transaction().send(&destination, Bytes::from_static(b"1")).unwrap();
        tran.transaction().send(&destination, Bytes::from_static(b"2")).unwrap();

        assert_eq!(tran.commit().unwrap_err().kind, ErrorKind::Rollback);
        assert_eq!(destination.depth(), 1);
        assert_eq!(destination.message(handle).unwrap().redelivery_count, 1);
    }

    #[rstest]
    #[case::one_phase_after_prepare(true, true, ErrorKind::IncorrectCall)]
    #[case::two_phase_without_prepare(false, false, ErrorKind::IncorrectCall)]
    fn test_xa_commit_requires_matching_phase(#[case] prepare: bool, #[case] one_phase: bool, #[case] expected: ErrorKind) {
        let xa = XaResource::new(1);
        if prepare {
            xa.prepare().unwrap();
        }
        assert_eq!(xa.commit(one_phase).unwrap_err().kind, expected);
    }

    #[test]
    fn test_xa_two_phase() {
        let (destination, handles) = destination_with(1);
        let xa = XaResource::new(1);
        xa.transaction().delete_locked(&destination, handles[0], OWNER, None).unwrap();

        xa.prepare().unwrap();
        assert_eq!(xa.state(), TransactionState::Prepared);
        assert_eq!(xa.transaction().send(&destination, Bytes::new()).unwrap_err().kind, ErrorKind::IncorrectCall);

        xa.commit(false).unwrap();
        assert_eq!(xa.state(), TransactionState::Committed);
        assert_eq!(destination.depth(), 0);
    }

    #[test]
    fn test_xa_rollback_after_prepare() {
        let (destination, handles) = destination_with(1);
        let xa = XaResource::new(1);
        xa.transaction().delete_locked(&destination, handles[0], OWNER, None).unwrap();
        xa.prepare().unwrap();
        xa.rollback().unwrap();
        assert_eq!(destination.num_available(), 1);
    }
}
