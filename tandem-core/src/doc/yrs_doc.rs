//! `SyncDocument` over a `yrs::Doc`, so the transport can carry real
//! Yjs v1 updates.

use parking_lot::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn};

use super::{Observers, Subscription, SyncDocument, UpdateHandler};
use crate::error::DocError;
use crate::origin::OriginTag;

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Update(e.to_string())
    }
}

pub struct YrsDoc {
    doc: Mutex<yrs::Doc>,
    updates: Observers<UpdateHandler>,
}

impl Default for YrsDoc {
    fn default() -> Self {
        Self::from_doc(yrs::Doc::new())
    }
}

impl YrsDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(yrs::Doc::with_client_id(client_id))
    }

    pub fn from_doc(doc: yrs::Doc) -> Self {
        Self {
            doc: Mutex::new(doc),
            updates: Observers::new(),
        }
    }

    /// Run `f` in a write transaction and publish the resulting update to
    /// `on_update` hooks with `origin`.
    pub fn transact_local<R>(
        &self,
        origin: OriginTag,
        f: impl FnOnce(&yrs::Doc, &mut yrs::TransactionMut<'_>) -> R,
    ) -> R {
        let (result, update) = {
            let doc = self.doc.lock();
            let mut txn = yrs::Transact::transact_mut(&*doc);
            let result = f(&doc, &mut txn);
            (result, txn.encode_update_v1())
        };
        for handler in self.updates.snapshot() {
            handler(&update, &origin);
        }
        result
    }

    /// Content of the text root `name`.
    pub fn text(&self, name: &str) -> String {
        let doc = self.doc.lock();
        let text = doc.get_or_insert_text(name);
        let txn = yrs::Transact::transact(&*doc);
        text.get_string(&txn)
    }
}

impl SyncDocument for YrsDoc {
    fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = yrs::Transact::transact(&*doc);
        txn.state_vector().encode_v1()
    }

    fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = yrs::StateVector::decode_v1(state_vector)
            .map_err(|e| DocError::StateVector(e.to_string()))?;
        let doc = self.doc.lock();
        let txn = yrs::Transact::transact(&*doc);
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn encode_state(&self) -> Result<Vec<u8>, DocError> {
        let doc = self.doc.lock();
        let txn = yrs::Transact::transact(&*doc);
        Ok(txn.encode_state_as_update_v1(&yrs::StateVector::default()))
    }

    fn apply_diff(&self, diff: &[u8], origin: OriginTag) -> Result<(), DocError> {
        let update = yrs::Update::decode_v1(diff)?;
        {
            let doc = self.doc.lock();
            let mut txn = yrs::Transact::transact_mut(&*doc);
            txn.apply_update(update)
                .map_err(|e| DocError::Update(e.to_string()))?;
        }
        for handler in self.updates.snapshot() {
            handler(diff, &origin);
        }
        Ok(())
    }

    fn on_update(&self, handler: UpdateHandler) -> Subscription {
        self.updates.subscribe(handler)
    }
}
