//! The SPV-backed transaction store: content-addressed transactions,
//! block headers with their Merkle trees, and the indices everything else
//! is derived from.
//!
//! Status lives here: a transaction is `pending` until a containing
//! block's proof arrives, drops back to `pending` when that block's
//! header is removed in a reorg, and can only leave the store entirely
//! while pending.

use std::cmp::Ordering;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::{BlockHash, OutPoint, Transaction, TxIn, TxMerkleNode, TxOut, Txid};
use tracing::debug;

use crate::db::{BlockEntry, Database, Inpoint, TxStatus};
use crate::error::{Error, Result};
use crate::keys::expression::encode_address;
use crate::merkle::Bump;
use crate::script::{self, ScriptHash};
use crate::spv::{Confirmation, When};

/// Whether an event touches an input or an output. Inputs order before
/// outputs at the same position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
    In,
    Out,
}

/// The input or output an event refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Put {
    Input(TxIn),
    Output(TxOut),
}

/// A transaction with whatever proof the store holds for it.
#[derive(Clone, Debug)]
pub struct Vertex {
    pub txid: Txid,
    pub tx: Transaction,
    pub confirmation: Option<Confirmation>,
}

impl Vertex {
    pub fn when(&self) -> When {
        match &self.confirmation {
            Some(confirmation) => confirmation.when(),
            None => When::Unconfirmed,
        }
    }

    /// Position within the containing block; unconfirmed sorts last.
    pub fn block_position(&self) -> u64 {
        match &self.confirmation {
            Some(confirmation) => confirmation.index,
            None => u64::MAX,
        }
    }
}

/// A single input or output of a stored transaction, viewed from a
/// wallet's perspective.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub txid: Txid,
    pub direction: Direction,
    /// Input or output index within the transaction.
    pub index: u32,
    /// Satoshis moved: the output value, or the spent prevout's value.
    pub value: u64,
    pub when: When,
    /// Position of the transaction in its block; `u64::MAX` if pending.
    pub block_position: u64,
    pub put: Put,
}

impl Event {
    /// The outpoint or inpoint this event refers to.
    pub fn point(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }

    fn key(&self) -> (When, u64, Direction, u32, Txid) {
        (
            self.when,
            self.block_position,
            self.direction,
            self.index,
            self.txid,
        )
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The transaction store over a [`Database`].
pub struct TxDb<D: Database> {
    db: D,
}

impl<D: Database> TxDb<D> {
    pub fn new(db: D) -> Self {
        TxDb { db }
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut D {
        &mut self.db
    }

    // ----- headers (C2) -----

    /// Record a header at its height.
    pub fn insert_header(&mut self, height: u64, header: &Header) -> Result<()> {
        debug!(height, hash = %header.block_hash(), "insert header");
        self.db.insert_block(height, header)
    }

    pub fn header_by_height(&self, height: u64) -> Result<Option<BlockEntry>> {
        self.db.block_by_height(height)
    }

    pub fn header_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockEntry>> {
        self.db.block_by_hash(hash)
    }

    pub fn header_by_root(&self, root: &TxMerkleNode) -> Result<Option<BlockEntry>> {
        self.db.block_by_root(root)
    }

    pub fn latest(&self) -> Result<Option<BlockEntry>> {
        self.db.latest_block()
    }

    /// Remove the header at a height.
    ///
    /// Every transaction whose confirmation was in that block drops back
    /// to pending; its redemption and output index entries stay. Returns
    /// the demoted txids.
    pub fn remove_header(&mut self, height: u64) -> Result<Vec<Txid>> {
        let demoted = self.db.transactions_at_height(height)?;
        for txid in &demoted {
            self.db.set_transaction_status(txid, TxStatus::Pending)?;
        }
        self.db.remove_block(height)?;
        debug!(height, demoted = demoted.len(), "removed header");
        Ok(demoted)
    }

    // ----- proofs -----

    /// Merge a Merkle branch into the proof of the block with its root.
    ///
    /// Fails with `unknown-block` when no stored header carries the
    /// branch's root, and `merkle-mismatch` when the branch disagrees
    /// with the header or the existing proof. Every covered transaction
    /// already in the store becomes `mined`.
    pub fn insert_proof(&mut self, branch: &Bump) -> Result<()> {
        let root = branch.root()?;
        let block = self
            .db
            .block_by_root(&root)?
            .ok_or_else(|| Error::UnknownBlock(root.to_string()))?;
        if block.height != branch.block_height {
            return Err(Error::MerkleMismatch);
        }
        let merged = match block.bump {
            Some(mut existing) => {
                existing.merge(branch)?;
                existing
            }
            None => branch.clone(),
        };
        self.db.set_block_bump(block.height, Some(&merged))?;
        for txid in branch.txids() {
            if self.db.transaction(&txid)?.is_some() {
                self.db.set_transaction_status(
                    &txid,
                    TxStatus::Mined {
                        height: block.height,
                    },
                )?;
            }
        }
        Ok(())
    }

    // ----- transactions (C3) -----

    /// Insert or update a raw transaction, deriving the redemption links
    /// and output indices.
    ///
    /// If a stored block proof already covers the txid the transaction
    /// starts out `mined`; otherwise it is `pending` until a proof
    /// arrives.
    pub fn insert_tx(&mut self, tx: &Transaction) -> Result<()> {
        let txid = tx.compute_txid();
        let status = match self.db.transaction(&txid)? {
            Some(existing) => existing.status,
            None => match self.db.block_covering(&txid)? {
                Some(height) => TxStatus::Mined { height },
                None => TxStatus::Pending,
            },
        };
        self.db
            .put_transaction(&txid, &consensus::serialize(tx), status)?;

        for (vin, input) in tx.input.iter().enumerate() {
            if input.previous_output == OutPoint::null() {
                continue;
            }
            self.db.set_redemption(
                &input.previous_output,
                &Inpoint::new(txid, vin as u32),
            )?;
        }
        for (vout, output) in tx.output.iter().enumerate() {
            let hash = script::script_hash(&output.script_pubkey);
            self.db.put_script(&hash, &output.script_pubkey)?;
            self.db.add_output(&hash, &OutPoint::new(txid, vout as u32))?;
            if let Some(pkh) = script::pay_to_address_hash(&output.script_pubkey) {
                self.db
                    .add_address(&encode_address(bitcoin::NetworkKind::Main, &pkh), &hash)?;
            }
        }
        debug!(%txid, mined = status.is_mined(), "inserted transaction");
        Ok(())
    }

    /// Insert a transaction together with its proof and header, checked
    /// for consistency.
    pub fn insert_tx_with_proof(
        &mut self,
        tx: &Transaction,
        branch: &Bump,
        header: &Header,
    ) -> Result<()> {
        let txid = tx.compute_txid();
        if branch.tx_index(&txid).is_none() {
            return Err(Error::MerkleMismatch);
        }
        if branch.root()? != header.merkle_root {
            return Err(Error::MerkleMismatch);
        }
        let hash = header.block_hash();
        let block = self
            .db
            .block_by_hash(&hash)?
            .ok_or_else(|| Error::UnknownBlock(hash.to_string()))?;
        if block.height != branch.block_height {
            return Err(Error::MerkleMismatch);
        }
        self.insert_tx(tx)?;
        self.insert_proof(branch)
    }

    /// Remove a pending transaction and everything derived from it.
    /// Removing a mined transaction is forbidden; a reorg is the only way
    /// to demote one.
    pub fn remove_tx(&mut self, txid: &Txid) -> Result<()> {
        let record = self
            .db
            .transaction(txid)?
            .ok_or_else(|| Error::InvalidSyntax(format!("no transaction {txid}")))?;
        if record.status.is_mined() {
            return Err(Error::InvalidSyntax(format!(
                "cannot remove mined transaction {txid}"
            )));
        }
        let tx: Transaction = consensus::deserialize(&record.raw)?;
        self.db.delete_redemptions_by_spender(txid)?;
        for vout in 0..tx.output.len() {
            self.db.delete_output(&OutPoint::new(*txid, vout as u32))?;
        }
        self.db.delete_transaction(txid)?;
        Ok(())
    }

    pub fn unconfirmed(&self) -> Result<Vec<Txid>> {
        self.db.unconfirmed()
    }

    /// The stored transaction with its proof, when both exist.
    ///
    /// A mined transaction whose block proof has gone missing reads back
    /// as unconfirmed rather than failing.
    pub fn vertex(&self, txid: &Txid) -> Result<Option<Vertex>> {
        let record = match self.db.transaction(txid)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let tx: Transaction = consensus::deserialize(&record.raw)?;
        let confirmation = match record.status {
            TxStatus::Pending => None,
            TxStatus::Mined { height } => self.confirmation_at(txid, height)?,
        };
        Ok(Some(Vertex {
            txid: *txid,
            tx,
            confirmation,
        }))
    }

    fn confirmation_at(&self, txid: &Txid, height: u64) -> Result<Option<Confirmation>> {
        let block = match self.db.block_by_height(height)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let bump = match &block.bump {
            Some(bump) => bump,
            None => return Ok(None),
        };
        match bump.branch(txid) {
            Ok((index, branch)) => Ok(Some(Confirmation {
                height,
                header: block.header,
                index,
                branch,
            })),
            Err(_) => Ok(None),
        }
    }

    /// The output at an outpoint, if its transaction is stored.
    pub fn output(&self, outpoint: &OutPoint) -> Result<Option<TxOut>> {
        let vertex = match self.vertex(&outpoint.txid)? {
            Some(vertex) => vertex,
            None => return Ok(None),
        };
        Ok(vertex.tx.output.get(outpoint.vout as usize).cloned())
    }

    pub fn value(&self, outpoint: &OutPoint) -> Result<u64> {
        Ok(self
            .output(outpoint)?
            .map(|o| o.value.to_sat())
            .unwrap_or(0))
    }

    // ----- event queries -----

    /// All events touching outputs with a script hash, in event order.
    pub fn by_script_hash(&self, hash: &ScriptHash) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for outpoint in self.db.outputs_by_script_hash(hash)? {
            let vertex = match self.vertex(&outpoint.txid)? {
                Some(vertex) => vertex,
                None => continue,
            };
            let output = match vertex.tx.output.get(outpoint.vout as usize) {
                Some(output) => output.clone(),
                None => continue,
            };
            events.push(Event {
                txid: outpoint.txid,
                direction: Direction::Out,
                index: outpoint.vout,
                value: output.value.to_sat(),
                when: vertex.when(),
                block_position: vertex.block_position(),
                put: Put::Output(output.clone()),
            });
            if let Some(event) = self.redeeming_with_value(&outpoint, output.value.to_sat())? {
                events.push(event);
            }
        }
        events.sort();
        Ok(events)
    }

    /// All events for an address, in event order.
    pub fn by_address(&self, address: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for hash in self.db.script_hashes_by_address(address)? {
            events.extend(self.by_script_hash(&hash)?);
        }
        events.sort();
        Ok(events)
    }

    /// The input event that spends an outpoint, if one is stored.
    pub fn redeeming(&self, outpoint: &OutPoint) -> Result<Option<Event>> {
        let value = self.value(outpoint)?;
        self.redeeming_with_value(outpoint, value)
    }

    fn redeeming_with_value(&self, outpoint: &OutPoint, value: u64) -> Result<Option<Event>> {
        let inpoint = match self.db.redemption(outpoint)? {
            Some(inpoint) => inpoint,
            None => return Ok(None),
        };
        let vertex = match self.vertex(&inpoint.txid)? {
            Some(vertex) => vertex,
            None => return Ok(None),
        };
        let input = match vertex.tx.input.get(inpoint.index as usize) {
            Some(input) => input.clone(),
            None => return Ok(None),
        };
        Ok(Some(Event {
            txid: inpoint.txid,
            direction: Direction::In,
            index: inpoint.index,
            value,
            when: vertex.when(),
            block_position: vertex.block_position(),
            put: Put::Input(input),
        }))
    }
}
