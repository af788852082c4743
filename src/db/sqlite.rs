//! The production database: every table of the persisted layout in one
//! SQLite file.

use std::path::Path;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::hashes::{sha256, sha256d, Hash};
use bitcoin::{BlockHash, OutPoint, ScriptBuf, TxMerkleNode, Txid};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};
use crate::merkle::Bump;
use crate::script::ScriptHash;
use crate::wallet::account::Redeemable;

use super::{
    read_inpoint, write_inpoint, write_outpoint, BlockEntry, Database, Inpoint, SequenceRecord,
    TxRecord, TxStatus, STATUS_MINED,
};

const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS versions (
    version INTEGER PRIMARY KEY,
    details TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS blocks (
    height INTEGER PRIMARY KEY,
    hash BLOB NOT NULL,
    root BLOB NOT NULL,
    header BLOB NOT NULL,
    merkle_tree BLOB
);
CREATE INDEX IF NOT EXISTS blocks_hash ON blocks (hash);
CREATE INDEX IF NOT EXISTS blocks_root ON blocks (root);
CREATE TABLE IF NOT EXISTS transactions (
    hash BLOB PRIMARY KEY,
    tx BLOB NOT NULL,
    height INTEGER,
    status INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_height ON transactions (height);
CREATE TABLE IF NOT EXISTS redemptions (
    outpoint BLOB PRIMARY KEY,
    inpoint BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS redemptions_inpoint ON redemptions (inpoint);
CREATE TABLE IF NOT EXISTS scripts (
    hash BLOB PRIMARY KEY,
    script BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS outputs (
    outpoint BLOB PRIMARY KEY,
    script_hash BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS outputs_script_hash ON outputs (script_hash);
CREATE TABLE IF NOT EXISTS addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    script_hash BLOB NOT NULL,
    UNIQUE (address, script_hash)
);
CREATE TABLE IF NOT EXISTS wallets (
    name TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS keys (
    wallet TEXT NOT NULL,
    name TEXT NOT NULL,
    expression TEXT NOT NULL,
    PRIMARY KEY (wallet, name)
);
CREATE TABLE IF NOT EXISTS sequences (
    wallet TEXT NOT NULL,
    name TEXT NOT NULL,
    key TEXT NOT NULL,
    path TEXT NOT NULL,
    next INTEGER NOT NULL,
    PRIMARY KEY (wallet, name)
);
CREATE TABLE IF NOT EXISTS unused_recipients (
    wallet TEXT NOT NULL,
    recipient TEXT NOT NULL,
    PRIMARY KEY (wallet, recipient)
);
CREATE TABLE IF NOT EXISTS to_private (
    public TEXT PRIMARY KEY,
    private TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS invert_hashes (
    function TEXT NOT NULL,
    digest BLOB NOT NULL,
    preimage BLOB NOT NULL,
    PRIMARY KEY (function, digest)
);
CREATE TABLE IF NOT EXISTS accounts (
    wallet TEXT NOT NULL,
    outpoint BLOB NOT NULL,
    entry TEXT NOT NULL,
    PRIMARY KEY (wallet, outpoint)
);
CREATE TABLE IF NOT EXISTS payments (
    wallet TEXT PRIMARY KEY,
    state TEXT NOT NULL
);
";

/// The SQLite-backed [`Database`].
pub struct SqliteDatabase {
    conn: Connection,
}

fn txid_blob(txid: &Txid) -> Vec<u8> {
    txid.to_raw_hash().as_byte_array().to_vec()
}

fn txid_from_blob(data: &[u8]) -> Result<Txid> {
    let hash = sha256d::Hash::from_slice(data)
        .map_err(|_| Error::InvalidSyntax("bad stored txid".into()))?;
    Ok(Txid::from_raw_hash(hash))
}

fn script_hash_blob(hash: &ScriptHash) -> Vec<u8> {
    hash.as_byte_array().to_vec()
}

fn script_hash_from_blob(data: &[u8]) -> Result<ScriptHash> {
    sha256::Hash::from_slice(data).map_err(|_| Error::InvalidSyntax("bad stored script hash".into()))
}

impl SqliteDatabase {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// A throwaway database for tests and tools.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let version: Option<u32> = conn
            .query_row("SELECT MAX(version) FROM versions", [], |row| row.get(0))
            .optional()?
            .flatten();
        match version {
            None => {
                conn.execute(
                    "INSERT INTO versions (version, details) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, "initial schema"],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(Error::InvalidSyntax(format!(
                    "database schema version {v} is newer than this build"
                )))
            }
            Some(_) => {}
        }
        debug!(version = SCHEMA_VERSION, "opened wallet database");
        Ok(SqliteDatabase { conn })
    }

    fn ensure_wallet(&self, name: &str) -> Result<()> {
        if self.wallet_exists(name)? {
            Ok(())
        } else {
            Err(Error::WalletMissing(name.into()))
        }
    }

    fn block_from_row(
        height: u64,
        header: Vec<u8>,
        merkle_tree: Option<Vec<u8>>,
    ) -> Result<BlockEntry> {
        let header: Header = consensus::deserialize(&header)?;
        let bump = match merkle_tree {
            Some(bytes) => Some(Bump::from_bytes(&bytes)?),
            None => None,
        };
        Ok(BlockEntry {
            height,
            header,
            bump,
        })
    }

    fn block_where(&self, clause: &str, blob: Vec<u8>) -> Result<Option<BlockEntry>> {
        let query = format!("SELECT height, header, merkle_tree FROM blocks WHERE {clause}");
        self.conn
            .query_row(&query, params![blob], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            })
            .optional()?
            .map(|(height, header, tree)| Self::block_from_row(height, header, tree))
            .transpose()
    }
}

impl Database for SqliteDatabase {
    fn insert_block(&mut self, height: u64, header: &Header) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO blocks (height, hash, root, header, merkle_tree) \
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![
                height,
                header.block_hash().to_raw_hash().as_byte_array().to_vec(),
                header.merkle_root.to_raw_hash().as_byte_array().to_vec(),
                consensus::serialize(header),
            ],
        )?;
        Ok(())
    }

    fn block_by_height(&self, height: u64) -> Result<Option<BlockEntry>> {
        self.conn
            .query_row(
                "SELECT height, header, merkle_tree FROM blocks WHERE height = ?1",
                params![height],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(height, header, tree)| Self::block_from_row(height, header, tree))
            .transpose()
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockEntry>> {
        self.block_where("hash = ?1", hash.to_raw_hash().as_byte_array().to_vec())
    }

    fn block_by_root(&self, root: &TxMerkleNode) -> Result<Option<BlockEntry>> {
        self.block_where("root = ?1", root.to_raw_hash().as_byte_array().to_vec())
    }

    fn latest_block(&self) -> Result<Option<BlockEntry>> {
        self.conn
            .query_row(
                "SELECT height, header, merkle_tree FROM blocks ORDER BY height DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(height, header, tree)| Self::block_from_row(height, header, tree))
            .transpose()
    }

    fn remove_block(&mut self, height: u64) -> Result<()> {
        self.conn
            .execute("DELETE FROM blocks WHERE height = ?1", params![height])?;
        Ok(())
    }

    fn set_block_bump(&mut self, height: u64, bump: Option<&Bump>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE blocks SET merkle_tree = ?2 WHERE height = ?1",
            params![height, bump.map(Bump::to_bytes)],
        )?;
        if updated == 0 {
            return Err(Error::InvalidSyntax(format!("no block at height {height}")));
        }
        Ok(())
    }

    fn block_covering(&self, txid: &Txid) -> Result<Option<u64>> {
        let mut statement = self
            .conn
            .prepare("SELECT height, merkle_tree FROM blocks WHERE merkle_tree IS NOT NULL")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, u64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (height, tree) = row?;
            if Bump::from_bytes(&tree)?.tx_index(txid).is_some() {
                return Ok(Some(height));
            }
        }
        Ok(None)
    }

    fn put_transaction(&mut self, txid: &Txid, raw: &[u8], status: TxStatus) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO transactions (hash, tx, height, status) \
             VALUES (?1, ?2, ?3, ?4)",
            params![txid_blob(txid), raw, status.height(), status.to_byte()],
        )?;
        Ok(())
    }

    fn transaction(&self, txid: &Txid) -> Result<Option<TxRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT tx, height, status FROM transactions WHERE hash = ?1",
                params![txid_blob(txid)],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<u64>>(1)?,
                        row.get::<_, u8>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(raw, height, status)| TxRecord {
                raw,
                status: TxStatus::from_parts(status, height),
            }))
    }

    fn set_transaction_status(&mut self, txid: &Txid, status: TxStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE transactions SET height = ?2, status = ?3 WHERE hash = ?1",
            params![txid_blob(txid), status.height(), status.to_byte()],
        )?;
        if updated == 0 {
            return Err(Error::InvalidSyntax(format!("no transaction {txid}")));
        }
        Ok(())
    }

    fn delete_transaction(&mut self, txid: &Txid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM transactions WHERE hash = ?1",
            params![txid_blob(txid)],
        )?;
        Ok(())
    }

    fn transactions_at_height(&self, height: u64) -> Result<Vec<Txid>> {
        let mut statement = self.conn.prepare(
            "SELECT hash FROM transactions WHERE height = ?1 AND status = ?2",
        )?;
        let rows = statement.query_map(params![height, STATUS_MINED], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut txids = Vec::new();
        for row in rows {
            txids.push(txid_from_blob(&row?)?);
        }
        Ok(txids)
    }

    fn unconfirmed(&self) -> Result<Vec<Txid>> {
        let mut statement = self
            .conn
            .prepare("SELECT hash FROM transactions WHERE status != ?1")?;
        let rows = statement.query_map(params![STATUS_MINED], |row| row.get::<_, Vec<u8>>(0))?;
        let mut txids = Vec::new();
        for row in rows {
            txids.push(txid_from_blob(&row?)?);
        }
        Ok(txids)
    }

    fn put_script(&mut self, hash: &ScriptHash, script: &ScriptBuf) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO scripts (hash, script) VALUES (?1, ?2)",
            params![script_hash_blob(hash), script.as_bytes()],
        )?;
        Ok(())
    }

    fn script(&self, hash: &ScriptHash) -> Result<Option<ScriptBuf>> {
        Ok(self
            .conn
            .query_row(
                "SELECT script FROM scripts WHERE hash = ?1",
                params![script_hash_blob(hash)],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .map(ScriptBuf::from_bytes))
    }

    fn add_output(&mut self, hash: &ScriptHash, outpoint: &OutPoint) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO outputs (outpoint, script_hash) VALUES (?1, ?2)",
            params![write_outpoint(outpoint).to_vec(), script_hash_blob(hash)],
        )?;
        Ok(())
    }

    fn outputs_by_script_hash(&self, hash: &ScriptHash) -> Result<Vec<OutPoint>> {
        let mut statement = self
            .conn
            .prepare("SELECT outpoint FROM outputs WHERE script_hash = ?1")?;
        let rows = statement.query_map(params![script_hash_blob(hash)], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut outpoints = Vec::new();
        for row in rows {
            outpoints.push(super::read_outpoint(&row?)?);
        }
        Ok(outpoints)
    }

    fn delete_output(&mut self, outpoint: &OutPoint) -> Result<()> {
        self.conn.execute(
            "DELETE FROM outputs WHERE outpoint = ?1",
            params![write_outpoint(outpoint).to_vec()],
        )?;
        Ok(())
    }

    fn add_address(&mut self, address: &str, hash: &ScriptHash) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO addresses (address, script_hash) VALUES (?1, ?2)",
            params![address, script_hash_blob(hash)],
        )?;
        Ok(())
    }

    fn script_hashes_by_address(&self, address: &str) -> Result<Vec<ScriptHash>> {
        let mut statement = self
            .conn
            .prepare("SELECT script_hash FROM addresses WHERE address = ?1")?;
        let rows = statement.query_map(params![address], |row| row.get::<_, Vec<u8>>(0))?;
        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(script_hash_from_blob(&row?)?);
        }
        Ok(hashes)
    }

    fn set_redemption(&mut self, outpoint: &OutPoint, inpoint: &Inpoint) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO redemptions (outpoint, inpoint) VALUES (?1, ?2)",
            params![
                write_outpoint(outpoint).to_vec(),
                write_inpoint(inpoint).to_vec()
            ],
        )?;
        Ok(())
    }

    fn redemption(&self, outpoint: &OutPoint) -> Result<Option<Inpoint>> {
        self.conn
            .query_row(
                "SELECT inpoint FROM redemptions WHERE outpoint = ?1",
                params![write_outpoint(outpoint).to_vec()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .map(|blob| read_inpoint(&blob))
            .transpose()
    }

    fn delete_redemptions_by_spender(&mut self, txid: &Txid) -> Result<()> {
        // The inpoint blob starts with the spender's txid.
        self.conn.execute(
            "DELETE FROM redemptions WHERE substr(inpoint, 1, 32) = ?1",
            params![txid_blob(txid)],
        )?;
        Ok(())
    }

    fn create_wallet(&mut self, name: &str) -> Result<()> {
        if self.wallet_exists(name)? {
            return Err(Error::WalletExists(name.into()));
        }
        self.conn
            .execute("INSERT INTO wallets (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    fn wallet_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT name FROM wallets WHERE name = ?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .is_some())
    }

    fn list_wallets(&self) -> Result<Vec<String>> {
        let mut statement = self.conn.prepare("SELECT name FROM wallets ORDER BY name")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn set_key(&mut self, wallet: &str, name: &str, expression: &str) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO keys (wallet, name, expression) VALUES (?1, ?2, ?3)",
            params![wallet, name, expression],
        )?;
        Ok(())
    }

    fn key(&self, wallet: &str, name: &str) -> Result<Option<String>> {
        self.ensure_wallet(wallet)?;
        Ok(self
            .conn
            .query_row(
                "SELECT expression FROM keys WHERE wallet = ?1 AND name = ?2",
                params![wallet, name],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn keys(&self, wallet: &str) -> Result<Vec<(String, String)>> {
        self.ensure_wallet(wallet)?;
        let mut statement = self
            .conn
            .prepare("SELECT name, expression FROM keys WHERE wallet = ?1 ORDER BY name")?;
        let rows = statement.query_map(params![wallet], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn set_sequence(&mut self, wallet: &str, name: &str, record: &SequenceRecord) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sequences (wallet, name, key, path, next) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![wallet, name, record.key, record.path, record.next],
        )?;
        Ok(())
    }

    fn sequence(&self, wallet: &str, name: &str) -> Result<Option<SequenceRecord>> {
        self.ensure_wallet(wallet)?;
        Ok(self
            .conn
            .query_row(
                "SELECT key, path, next FROM sequences WHERE wallet = ?1 AND name = ?2",
                params![wallet, name],
                |row| {
                    Ok(SequenceRecord {
                        key: row.get(0)?,
                        path: row.get(1)?,
                        next: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn sequences(&self, wallet: &str) -> Result<Vec<(String, SequenceRecord)>> {
        self.ensure_wallet(wallet)?;
        let mut statement = self.conn.prepare(
            "SELECT name, key, path, next FROM sequences WHERE wallet = ?1 ORDER BY name",
        )?;
        let rows = statement.query_map(params![wallet], |row| {
            Ok((
                row.get::<_, String>(0)?,
                SequenceRecord {
                    key: row.get(1)?,
                    path: row.get(2)?,
                    next: row.get(3)?,
                },
            ))
        })?;
        let mut sequences = Vec::new();
        for row in rows {
            sequences.push(row?);
        }
        Ok(sequences)
    }

    fn add_unused(&mut self, wallet: &str, recipient: &str) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO unused_recipients (wallet, recipient) VALUES (?1, ?2)",
            params![wallet, recipient],
        )?;
        Ok(())
    }

    fn remove_unused(&mut self, wallet: &str, recipient: &str) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "DELETE FROM unused_recipients WHERE wallet = ?1 AND recipient = ?2",
            params![wallet, recipient],
        )?;
        Ok(())
    }

    fn unused(&self, wallet: &str) -> Result<Vec<String>> {
        self.ensure_wallet(wallet)?;
        let mut statement = self
            .conn
            .prepare("SELECT recipient FROM unused_recipients WHERE wallet = ?1")?;
        let rows = statement.query_map(params![wallet], |row| row.get::<_, String>(0))?;
        let mut recipients = Vec::new();
        for row in rows {
            recipients.push(row?);
        }
        Ok(recipients)
    }

    fn set_to_private(&mut self, public: &str, private: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO to_private (public, private) VALUES (?1, ?2)",
            params![public, private],
        )?;
        Ok(())
    }

    fn to_private(&self, public: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT private FROM to_private WHERE public = ?1",
                params![public],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn set_invert_hash(&mut self, function: &str, digest: &[u8], preimage: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO invert_hashes (function, digest, preimage) \
             VALUES (?1, ?2, ?3)",
            params![function, digest, preimage],
        )?;
        Ok(())
    }

    fn invert_hash(&self, function: &str, digest: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT preimage FROM invert_hashes WHERE function = ?1 AND digest = ?2",
                params![function, digest],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?)
    }

    fn set_account_entry(
        &mut self,
        wallet: &str,
        outpoint: &OutPoint,
        entry: &Redeemable,
    ) -> Result<()> {
        self.ensure_wallet(wallet)?;
        let json = serde_json::to_string(entry)
            .map_err(|e| Error::InvalidSyntax(format!("serializing account entry: {e}")))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO accounts (wallet, outpoint, entry) VALUES (?1, ?2, ?3)",
            params![wallet, write_outpoint(outpoint).to_vec(), json],
        )?;
        Ok(())
    }

    fn delete_account_entry(&mut self, wallet: &str, outpoint: &OutPoint) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "DELETE FROM accounts WHERE wallet = ?1 AND outpoint = ?2",
            params![wallet, write_outpoint(outpoint).to_vec()],
        )?;
        Ok(())
    }

    fn account_entries(&self, wallet: &str) -> Result<Vec<(OutPoint, Redeemable)>> {
        self.ensure_wallet(wallet)?;
        let mut statement = self
            .conn
            .prepare("SELECT outpoint, entry FROM accounts WHERE wallet = ?1")?;
        let rows = statement.query_map(params![wallet], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (outpoint, json) = row?;
            let entry: Redeemable = serde_json::from_str(&json)
                .map_err(|e| Error::InvalidSyntax(format!("reading account entry: {e}")))?;
            entries.push((super::read_outpoint(&outpoint)?, entry));
        }
        Ok(entries)
    }

    fn payments(&self, wallet: &str) -> Result<Option<String>> {
        self.ensure_wallet(wallet)?;
        Ok(self
            .conn
            .query_row(
                "SELECT state FROM payments WHERE wallet = ?1",
                params![wallet],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    fn set_payments(&mut self, wallet: &str, json: &str) -> Result<()> {
        self.ensure_wallet(wallet)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO payments (wallet, state) VALUES (?1, ?2)",
            params![wallet, json],
        )?;
        Ok(())
    }
}
