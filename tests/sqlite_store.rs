//! The same wallet flows over the production SQLite store, including
//! persistence across reopen.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};

use cosmos_wallet::beef::{Beef, BeefTx};
use cosmos_wallet::db::SqliteDatabase;
use cosmos_wallet::keys::expression::decode_address;
use cosmos_wallet::merkle::{merkle_branch, merkle_root, Bump};
use cosmos_wallet::random::{Random, SharedRandom};
use cosmos_wallet::script;
use cosmos_wallet::wallet::generate::{generate_wallet, GenerateParams};
use cosmos_wallet::wallet::{Wallets, RECEIVE_SEQUENCE};

fn open(path: &std::path::Path) -> Wallets<SqliteDatabase> {
    Wallets::new(
        SqliteDatabase::open(path).unwrap(),
        SharedRandom::new(Random::deterministic(b"sqlite", b"nonce")),
    )
}

#[test]
fn funded_wallet_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wallet.db");

    let funding_txid;
    {
        let mut wallets = open(&path);
        generate_wallet(&mut wallets, "alpha", &GenerateParams::default()).unwrap();
        let address = wallets.next_address("alpha", RECEIVE_SEQUENCE).unwrap();
        let (_, hash) = decode_address(&address).unwrap();

        let funding = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(42_000),
                script_pubkey: script::pay_to_address(&hash),
            }],
        };
        funding_txid = funding.compute_txid();

        let mut txids = vec![funding_txid];
        txids.push(Txid::from_raw_hash(sha256d::Hash::hash(&[0x22])));
        let header = bitcoin::block::Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: merkle_root(&txids).unwrap(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        wallets.txdb_mut().insert_header(100, &header).unwrap();

        let beef = Beef {
            bumps: vec![Bump::from_branch(
                100,
                0,
                &funding_txid,
                &merkle_branch(&txids, 0),
            )],
            txs: vec![BeefTx {
                tx: funding,
                bump: Some(0),
            }],
        };
        wallets.import_beef("alpha", &beef).unwrap();
        assert_eq!(wallets.value("alpha").unwrap(), 42_000);
    }

    // Everything comes back from disk: the account, the proof, the
    // sequences.
    let wallets = open(&path);
    assert_eq!(wallets.list_wallets().unwrap(), vec!["alpha".to_string()]);
    assert_eq!(wallets.value("alpha").unwrap(), 42_000);
    assert_eq!(wallets.sequence("alpha", RECEIVE_SEQUENCE).unwrap().next, 1);

    let vertex = wallets.txdb().vertex(&funding_txid).unwrap().unwrap();
    let confirmation = vertex.confirmation.unwrap();
    assert_eq!(confirmation.height, 100);
    assert!(confirmation.validate(&funding_txid));

    let history = wallets.history("alpha").unwrap();
    assert_eq!(history.value, 42_000);
}

#[test]
fn reorg_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wallet.db");
    let mut wallets = open(&path);
    generate_wallet(&mut wallets, "alpha", &GenerateParams::default()).unwrap();

    // A bare confirmed transaction, no wallet involvement needed.
    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x07]),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1),
            script_pubkey: ScriptBuf::new(),
        }],
    };
    let txid = tx.compute_txid();
    let txids = vec![txid];
    let header = bitcoin::block::Header {
        version: bitcoin::block::Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: merkle_root(&txids).unwrap(),
        time: 1_700_000_100,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: 0,
    };

    wallets.txdb_mut().insert_tx(&tx).unwrap();
    wallets.txdb_mut().insert_header(200, &header).unwrap();
    wallets
        .txdb_mut()
        .insert_proof(&Bump::from_branch(200, 0, &txid, &merkle_branch(&txids, 0)))
        .unwrap();
    assert!(wallets.txdb().unconfirmed().unwrap().is_empty());

    let demoted = wallets.txdb_mut().remove_header(200).unwrap();
    assert_eq!(demoted, vec![txid]);
    assert_eq!(wallets.txdb().unconfirmed().unwrap(), vec![txid]);
}
