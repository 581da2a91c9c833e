//! Managed transaction storage and the three list indexes

use rusqlite::{params, types::Type, OptionalExtension, Row};

use super::{fmt_ts, parse_opt_json, parse_opt_ts, parse_ts};
use crate::models::ManagedTransaction;
use crate::persistence::{Database, SortDirection, StoreResult};

const TX_COLUMNS: &str = "seq, id, signer, nonce, status, created_at, updated_at, \
     transaction_data, transaction_hash, gas_price, first_submit, last_submit, \
     receipt, confirmations, error_history, policy_state";

fn tx_from_row(row: &Row<'_>) -> rusqlite::Result<ManagedTransaction> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let gas_price: Option<String> = row.get(9)?;
    let first_submit: Option<String> = row.get(10)?;
    let last_submit: Option<String> = row.get(11)?;
    let receipt: Option<String> = row.get(12)?;
    let confirmations: String = row.get(13)?;
    let error_history: String = row.get(14)?;
    let policy_state: Option<String> = row.get(15)?;

    Ok(ManagedTransaction {
        sequence_id: Some(row.get(0)?),
        id: row.get(1)?,
        signer: row.get(2)?,
        nonce: row.get::<_, i64>(3)? as u64,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        created_at: parse_ts(5, &created_at)?,
        updated_at: parse_ts(6, &updated_at)?,
        transaction_data: row.get(7)?,
        transaction_hash: row.get(8)?,
        gas_price: parse_opt_json(9, gas_price)?,
        first_submit: parse_opt_ts(10, first_submit)?,
        last_submit: parse_opt_ts(11, last_submit)?,
        receipt: parse_opt_json(12, receipt)?,
        confirmations: super::parse_json(13, &confirmations)?,
        error_history: super::parse_json(14, &error_history)?,
        policy_state: parse_opt_json(15, policy_state)?,
    })
}

impl Database {
    pub fn get_transaction_by_id(&self, id: &str) -> StoreResult<Option<ManagedTransaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE id = ?1",
            TX_COLUMNS
        ))?;
        Ok(stmt.query_row([id], tx_from_row).optional()?)
    }

    pub fn write_transaction(&self, tx: &ManagedTransaction) -> StoreResult<i64> {
        let gas_price = tx.gas_price.as_ref().map(serde_json::to_string).transpose()?;
        let receipt = tx.receipt.as_ref().map(serde_json::to_string).transpose()?;
        let policy_state = tx.policy_state.as_ref().map(serde_json::to_string).transpose()?;
        let confirmations = serde_json::to_string(&tx.confirmations)?;
        let error_history = serde_json::to_string(&tx.error_history)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO transactions
             (id, signer, nonce, status, created_at, updated_at, transaction_data,
              transaction_hash, gas_price, first_submit, last_submit, receipt,
              confirmations, error_history, policy_state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               updated_at = excluded.updated_at,
               nonce = excluded.nonce,
               transaction_hash = excluded.transaction_hash,
               gas_price = excluded.gas_price,
               first_submit = excluded.first_submit,
               last_submit = excluded.last_submit,
               receipt = excluded.receipt,
               confirmations = excluded.confirmations,
               error_history = excluded.error_history,
               policy_state = excluded.policy_state",
            params![
                tx.id,
                tx.signer,
                tx.nonce as i64,
                tx.status.to_string(),
                fmt_ts(&tx.created_at),
                fmt_ts(&tx.updated_at),
                tx.transaction_data,
                tx.transaction_hash,
                gas_price,
                tx.first_submit.as_ref().map(fmt_ts),
                tx.last_submit.as_ref().map(fmt_ts),
                receipt,
                confirmations,
                error_history,
                policy_state,
            ],
        )?;

        let seq: i64 = conn.query_row(
            "SELECT seq FROM transactions WHERE id = ?1",
            [&tx.id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    pub fn delete_transaction(&self, id: &str) -> StoreResult<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM transactions WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub fn highest_nonce_for_signer(&self, signer: &str) -> StoreResult<Option<u64>> {
        let max: Option<i64> = self.conn().query_row(
            "SELECT MAX(nonce) FROM transactions WHERE signer = ?1",
            [signer],
            |row| row.get(0),
        )?;
        Ok(max.map(|n| n as u64))
    }

    pub fn list_transactions_by_nonce(
        &self,
        signer: &str,
        after_nonce: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        let conn = self.conn();
        let cmp = match dir {
            SortDirection::Ascending => ">",
            SortDirection::Descending => "<",
        };
        let mut out = Vec::new();
        match after_nonce {
            Some(after) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions WHERE signer = ?1 AND nonce {} ?2
                     ORDER BY nonce {} LIMIT ?3",
                    TX_COLUMNS,
                    cmp,
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![signer, after as i64, limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions WHERE signer = ?1 ORDER BY nonce {} LIMIT ?2",
                    TX_COLUMNS,
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![signer, limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn list_transactions_pending(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        let conn = self.conn();
        let cmp = match dir {
            SortDirection::Ascending => ">",
            SortDirection::Descending => "<",
        };
        let mut out = Vec::new();
        match after_sequence {
            Some(after) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions
                     WHERE status IN ('pending', 'suspended') AND seq {} ?1
                     ORDER BY seq {} LIMIT ?2",
                    TX_COLUMNS,
                    cmp,
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![after, limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions
                     WHERE status IN ('pending', 'suspended')
                     ORDER BY seq {} LIMIT ?1",
                    TX_COLUMNS,
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn list_transactions_by_create_time(
        &self,
        after: Option<&ManagedTransaction>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        let conn = self.conn();
        let cmp = match dir {
            SortDirection::Ascending => ">",
            SortDirection::Descending => "<",
        };
        let mut out = Vec::new();
        match after {
            Some(after_tx) => {
                let created = fmt_ts(&after_tx.created_at);
                let seq = after_tx.sequence_id.unwrap_or_default();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions
                     WHERE created_at {} ?1 OR (created_at = ?1 AND seq {} ?2)
                     ORDER BY created_at {}, seq {} LIMIT ?3",
                    TX_COLUMNS,
                    cmp,
                    cmp,
                    dir.sql(),
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![created, seq, limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM transactions ORDER BY created_at {}, seq {} LIMIT ?1",
                    TX_COLUMNS,
                    dir.sql(),
                    dir.sql()
                ))?;
                let rows = stmt.query_map(params![limit as i64], tx_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use crate::connector::ErrorReason;
    use crate::models::{BlockInfo, ManagedTransaction, TransactionReceipt, TxStatus};
    use crate::persistence::{Database, SortDirection};

    fn tx(id: &str, signer: &str, nonce: u64) -> ManagedTransaction {
        let now = Utc::now();
        ManagedTransaction {
            id: id.to_string(),
            sequence_id: None,
            signer: signer.to_string(),
            nonce,
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
            transaction_data: "0xaa".to_string(),
            transaction_hash: None,
            gas_price: None,
            first_submit: None,
            last_submit: None,
            receipt: None,
            confirmations: Vec::new(),
            error_history: Vec::new(),
            policy_state: None,
        }
    }

    #[test]
    fn test_round_trip_full_record() {
        let db = Database::open_in_memory().unwrap();
        let mut t = tx("tx-1", "0xaaa", 7);
        t.status = TxStatus::Succeeded;
        t.transaction_hash = Some("0xhash1".to_string());
        t.gas_price = Some(json!({"maxFeePerGas": "1000000", "tip": 2}));
        t.first_submit = Some(Utc::now());
        t.last_submit = Some(Utc::now());
        t.receipt = Some(TransactionReceipt {
            block_number: 100,
            block_hash: "0xb100".to_string(),
            transaction_index: 3,
            success: true,
            extra_info: Some(json!({"protocol": "evm"})),
        });
        t.confirmations = vec![BlockInfo {
            block_number: 100,
            block_hash: "0xb100".to_string(),
            parent_hash: "0xb99".to_string(),
        }];
        t.add_error(5, ErrorReason::TransactionUnderpriced, "too cheap");
        t.policy_state = Some(json!({"submission_count": 2, "opaque": [1, 2, 3]}));

        let seq = db.write_transaction(&t).unwrap();
        t.sequence_id = Some(seq);

        let read = db.get_transaction_by_id("tx-1").unwrap().unwrap();
        assert_eq!(read, t);
    }

    #[test]
    fn test_write_is_upsert_preserving_sequence() {
        let db = Database::open_in_memory().unwrap();
        let mut t = tx("tx-1", "0xaaa", 1);
        let seq1 = db.write_transaction(&t).unwrap();
        t.status = TxStatus::Failed;
        let seq2 = db.write_transaction(&t).unwrap();
        assert_eq!(seq1, seq2);
        let read = db.get_transaction_by_id("tx-1").unwrap().unwrap();
        assert_eq!(read.status, TxStatus::Failed);
    }

    #[test]
    fn test_sequence_strictly_increasing() {
        let db = Database::open_in_memory().unwrap();
        let mut last = 0;
        for i in 0..5 {
            let seq = db.write_transaction(&tx(&format!("tx-{}", i), "0xaaa", i)).unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[test]
    fn test_duplicate_signer_nonce_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.write_transaction(&tx("tx-1", "0xaaa", 1)).unwrap();
        assert!(db.write_transaction(&tx("tx-2", "0xaaa", 1)).is_err());
    }

    #[test]
    fn test_highest_nonce() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.highest_nonce_for_signer("0xaaa").unwrap(), None);
        db.write_transaction(&tx("tx-1", "0xaaa", 3)).unwrap();
        db.write_transaction(&tx("tx-2", "0xaaa", 9)).unwrap();
        db.write_transaction(&tx("tx-3", "0xbbb", 50)).unwrap();
        assert_eq!(db.highest_nonce_for_signer("0xaaa").unwrap(), Some(9));
    }

    #[test]
    fn test_list_by_nonce_pagination() {
        let db = Database::open_in_memory().unwrap();
        for n in 0..5 {
            db.write_transaction(&tx(&format!("tx-{}", n), "0xaaa", n)).unwrap();
        }
        db.write_transaction(&tx("other", "0xbbb", 2)).unwrap();

        let asc = db
            .list_transactions_by_nonce("0xaaa", None, 2, SortDirection::Ascending)
            .unwrap();
        assert_eq!(asc.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![0, 1]);

        let next = db
            .list_transactions_by_nonce("0xaaa", Some(1), 2, SortDirection::Ascending)
            .unwrap();
        assert_eq!(next.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![2, 3]);

        let desc = db
            .list_transactions_by_nonce("0xaaa", Some(3), 10, SortDirection::Descending)
            .unwrap();
        assert_eq!(desc.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![2, 1, 0]);

        // cursor at the last element yields an empty page
        let done = db
            .list_transactions_by_nonce("0xaaa", Some(4), 10, SortDirection::Ascending)
            .unwrap();
        assert!(done.is_empty());
    }

    #[test]
    fn test_list_pending_skips_terminal() {
        let db = Database::open_in_memory().unwrap();
        for n in 0..5 {
            let mut t = tx(&format!("tx-{}", n), "0xaaa", n);
            if n == 2 {
                t.status = TxStatus::Succeeded;
            }
            db.write_transaction(&t).unwrap();
        }
        let pending = db
            .list_transactions_pending(None, 10, SortDirection::Ascending)
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["tx-0", "tx-1", "tx-3", "tx-4"]);

        let after = pending[1].sequence_id.unwrap();
        let page = db
            .list_transactions_pending(Some(after), 2, SortDirection::Ascending)
            .unwrap();
        let ids: Vec<_> = page.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["tx-3", "tx-4"]);
    }

    #[test]
    fn test_list_by_create_time() {
        let db = Database::open_in_memory().unwrap();
        let mut seqs = Vec::new();
        for n in 0..4 {
            let mut t = tx(&format!("tx-{}", n), "0xaaa", n);
            let seq = db.write_transaction(&t).unwrap();
            t.sequence_id = Some(seq);
            seqs.push(t);
        }
        // default listing is newest first
        let all = db
            .list_transactions_by_create_time(None, 10, SortDirection::Descending)
            .unwrap();
        assert_eq!(all.first().unwrap().id, "tx-3");
        assert_eq!(all.last().unwrap().id, "tx-0");

        let page = db
            .list_transactions_by_create_time(Some(&seqs[3]), 2, SortDirection::Descending)
            .unwrap();
        let ids: Vec<_> = page.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["tx-2", "tx-1"]);
    }
}
