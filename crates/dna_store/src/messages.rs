//! Conversation history, sequence allocation, dedup and the retry queue.

use dna_crypto::Fingerprint;
use tracing::debug;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{Direction, MessageRow, MessageState, QueueRow};

/// Beyond this many attempts a queued message moves to `failed` and waits
/// for an explicit user retry.
pub const MAX_RETRY: i64 = 8;

impl Store {
    // ── Outgoing ─────────────────────────────────────────────────────────────

    /// Insert an outgoing message, allocating the next per-recipient
    /// seq_num atomically, and enqueue it for delivery.
    /// Returns `(msg_id, seq_num)`.
    pub async fn insert_outgoing(
        &self,
        peer: &Fingerprint,
        plaintext: &str,
        timestamp: i64,
    ) -> Result<(i64, u64), StoreError> {
        let peer_hex = peer.to_hex();
        let mut tx = self.pool.begin().await?;

        let seq_num: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq_num), 0) + 1 FROM messages \
             WHERE peer_fp = ? AND direction = 'outgoing'",
        )
        .bind(&peer_hex)
        .fetch_one(&mut *tx)
        .await?;

        let msg_id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (direction, peer_fp, seq_num, plaintext, timestamp, state) \
             VALUES ('outgoing', ?, ?, ?, ?, 'queued') RETURNING msg_id",
        )
        .bind(&peer_hex)
        .bind(seq_num)
        .bind(plaintext)
        .bind(timestamp)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO queue (msg_id, next_retry_at, attempts) VALUES (?, ?, 0)")
            .bind(msg_id)
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((msg_id, seq_num as u64))
    }

    /// Attach the sealed envelope to an outgoing row. Kept until the
    /// peer's ACK covers the seq_num.
    pub async fn set_ciphertext(&self, msg_id: i64, ciphertext: &[u8]) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET ciphertext = ? WHERE msg_id = ?")
            .bind(ciphertext)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Incoming ─────────────────────────────────────────────────────────────

    /// Store a received message. Duplicate `(peer, seq, direction)` rows
    /// are suppressed; returns whether a new row was inserted.
    pub async fn insert_incoming(
        &self,
        peer: &Fingerprint,
        seq_num: u64,
        plaintext: &str,
        ciphertext: &[u8],
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (direction, peer_fp, seq_num, plaintext, ciphertext, timestamp, state) \
             VALUES ('incoming', ?, ?, ?, ?, ?, 'delivered')",
        )
        .bind(peer.to_hex())
        .bind(seq_num as i64)
        .bind(plaintext)
        .bind(ciphertext)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── State machine ────────────────────────────────────────────────────────

    /// Apply a state transition, enforcing the DAG.
    pub async fn set_message_state(
        &self,
        msg_id: i64,
        to: MessageState,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT state FROM messages WHERE msg_id = ?")
                .bind(msg_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("message {msg_id}")))?;
        let from = MessageState::parse(&current)?;
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        sqlx::query("UPDATE messages SET state = ? WHERE msg_id = ?")
            .bind(to.as_str())
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// ACK from `peer` covering everything up to `acked_seq`: flip sent
    /// rows to delivered and drop their retained ciphertexts and queue
    /// rows. Prune hint only — TTL expiry on the DHT is the hard bound.
    pub async fn apply_ack(
        &self,
        peer: &Fingerprint,
        acked_seq: u64,
    ) -> Result<u64, StoreError> {
        let peer_hex = peer.to_hex();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE messages SET state = 'delivered', ciphertext = NULL \
             WHERE peer_fp = ? AND direction = 'outgoing' AND state = 'sent' AND seq_num <= ?",
        )
        .bind(&peer_hex)
        .bind(acked_seq as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM queue WHERE msg_id IN (\
               SELECT msg_id FROM messages \
               WHERE peer_fp = ? AND direction = 'outgoing' AND seq_num <= ?)",
        )
        .bind(&peer_hex)
        .bind(acked_seq as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE contacts SET last_ack_recv = MAX(last_ack_recv, ?) WHERE fp = ?")
            .bind(acked_seq as i64)
            .bind(&peer_hex)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        if updated > 0 {
            debug!(peer = %peer.abbrev(), acked_seq, updated, "ack applied");
        }
        Ok(updated)
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Full conversation, oldest first.
    pub async fn conversation(&self, peer: &Fingerprint) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT msg_id, direction, peer_fp, seq_num, plaintext, ciphertext, timestamp, \
                    state, retry_count \
             FROM messages WHERE peer_fp = ? ORDER BY timestamp ASC, msg_id ASC",
        )
        .bind(peer.to_hex())
        .fetch_all(&self.pool)
        .await?)
    }

    /// One page, newest first.
    pub async fn conversation_page(
        &self,
        peer: &Fingerprint,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT msg_id, direction, peer_fp, seq_num, plaintext, ciphertext, timestamp, \
                    state, retry_count \
             FROM messages WHERE peer_fp = ? \
             ORDER BY timestamp DESC, msg_id DESC LIMIT ? OFFSET ?",
        )
        .bind(peer.to_hex())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Incoming messages not yet marked read.
    pub async fn unread_count(&self, peer: &Fingerprint) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages \
             WHERE peer_fp = ? AND direction = 'incoming' AND state = 'delivered'",
        )
        .bind(peer.to_hex())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Mark every delivered incoming message in a conversation as read.
    pub async fn mark_conversation_read(&self, peer: &Fingerprint) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET state = 'read' \
             WHERE peer_fp = ? AND direction = 'incoming' AND state = 'delivered'",
        )
        .bind(peer.to_hex())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn message(&self, msg_id: i64) -> Result<MessageRow, StoreError> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT msg_id, direction, peer_fp, seq_num, plaintext, ciphertext, timestamp, \
                    state, retry_count \
             FROM messages WHERE msg_id = ?",
        )
        .bind(msg_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("message {msg_id}")))
    }

    // ── Retry queue ──────────────────────────────────────────────────────────

    /// Queue rows whose retry time has arrived.
    pub async fn due_retries(&self, now: i64) -> Result<Vec<QueueRow>, StoreError> {
        Ok(sqlx::query_as::<_, QueueRow>(
            "SELECT msg_id, next_retry_at, attempts FROM queue \
             WHERE next_retry_at <= ? ORDER BY next_retry_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Record a failed attempt. Returns the new attempt count; at
    /// MAX_RETRY the row leaves the queue and the message is `failed`.
    pub async fn record_attempt(
        &self,
        msg_id: i64,
        next_retry_at: i64,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let attempts: i64 =
            sqlx::query_scalar("SELECT attempts FROM queue WHERE msg_id = ?")
                .bind(msg_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("queue row {msg_id}")))?;
        let attempts = attempts + 1;

        if attempts >= MAX_RETRY {
            sqlx::query("DELETE FROM queue WHERE msg_id = ?")
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE messages SET state = 'failed', retry_count = ? WHERE msg_id = ?",
            )
            .bind(attempts)
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE queue SET attempts = ?, next_retry_at = ? WHERE msg_id = ?")
                .bind(attempts)
                .bind(next_retry_at)
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE messages SET retry_count = ? WHERE msg_id = ?")
                .bind(attempts)
                .bind(msg_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(attempts)
    }

    /// Successful send: the message leaves the queue and becomes `sent`.
    pub async fn mark_sent(&self, msg_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET state = 'sent' WHERE msg_id = ? AND state = 'sending'")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue WHERE msg_id = ?")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Give up on a message for a non-retriable reason: out of the queue,
    /// state `failed` regardless of where the attempt stopped.
    pub async fn fail_message(&self, msg_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue WHERE msg_id = ?")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE messages SET state = 'failed' WHERE msg_id = ?")
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Explicit user retry of a failed message: back to the queue.
    pub async fn requeue_failed(&self, msg_id: i64, now: i64) -> Result<(), StoreError> {
        self.set_message_state(msg_id, MessageState::Queued).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO queue (msg_id, next_retry_at, attempts) VALUES (?, ?, 0)",
        )
        .bind(msg_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE messages SET retry_count = 0 WHERE msg_id = ?")
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All peers with at least one stored message, for backup export.
    pub async fn conversation_peers(&self) -> Result<Vec<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT peer_fp FROM messages ORDER BY peer_fp")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Import a message row, preserving its original fields. Duplicates
    /// by `(peer, seq, direction)` are skipped.
    pub async fn import_message(
        &self,
        peer_fp: &str,
        direction: Direction,
        seq_num: i64,
        plaintext: &str,
        timestamp: i64,
        state: &str,
    ) -> Result<bool, StoreError> {
        MessageState::parse(state)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages \
             (direction, peer_fp, seq_num, plaintext, timestamp, state) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(direction.as_str())
        .bind(peer_fp)
        .bind(seq_num)
        .bind(plaintext)
        .bind(timestamp)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of_signing_key(&[byte])
    }

    #[tokio::test]
    async fn seq_allocation_is_monotonic_per_peer() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = fp(1);
        let carol = fp(2);

        let (_, s1) = store.insert_outgoing(&alice, "one", 100).await.unwrap();
        let (_, s2) = store.insert_outgoing(&alice, "two", 101).await.unwrap();
        let (_, other) = store.insert_outgoing(&carol, "hi", 102).await.unwrap();
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn incoming_duplicates_are_suppressed() {
        let store = Store::open_in_memory().await.unwrap();
        let bob = fp(3);
        assert!(store.insert_incoming(&bob, 1, "hi", b"ct", 100).await.unwrap());
        assert!(!store.insert_incoming(&bob, 1, "hi", b"ct", 100).await.unwrap());
        assert_eq!(store.conversation(&bob).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_dag_is_enforced() {
        let store = Store::open_in_memory().await.unwrap();
        let peer = fp(4);
        let (msg_id, _) = store.insert_outgoing(&peer, "x", 100).await.unwrap();

        assert!(matches!(
            store.set_message_state(msg_id, MessageState::Sent).await,
            Err(StoreError::IllegalTransition { .. })
        ));
        store.set_message_state(msg_id, MessageState::Sending).await.unwrap();
        store.set_message_state(msg_id, MessageState::Sent).await.unwrap();
        store.set_message_state(msg_id, MessageState::Delivered).await.unwrap();
        store.set_message_state(msg_id, MessageState::Read).await.unwrap();
        assert!(store.set_message_state(msg_id, MessageState::Queued).await.is_err());
    }

    #[tokio::test]
    async fn ack_prunes_ciphertext_and_queue() {
        let store = Store::open_in_memory().await.unwrap();
        let peer = fp(5);
        store.upsert_contact(&peer, None, 0).await.unwrap();
        let (msg_id, seq) = store.insert_outgoing(&peer, "x", 100).await.unwrap();
        store.set_ciphertext(msg_id, b"envelope").await.unwrap();
        store.set_message_state(msg_id, MessageState::Sending).await.unwrap();
        store.mark_sent(msg_id).await.unwrap();

        let updated = store.apply_ack(&peer, seq).await.unwrap();
        assert_eq!(updated, 1);
        let row = store.message(msg_id).await.unwrap();
        assert_eq!(row.state, "delivered");
        assert!(row.ciphertext.is_none());
        assert!(store.due_retries(i64::MAX).await.unwrap().is_empty());
        assert_eq!(store.contact(&peer).await.unwrap().unwrap().last_ack_recv, seq as i64);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_message() {
        let store = Store::open_in_memory().await.unwrap();
        let peer = fp(6);
        let (msg_id, _) = store.insert_outgoing(&peer, "x", 100).await.unwrap();

        for _ in 0..MAX_RETRY {
            store.record_attempt(msg_id, 200).await.unwrap();
        }
        assert!(store.due_retries(i64::MAX).await.unwrap().is_empty());
        assert_eq!(store.message(msg_id).await.unwrap().state, "failed");

        // Explicit user retry re-queues it.
        store.requeue_failed(msg_id, 300).await.unwrap();
        assert_eq!(store.due_retries(i64::MAX).await.unwrap().len(), 1);
        assert_eq!(store.message(msg_id).await.unwrap().state, "queued");
    }

    #[tokio::test]
    async fn unread_counts_and_paging() {
        let store = Store::open_in_memory().await.unwrap();
        let peer = fp(7);
        for seq in 1..=5u64 {
            store
                .insert_incoming(&peer, seq, &format!("m{seq}"), b"ct", 100 + seq as i64)
                .await
                .unwrap();
        }
        assert_eq!(store.unread_count(&peer).await.unwrap(), 5);

        let page = store.conversation_page(&peer, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].plaintext, "m5");

        store.mark_conversation_read(&peer).await.unwrap();
        assert_eq!(store.unread_count(&peer).await.unwrap(), 0);
    }
}
