//! Contact set: watermarks, sync bookkeeping, blocking.
//!
//! Contacts are local-only records; nothing here is published to the DHT
//! except through the explicit encrypted backup channel.

use dna_crypto::Fingerprint;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::ContactRow;

impl Store {
    /// Insert or refresh a contact. Existing watermarks survive.
    pub async fn upsert_contact(
        &self,
        fp: &Fingerprint,
        display_name: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contacts (fp, display_name, added_at) VALUES (?, ?, ?) \
             ON CONFLICT (fp) DO UPDATE SET display_name = COALESCE(excluded.display_name, display_name)",
        )
        .bind(fp.to_hex())
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_contact(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM contacts WHERE fp = ?")
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contact(&self, fp: &Fingerprint) -> Result<Option<ContactRow>, StoreError> {
        Ok(sqlx::query_as::<_, ContactRow>(
            "SELECT fp, display_name, nickname, last_seen, watermark, last_ack_recv, \
                    last_ack_sent, dm_last_sync, blocked, added_at \
             FROM contacts WHERE fp = ?",
        )
        .bind(fp.to_hex())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn contacts(&self) -> Result<Vec<ContactRow>, StoreError> {
        Ok(sqlx::query_as::<_, ContactRow>(
            "SELECT fp, display_name, nickname, last_seen, watermark, last_ack_recv, \
                    last_ack_sent, dm_last_sync, blocked, added_at \
             FROM contacts ORDER BY added_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_nickname(
        &self,
        fp: &Fingerprint,
        nickname: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET nickname = ? WHERE fp = ?")
            .bind(nickname)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_blocked(&self, fp: &Fingerprint, blocked: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET blocked = ? WHERE fp = ?")
            .bind(blocked)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_blocked(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let blocked: Option<bool> =
            sqlx::query_scalar("SELECT blocked FROM contacts WHERE fp = ?")
                .bind(fp.to_hex())
                .fetch_optional(&self.pool)
                .await?;
        Ok(blocked.unwrap_or(false))
    }

    pub async fn touch_last_seen(&self, fp: &Fingerprint, now: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET last_seen = MAX(last_seen, ?) WHERE fp = ?")
            .bind(now)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Sync bookkeeping ─────────────────────────────────────────────────────

    /// Highest seq_num already stored from this sender.
    pub async fn watermark(&self, fp: &Fingerprint) -> Result<u64, StoreError> {
        let wm: Option<i64> = sqlx::query_scalar("SELECT watermark FROM contacts WHERE fp = ?")
            .bind(fp.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        Ok(wm.unwrap_or(0) as u64)
    }

    /// Advance the dedup watermark (never moves backwards).
    pub async fn advance_watermark(
        &self,
        fp: &Fingerprint,
        seq: u64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET watermark = MAX(watermark, ?) WHERE fp = ?")
            .bind(seq as i64)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_ack_sent(&self, fp: &Fingerprint, seq: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET last_ack_sent = MAX(last_ack_sent, ?) WHERE fp = ?")
            .bind(seq as i64)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_dm_last_sync(&self, fp: &Fingerprint, now: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE contacts SET dm_last_sync = ? WHERE fp = ?")
            .bind(now)
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The stalest sync time across the contact set; 0 if any contact has
    /// never synced. Drives the recent-vs-full window choice.
    pub async fn oldest_dm_sync(&self) -> Result<Option<i64>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT MIN(dm_last_sync) FROM contacts WHERE blocked = 0")
                .fetch_optional(&self.pool)
                .await?
                .flatten(),
        )
    }

    // ── Denied contact requests ──────────────────────────────────────────────

    pub async fn deny_request(&self, fp: &Fingerprint, now: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO denied_requests (fp, denied_at) VALUES (?, ?)")
            .bind(fp.to_hex())
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Approving a previously-denied requester clears the denial.
    pub async fn clear_denied(&self, fp: &Fingerprint) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM denied_requests WHERE fp = ?")
            .bind(fp.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_denied(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT denied_at FROM denied_requests WHERE fp = ?")
                .bind(fp.to_hex())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of_signing_key(&[byte])
    }

    #[tokio::test]
    async fn upsert_preserves_watermarks() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = fp(1);
        store.upsert_contact(&alice, Some("alice"), 100).await.unwrap();
        store.advance_watermark(&alice, 9).await.unwrap();

        store.upsert_contact(&alice, Some("alice2"), 200).await.unwrap();
        assert_eq!(store.watermark(&alice).await.unwrap(), 9);
        let row = store.contact(&alice).await.unwrap().unwrap();
        assert_eq!(row.display_name.as_deref(), Some("alice2"));
        assert_eq!(row.added_at, 100);
    }

    #[tokio::test]
    async fn watermark_never_regresses() {
        let store = Store::open_in_memory().await.unwrap();
        let alice = fp(2);
        store.upsert_contact(&alice, None, 0).await.unwrap();
        store.advance_watermark(&alice, 5).await.unwrap();
        store.advance_watermark(&alice, 3).await.unwrap();
        assert_eq!(store.watermark(&alice).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn blocking_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let eve = fp(3);
        store.upsert_contact(&eve, None, 0).await.unwrap();
        assert!(!store.is_blocked(&eve).await.unwrap());
        store.set_blocked(&eve, true).await.unwrap();
        assert!(store.is_blocked(&eve).await.unwrap());
        store.set_blocked(&eve, false).await.unwrap();
        assert!(!store.is_blocked(&eve).await.unwrap());
    }

    #[tokio::test]
    async fn oldest_sync_ignores_blocked() {
        let store = Store::open_in_memory().await.unwrap();
        let a = fp(4);
        let b = fp(5);
        store.upsert_contact(&a, None, 0).await.unwrap();
        store.upsert_contact(&b, None, 0).await.unwrap();
        store.set_dm_last_sync(&a, 1000).await.unwrap();
        // b never synced → 0 drives a full sync.
        assert_eq!(store.oldest_dm_sync().await.unwrap(), Some(0));

        store.set_blocked(&b, true).await.unwrap();
        assert_eq!(store.oldest_dm_sync().await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn denial_is_remembered() {
        let store = Store::open_in_memory().await.unwrap();
        let spammer = fp(6);
        assert!(!store.is_denied(&spammer).await.unwrap());
        store.deny_request(&spammer, 100).await.unwrap();
        assert!(store.is_denied(&spammer).await.unwrap());
    }
}
