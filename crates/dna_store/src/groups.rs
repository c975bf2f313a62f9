//! Groups, membership, the GEK cache and group history.

use uuid::Uuid;

use dna_crypto::Fingerprint;
use dna_proto::group::Gek;
use zeroize::Zeroizing;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{GroupMemberRow, GroupMessageRow, GroupRow};

impl Store {
    pub async fn insert_group(
        &self,
        uuid: &Uuid,
        name: &str,
        owner: &Fingerprint,
        gek_version: u32,
        created_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO groups (uuid, name, owner_fp, gek_version, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (uuid) DO UPDATE SET name = excluded.name, \
                 gek_version = MAX(gek_version, excluded.gek_version)",
        )
        .bind(uuid.to_string())
        .bind(name)
        .bind(owner.to_hex())
        .bind(gek_version as i64)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn group(&self, uuid: &Uuid) -> Result<Option<GroupRow>, StoreError> {
        Ok(sqlx::query_as::<_, GroupRow>(
            "SELECT uuid, name, owner_fp, gek_version, created_at FROM groups WHERE uuid = ?",
        )
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_gek_version(&self, uuid: &Uuid, version: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE groups SET gek_version = ? WHERE uuid = ?")
            .bind(version as i64)
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the member list wholesale (rotation rewrites it anyway).
    pub async fn replace_group_members(
        &self,
        uuid: &Uuid,
        members: &[(Fingerprint, i64)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_members WHERE group_uuid = ?")
            .bind(uuid.to_string())
            .execute(&mut *tx)
            .await?;
        for (fp, added_at) in members {
            sqlx::query(
                "INSERT INTO group_members (group_uuid, fp, added_at) VALUES (?, ?, ?)",
            )
            .bind(uuid.to_string())
            .bind(fp.to_hex())
            .bind(added_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn group_members(&self, uuid: &Uuid) -> Result<Vec<GroupMemberRow>, StoreError> {
        Ok(sqlx::query_as::<_, GroupMemberRow>(
            "SELECT group_uuid, fp, added_at FROM group_members \
             WHERE group_uuid = ? ORDER BY added_at ASC, fp ASC",
        )
        .bind(uuid.to_string())
        .fetch_all(&self.pool)
        .await?)
    }

    // ── GEK cache ────────────────────────────────────────────────────────────

    /// Cache a GEK version. Old versions are retained for history.
    pub async fn store_gek(
        &self,
        uuid: &Uuid,
        version: u32,
        gek: &Gek,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO gek_cache (group_uuid, version, gek) VALUES (?, ?, ?)",
        )
        .bind(uuid.to_string())
        .bind(version as i64)
        .bind(gek.as_slice())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn gek(&self, uuid: &Uuid, version: u32) -> Result<Option<Gek>, StoreError> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT gek FROM gek_cache WHERE group_uuid = ? AND version = ?")
                .bind(uuid.to_string())
                .bind(version as i64)
                .fetch_optional(&self.pool)
                .await?;
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("gek length".into()))?;
                Ok(Some(Zeroizing::new(arr)))
            }
        }
    }

    // ── Group history ────────────────────────────────────────────────────────

    /// Store a decrypted group message; the raw-blob hash deduplicates
    /// re-sweeps. Returns whether a new row was inserted.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_group_message(
        &self,
        uuid: &Uuid,
        message_hash: &str,
        sender: &Fingerprint,
        gek_version: u32,
        plaintext: &str,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO group_messages \
             (group_uuid, message_hash, sender_fp, gek_version, plaintext, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid.to_string())
        .bind(message_hash)
        .bind(sender.to_hex())
        .bind(gek_version as i64)
        .bind(plaintext)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn group_conversation(
        &self,
        uuid: &Uuid,
    ) -> Result<Vec<GroupMessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, GroupMessageRow>(
            "SELECT group_uuid, message_hash, sender_fp, gek_version, plaintext, timestamp \
             FROM group_messages WHERE group_uuid = ? ORDER BY timestamp ASC",
        )
        .bind(uuid.to_string())
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of_signing_key(&[byte])
    }

    #[tokio::test]
    async fn group_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let uuid = Uuid::new_v4();
        let owner = fp(1);

        store.insert_group(&uuid, "team", &owner, 1, 100).await.unwrap();
        store
            .replace_group_members(&uuid, &[(owner, 100), (fp(2), 100)])
            .await
            .unwrap();
        assert_eq!(store.group_members(&uuid).await.unwrap().len(), 2);

        store.set_gek_version(&uuid, 2).await.unwrap();
        store
            .replace_group_members(&uuid, &[(owner, 100), (fp(2), 100), (fp(3), 200)])
            .await
            .unwrap();
        let row = store.group(&uuid).await.unwrap().unwrap();
        assert_eq!(row.gek_version, 2);
        assert_eq!(store.group_members(&uuid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gek_cache_retains_history() {
        let store = Store::open_in_memory().await.unwrap();
        let uuid = Uuid::new_v4();
        store.store_gek(&uuid, 1, &Zeroizing::new([1u8; 32])).await.unwrap();
        store.store_gek(&uuid, 2, &Zeroizing::new([2u8; 32])).await.unwrap();

        assert_eq!(*store.gek(&uuid, 1).await.unwrap().unwrap(), [1u8; 32]);
        assert_eq!(*store.gek(&uuid, 2).await.unwrap().unwrap(), [2u8; 32]);
        assert!(store.gek(&uuid, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_messages_dedup_by_hash() {
        let store = Store::open_in_memory().await.unwrap();
        let uuid = Uuid::new_v4();
        let sender = fp(4);
        assert!(store
            .insert_group_message(&uuid, "hash1", &sender, 1, "hello", 100)
            .await
            .unwrap());
        assert!(!store
            .insert_group_message(&uuid, "hash1", &sender, 1, "hello", 100)
            .await
            .unwrap());
        assert_eq!(store.group_conversation(&uuid).await.unwrap().len(), 1);
    }
}
