use core_types::{ModelParameters, Profile, ProfileId};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, warn};

use crate::{Result, SqliteStorage, StorageError, parse_id};

const PROFILE_COLUMNS: &str = "id, name, api_endpoint, model_name, temperature, max_tokens, \
     top_p, frequency_penalty, presence_penalty, is_default";

impl SqliteStorage {
    /// Inserts a profile. A default profile takes the flag from every other
    /// profile in the same transaction.
    pub async fn save_profile(&self, profile: &Profile) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        if profile.is_default {
            clear_default(&mut tx).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO profiles(
                id, name, api_endpoint, model_name, temperature, max_tokens,
                top_p, frequency_penalty, presence_penalty, is_default
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(profile.id.to_string())
        .bind(&profile.name)
        .bind(&profile.api_endpoint)
        .bind(&profile.model_name)
        .bind(profile.parameters.temperature)
        .bind(i64::from(profile.parameters.max_tokens))
        .bind(profile.parameters.top_p)
        .bind(profile.parameters.frequency_penalty)
        .bind(profile.parameters.presence_penalty)
        .bind(profile.is_default)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(profile_id = %profile.id, is_default = profile.is_default, "saved profile");
        Ok(())
    }

    pub async fn update_profile(&self, profile: &Profile) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        if profile.is_default {
            clear_default(&mut tx).await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET name = ?2, api_endpoint = ?3, model_name = ?4, temperature = ?5,
                max_tokens = ?6, top_p = ?7, frequency_penalty = ?8,
                presence_penalty = ?9, is_default = ?10
            WHERE id = ?1
            "#,
        )
        .bind(profile.id.to_string())
        .bind(&profile.name)
        .bind(&profile.api_endpoint)
        .bind(&profile.model_name)
        .bind(profile.parameters.temperature)
        .bind(i64::from(profile.parameters.max_tokens))
        .bind(profile.parameters.top_p)
        .bind(profile.parameters.frequency_penalty)
        .bind(profile.parameters.presence_penalty)
        .bind(profile.is_default)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("profile", profile.id));
        }
        tx.commit().await?;
        info!(profile_id = %profile.id, "updated profile");
        Ok(())
    }

    /// Deletes a non-default profile. Conversations pointing at it keep
    /// existing with no profile.
    pub async fn delete_profile(&self, id: ProfileId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT is_default FROM profiles WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(StorageError::not_found("profile", id));
        };
        if row.try_get::<bool, _>("is_default")? {
            warn!(profile_id = %id, "refusing to delete default profile");
            return Err(StorageError::ConstraintViolation(format!(
                "profile {id} is the default profile"
            )));
        }

        sqlx::query("DELETE FROM profiles WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(profile_id = %id, "deleted profile");
        Ok(())
    }

    /// Clears every default flag, then sets the one for `id`, atomically.
    pub async fn set_default_profile(&self, id: ProfileId) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        clear_default(&mut tx).await?;
        let result = sqlx::query("UPDATE profiles SET is_default = 1 WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the cleared flags.
            return Err(StorageError::not_found("profile", id));
        }
        tx.commit().await?;
        info!(profile_id = %id, "default profile changed");
        Ok(())
    }

    pub async fn get_default_profile(&self) -> Result<Option<Profile>> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE is_default = 1 LIMIT 1"
        ))
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_profile_row).transpose()
    }

    pub async fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>> {
        let row = sqlx::query(&format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_profile_row).transpose()
    }

    /// All profiles ordered by name.
    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY name ASC, rowid ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_profile_row).collect()
    }

    pub async fn count_profiles(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM profiles")
            .fetch_one(self.pool())
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }
}

async fn clear_default(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query("UPDATE profiles SET is_default = 0 WHERE is_default = 1")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn map_profile_row(row: &SqliteRow) -> Result<Profile> {
    let max_tokens: i64 = row.try_get("max_tokens")?;
    let max_tokens = u32::try_from(max_tokens)
        .map_err(|_| StorageError::Unavailable(format!("corrupt max_tokens {max_tokens}")))?;
    Ok(Profile {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        api_endpoint: row.try_get("api_endpoint")?,
        model_name: row.try_get("model_name")?,
        is_default: row.try_get("is_default")?,
        parameters: ModelParameters {
            temperature: row.try_get("temperature")?,
            max_tokens,
            top_p: row.try_get("top_p")?,
            frequency_penalty: row.try_get("frequency_penalty")?,
            presence_penalty: row.try_get("presence_penalty")?,
        },
    })
}
