use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dealspy_core::{
    Category, ChannelSettings, Deal, Language, NewDeal, Source, Subscription,
    SubscriptionStatus, SubscriptionTier, User, UserPreference,
};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{DealStore, StorageError, Upserted, UserDirectory};

const DEAL_COLUMNS: &str = "id, source, source_id, title_original, title_hu, title_en, title_de, \
    description_original, description_hu, description_en, category, country, price, currency, \
    deadline, url, image_url, created_at, notified_at, raw_data";

/// PostgreSQL-backed deal ledger and user directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StorageError::Query(err.to_string()))?;
        info!("database migrations applied");
        Ok(())
    }

    async fn fetch_by_key(&self, source: Source, source_id: &str) -> Result<Deal, StorageError> {
        let sql = format!("SELECT {DEAL_COLUMNS} FROM deals WHERE source = $1 AND source_id = $2");
        let row = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        deal_from_row(&row)
    }
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StorageError>
where
    T::Err: std::fmt::Display,
{
    let text: String = row.try_get(column)?;
    text.parse::<T>()
        .map_err(|err| StorageError::Decode(format!("{column}: {err}")))
}

fn deal_from_row(row: &PgRow) -> Result<Deal, StorageError> {
    let category: Option<String> = row.try_get("category")?;
    let category = match category.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(
            text.parse::<Category>()
                .map_err(|err| StorageError::Decode(format!("category: {err}")))?,
        ),
    };
    let raw: JsonValue = row.try_get("raw_data")?;
    let raw = match raw {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Deal {
        id: row.try_get("id")?,
        source: parse_column(row, "source")?,
        source_id: row.try_get("source_id")?,
        title_original: row.try_get("title_original")?,
        title_hu: row.try_get("title_hu")?,
        title_en: row.try_get("title_en")?,
        title_de: row.try_get("title_de")?,
        description_original: row.try_get("description_original")?,
        description_hu: row.try_get("description_hu")?,
        description_en: row.try_get("description_en")?,
        category,
        country: parse_column(row, "country")?,
        price: row.try_get::<Option<Decimal>, _>("price")?,
        currency: row.try_get("currency")?,
        deadline: row.try_get::<Option<NaiveDate>, _>("deadline")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
        notified_at: row.try_get("notified_at")?,
        raw,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StorageError> {
    let countries: Vec<String> = row.try_get("countries")?;
    let categories: Vec<String> = row.try_get("categories")?;
    let sources: Vec<String> = row.try_get("sources")?;
    let keywords: Vec<String> = row.try_get("keywords")?;
    let preferences = UserPreference::from_raw(&countries, &categories, &sources, &keywords)
        .map_err(|err| StorageError::Decode(err.to_string()))?;

    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        language: parse_column::<Language>(row, "language")?,
        preferences,
        channels: ChannelSettings {
            push: row.try_get("notify_push")?,
            email: row.try_get("notify_email")?,
            telegram: row.try_get("notify_telegram")?,
        },
        push_player_id: row.try_get("onesignal_player_id")?,
        telegram_chat_id: row.try_get("telegram_chat_id")?,
        subscription: Subscription {
            tier: parse_column::<SubscriptionTier>(row, "subscription_tier")?,
            status: parse_column::<SubscriptionStatus>(row, "subscription_status")?,
            trial_ends_at: row.try_get::<Option<DateTime<Utc>>, _>("trial_ends_at")?,
            subscription_ends_at: row.try_get::<Option<DateTime<Utc>>, _>("subscription_ends_at")?,
        },
    })
}

#[async_trait]
impl DealStore for PgStore {
    async fn exists(&self, source: Source, source_id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM deals WHERE source = $1 AND source_id = $2
            ) AS found
            "#,
        )
        .bind(source.as_str())
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    async fn upsert(&self, deal: NewDeal) -> Result<Upserted, StorageError> {
        let sql = format!(
            r#"
            INSERT INTO deals (
                id, source, source_id, title_original, title_hu, title_en, title_de,
                description_original, description_hu, description_en, category, country,
                price, currency, deadline, url, image_url, raw_data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (source, source_id) DO NOTHING
            RETURNING {DEAL_COLUMNS}
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(deal.source.as_str())
            .bind(&deal.source_id)
            .bind(&deal.title_original)
            .bind(&deal.title_hu)
            .bind(&deal.title_en)
            .bind(&deal.title_de)
            .bind(&deal.description_original)
            .bind(&deal.description_hu)
            .bind(&deal.description_en)
            .bind(deal.category.map(Category::as_str))
            .bind(deal.country.as_str())
            .bind(deal.price)
            .bind(&deal.currency)
            .bind(deal.deadline)
            .bind(&deal.url)
            .bind(&deal.image_url)
            .bind(JsonValue::Object(deal.raw.clone()))
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(Upserted {
                deal: deal_from_row(&row)?,
                inserted: true,
            }),
            None => Ok(Upserted {
                deal: self.fetch_by_key(deal.source, &deal.source_id).await?,
                inserted: false,
            }),
        }
    }

    async fn get_unnotified(&self) -> Result<Vec<Deal>, StorageError> {
        let sql = format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE notified_at IS NULL ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(deal_from_row).collect()
    }

    async fn mark_notified(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE deals
               SET notified_at = COALESCE(notified_at, now())
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn created_since(&self, since: DateTime<Utc>) -> Result<Vec<Deal>, StorageError> {
        let sql = format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE created_at >= $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(deal_from_row).collect()
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn active_users(&self) -> Result<Vec<User>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, language, notify_push, notify_email, notify_telegram,
                   telegram_chat_id, onesignal_player_id, categories, countries, keywords, sources,
                   subscription_tier, subscription_status, trial_ends_at, subscription_ends_at
              FROM users
             WHERE subscription_status IN ('trialing', 'active')
               AND subscription_tier <> 'cancelled'
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            match user_from_row(row) {
                Ok(user) => users.push(user),
                Err(err) => {
                    let id: Option<Uuid> = row.try_get("id").ok();
                    warn!(user_id = ?id, error = %err, "skipping user with malformed preferences");
                }
            }
        }
        Ok(users)
    }
}
