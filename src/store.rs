use crate::cache::{self, LeadCaches};
use crate::errors::AppError;
use crate::models::{
    Lead, LeadAttribute, LeadFilter, LeadStatistics, LeadWithAttributes, NewAttribute, NewLead,
};
use sqlx::PgPool;
use std::collections::HashMap;

/// Persistence and cached-read access for lead aggregates.
///
/// The store owns cache-key construction and the invalidation discipline:
/// every committed write clears all listing caches, the written lead's by-id
/// entry, and today's statistics entry.
pub struct LeadStore {
    pool: PgPool,
    caches: LeadCaches,
}

impl LeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            caches: LeadCaches::new(),
        }
    }

    /// Persists a lead and its dynamic attributes as one atomic unit.
    ///
    /// Either every row commits or none does. A duplicate email surfaces as
    /// `AppError::Conflict` via the unique index on `leads.email`; attribute
    /// upserts rely on the `(lead_id, field_name)` unique constraint so
    /// setting an existing field updates in place.
    pub async fn insert_lead_with_attributes(
        &self,
        new_lead: &NewLead,
        attributes: &[NewAttribute],
    ) -> Result<LeadWithAttributes, AppError> {
        let mut tx = self.pool.begin().await?;

        let lead = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO leads (first_name, last_name, email, phone, date_of_birth, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now(), now())
            RETURNING *
            "#,
        )
        .bind(&new_lead.first_name)
        .bind(&new_lead.last_name)
        .bind(&new_lead.email)
        .bind(&new_lead.phone)
        .bind(new_lead.date_of_birth)
        .bind(&new_lead.status)
        .fetch_one(&mut *tx)
        .await?;

        let mut rows = Vec::with_capacity(attributes.len());
        for attr in attributes {
            let row = sqlx::query_as::<_, LeadAttribute>(
                r#"
                INSERT INTO lead_attributes (lead_id, field_name, field_value, field_type, created_at, updated_at)
                VALUES ($1, $2, $3, $4, now(), now())
                ON CONFLICT (lead_id, field_name) DO UPDATE
                SET field_value = EXCLUDED.field_value,
                    field_type = EXCLUDED.field_type,
                    updated_at = now()
                RETURNING *
                "#,
            )
            .bind(lead.id)
            .bind(&attr.field_name)
            .bind(&attr.field_value)
            .bind(attr.field_type.as_str())
            .fetch_one(&mut *tx)
            .await?;

            rows.push(row);
        }

        tx.commit().await?;

        self.caches.invalidate_after_write(lead.id).await;

        tracing::info!(
            lead_id = lead.id,
            attribute_count = rows.len(),
            "Lead persisted"
        );

        Ok(LeadWithAttributes {
            lead,
            attributes: rows,
        })
    }

    /// Deduplication pre-check used by the synchronous path only.
    ///
    /// Not atomic with the insert; the unique index is the real backstop and
    /// a lost race still resolves to the same `Conflict` outcome.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(lead)
    }

    /// Fetches one lead aggregate by id, cached under `leads_by_id_{id}`.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<LeadWithAttributes>, AppError> {
        let cache_key = cache::by_id_key(id);

        if let Some(cached) =
            LeadCaches::get_validated::<LeadWithAttributes>(&self.caches.by_id, &cache_key).await
        {
            tracing::debug!(lead_id = id, "Lead cache HIT");
            return Ok(Some(cached));
        }

        let Some(lead) = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let attributes = sqlx::query_as::<_, LeadAttribute>(
            "SELECT * FROM lead_attributes WHERE lead_id = $1 ORDER BY field_name",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let aggregate = LeadWithAttributes { lead, attributes };
        LeadCaches::insert_validated(&self.caches.by_id, cache_key, &aggregate).await;

        Ok(Some(aggregate))
    }

    /// Filtered, paginated listing with attributes, newest first.
    ///
    /// Two passes: select the matching page of ids, then refetch those ids
    /// together with their attributes preserving the ordering. The result is
    /// cached under a key built from every filter parameter.
    pub async fn find_filtered(
        &self,
        filter: &LeadFilter,
    ) -> Result<Vec<LeadWithAttributes>, AppError> {
        let cache_key = cache::filtered_key(filter);

        if let Some(cached) =
            LeadCaches::get_validated::<Vec<LeadWithAttributes>>(&self.caches.listings, &cache_key)
                .await
        {
            tracing::debug!(key = %cache_key, "Listing cache HIT");
            return Ok(cached);
        }

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM leads
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR email LIKE '%' || $2 || '%')
              AND ($3::text IS NULL
                   OR first_name LIKE '%' || $3 || '%'
                   OR last_name LIKE '%' || $3 || '%'
                   OR email LIKE '%' || $3 || '%'
                   OR phone LIKE '%' || $3 || '%')
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(&filter.status)
        .bind(&filter.email)
        .bind(&filter.search)
        .bind(filter.limit)
        .bind(filter.offset())
        .fetch_all(&self.pool)
        .await?;

        let leads = sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE id = ANY($1) ORDER BY created_at DESC, id DESC",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let attributes = sqlx::query_as::<_, LeadAttribute>(
            "SELECT * FROM lead_attributes WHERE lead_id = ANY($1) ORDER BY field_name",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let aggregates = group_attributes(leads, attributes);
        LeadCaches::insert_validated(&self.caches.listings, cache_key, &aggregates).await;

        Ok(aggregates)
    }

    /// Total row count under the same predicates as [`find_filtered`].
    pub async fn count_filtered(&self, filter: &LeadFilter) -> Result<i64, AppError> {
        let cache_key = cache::count_key(filter);

        if let Some(cached) =
            LeadCaches::get_validated::<i64>(&self.caches.listings, &cache_key).await
        {
            return Ok(cached);
        }

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM leads
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR email LIKE '%' || $2 || '%')
              AND ($3::text IS NULL
                   OR first_name LIKE '%' || $3 || '%'
                   OR last_name LIKE '%' || $3 || '%'
                   OR email LIKE '%' || $3 || '%'
                   OR phone LIKE '%' || $3 || '%')
            "#,
        )
        .bind(&filter.status)
        .bind(&filter.email)
        .bind(&filter.search)
        .fetch_one(&self.pool)
        .await?;

        LeadCaches::insert_validated(&self.caches.listings, cache_key, &total).await;

        Ok(total)
    }

    /// Aggregate counts. The `today` bucket uses the UTC day boundary, the
    /// same clock the daily cache key is built from.
    pub async fn statistics(&self) -> Result<LeadStatistics, AppError> {
        let cache_key = cache::statistics_key();

        if let Some(cached) =
            LeadCaches::get_validated::<LeadStatistics>(&self.caches.statistics, &cache_key).await
        {
            return Ok(cached);
        }

        let stats = sqlx::query_as::<_, LeadStatistics>(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'active') AS active,
                   COUNT(*) FILTER (WHERE status = 'converted') AS converted,
                   COUNT(*) FILTER (WHERE status = 'inactive') AS inactive,
                   COUNT(*) FILTER (WHERE created_at >= date_trunc('day', now() AT TIME ZONE 'UTC') AT TIME ZONE 'UTC') AS today
            FROM leads
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        LeadCaches::insert_validated(&self.caches.statistics, cache_key, &stats).await;

        Ok(stats)
    }

    /// Preloads the entries most listing traffic hits first.
    pub async fn warm_up(&self) -> Result<(), AppError> {
        self.statistics().await?;
        self.find_filtered(&LeadFilter::default()).await?;
        self.count_filtered(&LeadFilter {
            status: Some("active".to_string()),
            ..LeadFilter::default()
        })
        .await?;

        tracing::info!("Lead caches warmed up");
        Ok(())
    }
}

/// Joins leads with their attribute rows, preserving the lead ordering.
fn group_attributes(leads: Vec<Lead>, attributes: Vec<LeadAttribute>) -> Vec<LeadWithAttributes> {
    let mut by_lead: HashMap<i64, Vec<LeadAttribute>> = HashMap::new();
    for attr in attributes {
        by_lead.entry(attr.lead_id).or_default().push(attr);
    }

    leads
        .into_iter()
        .map(|lead| {
            let attributes = by_lead.remove(&lead.id).unwrap_or_default();
            LeadWithAttributes { lead, attributes }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn lead(id: i64, email: &str) -> Lead {
        Lead {
            id,
            first_name: "A".to_string(),
            last_name: "B".to_string(),
            email: email.to_string(),
            phone: None,
            date_of_birth: None,
            status: "active".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn attribute(id: i64, lead_id: i64, name: &str) -> LeadAttribute {
        LeadAttribute {
            id,
            lead_id,
            field_name: name.to_string(),
            field_value: Some("x".to_string()),
            field_type: "string".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn grouping_preserves_lead_order_and_assigns_rows() {
        let leads = vec![lead(2, "b@x.com"), lead(1, "a@x.com")];
        let attrs = vec![
            attribute(10, 1, "company"),
            attribute(11, 2, "source"),
            attribute(12, 1, "score"),
        ];

        let grouped = group_attributes(leads, attrs);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].lead.id, 2);
        assert_eq!(grouped[0].attributes.len(), 1);
        assert_eq!(grouped[1].lead.id, 1);
        assert_eq!(grouped[1].attributes.len(), 2);
    }

    #[test]
    fn grouping_handles_leads_without_attributes() {
        let grouped = group_attributes(vec![lead(5, "c@x.com")], Vec::new());
        assert_eq!(grouped.len(), 1);
        assert!(grouped[0].attributes.is_empty());
    }
}
