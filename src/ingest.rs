use crate::errors::{AppError, AppResult};
use crate::models::{SyncResult, TenantId};
use crate::oauth::{ProviderConnector, TokenManager};
use crate::warehouse::{TenantSession, Warehouse};
use chrono::Utc;
use rusqlite::params;

/// Raw table name for one provider entity, e.g. `raw_hubspot_deals`.
pub fn raw_table_name(source: &str, entity: &str) -> String {
    let normalize = |value: &str| {
        value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>()
    };
    format!("raw_{}_{}", normalize(source), normalize(entity))
}

/// Lands `records` in the tenant's `table`, creating it when absent.
///
/// Rows previously loaded with the same `source_tag` are replaced as a unit;
/// rows from other sources in the same table are untouched.
pub fn insert_data_to_schema(
    session: &TenantSession,
    table: &str,
    records: &[serde_json::Value],
    source_tag: &str,
) -> AppResult<usize> {
    if !table.starts_with("raw_") {
        return Err(AppError::Validation(format!(
            "raw data can only land in raw_* tables, got '{}'",
            table
        )));
    }
    let qualified = session.qualified(table)?;
    let conn = session.connection();

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
           payload TEXT NOT NULL,
           source_system TEXT NOT NULL,
           tenant_id INTEGER NOT NULL,
           loaded_at TEXT NOT NULL
         )",
        qualified
    ))?;

    let loaded_at = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        &format!("DELETE FROM {} WHERE source_system = ?1", qualified),
        [source_tag],
    )?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} (payload, source_system, tenant_id, loaded_at) VALUES (?1, ?2, ?3, ?4)",
            qualified
        ))?;
        for record in records {
            stmt.execute(params![
                serde_json::to_string(record)?,
                source_tag,
                session.tenant_id().0,
                loaded_at,
            ])?;
        }
    }
    tx.commit()?;

    Ok(records.len())
}

/// Full-refresh sync of the given entities (or every discoverable entity when
/// `entities` is `None`). A failing entity is recorded and the rest continue.
pub async fn sync_connector(
    tokens: &TokenManager,
    warehouse: &Warehouse,
    tenant_id: TenantId,
    connector: &dyn ProviderConnector,
    entities: Option<&[String]>,
) -> SyncResult {
    let started_at = Utc::now();
    let provider = connector.provider();
    let source = provider.as_str();

    let entities = match entities {
        Some(entities) => entities.to_vec(),
        None => match tokens
            .execute_with_token_refresh(tenant_id, connector, |access_token| async move {
                connector.discover_tables(&access_token).await
            })
            .await
        {
            Ok(entities) => entities,
            Err(error) => {
                tracing::warn!(tenant_id = %tenant_id, provider = source, error = %error, "table discovery failed");
                return SyncResult {
                    success: false,
                    records_synced: 0,
                    tables_synced: Vec::new(),
                    failed_tables: Vec::new(),
                    error_message: Some(error.to_string()),
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        },
    };

    let mut records_synced = 0usize;
    let mut tables_synced = Vec::new();
    let mut failed_tables = Vec::new();
    let mut errors = Vec::new();

    for entity in &entities {
        let table = raw_table_name(source, entity);
        let fetched = tokens
            .execute_with_token_refresh(tenant_id, connector, |access_token| async move {
                connector.fetch_entities(&access_token, entity).await
            })
            .await;

        let landed = fetched.and_then(|records| {
            let session = warehouse.open_session(tenant_id)?;
            insert_data_to_schema(&session, &table, &records, source)
        });

        match landed {
            Ok(count) => {
                tracing::info!(tenant_id = %tenant_id, provider = source, table = %table, records = count, "synced entity");
                records_synced += count;
                tables_synced.push(table);
            }
            Err(error) => {
                tracing::warn!(tenant_id = %tenant_id, provider = source, table = %table, error = %error, "entity sync failed");
                errors.push(format!("{}: {}", entity, error));
                failed_tables.push(table);
            }
        }
    }

    SyncResult {
        success: failed_tables.is_empty(),
        records_synced,
        tables_synced,
        failed_tables,
        error_message: if errors.is_empty() { None } else { Some(errors.join("; ")) },
        started_at,
        finished_at: Utc::now(),
    }
}
