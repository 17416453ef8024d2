//! Change feed over PostgreSQL LISTEN/NOTIFY.
//!
//! A trigger on `sync_records` announces every row change with its key. The
//! feed reads the current row for inserts and updates, so a notice for a
//! row that is already gone turns into a delete.

use async_trait::async_trait;
use crm_sync_engine::{ChangeEvent, EntityKind, ListScope};
use futures::StreamExt;
use serde::Deserialize;
use sqlx::postgres::PgListener;

use super::{get_record, Pool, PgRemoteStore};
use crate::error::RemoteError;
use crate::remote::{ChangeStream, ChangeSubscriber};

/// Channel the trigger notifies on.
pub const CHANGE_CHANNEL: &str = "sync_records_changes";

/// Notice payload sent by the trigger.
#[derive(Debug, Deserialize)]
struct ChangeNotice {
    op: String,
    entity: String,
    id: String,
}

/// Turn a notice into a change event for `kind`.
///
/// Returns `Ok(None)` for other kinds and for notices that cannot be read.
async fn resolve(
    pool: &Pool,
    kind: EntityKind,
    payload: &str,
) -> Result<Option<ChangeEvent>, RemoteError> {
    let notice: ChangeNotice = match serde_json::from_str(payload) {
        Ok(notice) => notice,
        Err(err) => {
            tracing::warn!(error = %err, payload, "Skipping malformed change notice");
            return Ok(None);
        }
    };
    if notice.entity != kind.as_str() {
        return Ok(None);
    }

    let inserted = match notice.op.as_str() {
        "insert" => true,
        "update" => false,
        "delete" => return Ok(Some(ChangeEvent::deleted(notice.id))),
        other => {
            tracing::warn!(op = other, id = %notice.id, "Skipping change notice with unknown op");
            return Ok(None);
        }
    };

    let Some(row) = get_record(pool, kind, &notice.id).await? else {
        return Ok(Some(ChangeEvent::deleted(notice.id)));
    };
    let record = row.to_record()?;

    Ok(Some(if inserted {
        ChangeEvent::inserted(record)
    } else {
        ChangeEvent::updated(record)
    }))
}

#[async_trait]
impl ChangeSubscriber for PgRemoteStore {
    async fn subscribe(&self, scope: &ListScope) -> Result<ChangeStream, RemoteError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;

        tracing::info!(scope = %scope, channel = CHANGE_CHANNEL, "Listening for record changes");

        let pool = self.pool.clone();
        let kind = scope.kind;

        // `try_recv` reports a lost connection as `None`, which ends the
        // stream. The next poll after an error ends it as well.
        let stream = futures::stream::unfold(Some(listener), move |listener| {
            let pool = pool.clone();
            async move {
                let mut listener = listener?;
                loop {
                    match listener.try_recv().await {
                        Ok(Some(notification)) => {
                            match resolve(&pool, kind, notification.payload()).await {
                                Ok(Some(event)) => return Some((Ok(event), Some(listener))),
                                Ok(None) => continue,
                                Err(err) => return Some((Err(err), None)),
                            }
                        }
                        Ok(None) => return None,
                        Err(err) => return Some((Err(RemoteError::from(err)), None)),
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
