//! Per-database `SqlDatabase` implementations.
//!
//! Uses a macro to generate the implementation for each SQL backend,
//! eliminating code duplication while keeping every statement typed against
//! the concrete sqlx driver. Statements are built with sea-query and bound
//! through sea-query-binder, so payloads and ids never end up inlined in
//! the SQL text.

/// Implement `SqlDatabase` for a sqlx driver.
///
/// - `$db`: the sqlx database type (`sqlx::Postgres`, `sqlx::Sqlite`)
/// - `$builder`: the matching sea-query query builder
/// - `storage_type`: the `StorageType` configuring this backend
/// - `ddl`: function producing the collection table DDL
/// - `uri`: closure reading the connection string from `StorageConfig`
/// - `clock`: closure producing the SQL expression for "now" at write time
macro_rules! impl_sql_database {
    (
        $db:ty,
        $builder:expr,
        storage_type: $storage_type:expr,
        ddl: $ddl:path,
        uri: $uri:expr,
        clock: $clock:expr
    ) => {
        fn decode_row(
            row: &<$db as sqlx::Database>::Row,
        ) -> crate::storage::Result<crate::storage::Snapshot> {
            use sqlx::Row;

            Ok(crate::storage::Snapshot::new(
                row.try_get("id")?,
                crate::storage::SnapshotId::from(row.try_get::<i64, _>("snapshot_id")?),
                crate::storage::Payload::from(row.try_get::<Vec<u8>, _>("data")?),
                row.try_get("valid_from")?,
                row.try_get("valid_to")?,
            ))
        }

        #[async_trait::async_trait]
        impl crate::storage::sql::SqlDatabase for $db {
            const STORAGE_TYPE: crate::config::StorageType = $storage_type;

            fn connection_uri(config: &crate::config::StorageConfig) -> String {
                ($uri)(config)
            }

            async fn create_table(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
            ) -> crate::storage::Result<()> {
                for statement in $ddl(table) {
                    sqlx::query(&statement).execute(&mut *conn).await?;
                }
                Ok(())
            }

            async fn insert_guarded(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                id: &str,
                payload: &[u8],
            ) -> crate::storage::Result<
                Option<(crate::storage::SnapshotId, chrono::DateTime<chrono::Utc>)>,
            > {
                use sea_query::{Alias, Expr, OnConflict, Query};
                use sea_query_binder::SqlxBinder;
                use sqlx::Row;

                use crate::storage::schema::Chain;

                // INSERT ... SELECT ... WHERE NOT EXISTS (current row for id)
                let current = Query::select()
                    .expr(Expr::val(1))
                    .from(Alias::new(table))
                    .and_where(Expr::col(Chain::Id).eq(id))
                    .and_where(Expr::col(Chain::ValidTo).is_null())
                    .to_owned();
                let source = Query::select()
                    .expr(Expr::val(id))
                    .expr(Expr::val(payload.to_vec()))
                    .expr(($clock)())
                    .and_where(Expr::exists(current).not())
                    .to_owned();
                // A concurrent first-create that commits after the guard is
                // absorbed by the partial index instead of raising, so an
                // enclosing transaction stays usable.
                let (sql, values) = Query::insert()
                    .into_table(Alias::new(table))
                    .columns([Chain::Id, Chain::Data, Chain::ValidFrom])
                    .select_from(source)?
                    .on_conflict(
                        OnConflict::column(Chain::Id)
                            .target_and_where(Expr::col(Chain::ValidTo).is_null())
                            .do_nothing()
                            .to_owned(),
                    )
                    .returning(Query::returning().columns([Chain::SnapshotId, Chain::ValidFrom]))
                    .build_sqlx($builder);

                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&mut *conn)
                    .await?;
                match row {
                    Some(row) => Ok(Some((
                        crate::storage::SnapshotId::from(row.try_get::<i64, _>(0)?),
                        row.try_get(1)?,
                    ))),
                    None => Ok(None),
                }
            }

            async fn close_current(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                id: &str,
                prev: crate::storage::SnapshotId,
            ) -> crate::storage::Result<Option<chrono::DateTime<chrono::Utc>>> {
                use sea_query::{Alias, Expr, Func, Query};
                use sea_query_binder::SqlxBinder;
                use sqlx::Row;

                use crate::storage::schema::Chain;

                // Never close a row before it opened, whatever the clock says.
                let closed_at = Func::greatest([($clock)(), Expr::col(Chain::ValidFrom).into()]);
                let (sql, values) = Query::update()
                    .table(Alias::new(table))
                    .value(Chain::ValidTo, closed_at)
                    .and_where(Expr::col(Chain::Id).eq(id))
                    .and_where(Expr::col(Chain::SnapshotId).eq(prev.as_i64()))
                    .and_where(Expr::col(Chain::ValidTo).is_null())
                    .returning_col(Chain::ValidTo)
                    .build_sqlx($builder);

                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&mut *conn)
                    .await?;
                match row {
                    Some(row) => Ok(Some(row.try_get(0)?)),
                    None => Ok(None),
                }
            }

            async fn insert_successor(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                id: &str,
                payload: &[u8],
                valid_from: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<crate::storage::SnapshotId> {
                use sea_query::{Alias, Query};
                use sea_query_binder::SqlxBinder;
                use sqlx::Row;

                use crate::storage::schema::Chain;

                let (sql, values) = Query::insert()
                    .into_table(Alias::new(table))
                    .columns([Chain::Id, Chain::Data, Chain::ValidFrom])
                    .values([id.into(), payload.to_vec().into(), valid_from.into()])?
                    .returning_col(Chain::SnapshotId)
                    .build_sqlx($builder);

                let row = sqlx::query_with(&sql, values)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(crate::storage::SnapshotId::from(row.try_get::<i64, _>(0)?))
            }

            async fn fetch_one(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                filter: &crate::storage::sql::RowFilter,
            ) -> crate::storage::Result<Option<crate::storage::Snapshot>> {
                use sea_query_binder::SqlxBinder;

                let (sql, values) = filter.select(table, None, Some(1)).build_sqlx($builder);
                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&mut *conn)
                    .await?;
                row.as_ref().map(decode_row).transpose()
            }

            async fn fetch_page(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                filter: &crate::storage::sql::RowFilter,
                after: Option<crate::storage::SnapshotId>,
                limit: u64,
            ) -> crate::storage::Result<Vec<crate::storage::Snapshot>> {
                use sea_query_binder::SqlxBinder;

                let (sql, values) = filter
                    .select(table, after, Some(limit))
                    .build_sqlx($builder);
                let rows = sqlx::query_with(&sql, values)
                    .fetch_all(&mut *conn)
                    .await?;
                rows.iter().map(decode_row).collect()
            }

            async fn stream_rows(
                conn: &mut <$db as sqlx::Database>::Connection,
                table: &str,
                filter: &crate::storage::sql::RowFilter,
                sink: &tokio::sync::mpsc::Sender<crate::storage::Result<crate::storage::Snapshot>>,
            ) -> crate::storage::Result<()> {
                use futures::TryStreamExt;
                use sea_query_binder::SqlxBinder;

                let (sql, values) = filter.select(table, None, None).build_sqlx($builder);
                let mut rows = sqlx::query_with(&sql, values).fetch(&mut *conn);

                loop {
                    let row = tokio::select! {
                        _ = sink.closed() => break,
                        row = rows.try_next() => row?,
                    };
                    let Some(row) = row else { break };
                    if sink.send(Ok(decode_row(&row)?)).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
        }
    };
}
