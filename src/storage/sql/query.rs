//! Row selection shared by every backend.

use chrono::{DateTime, Utc};
use sea_query::{Alias, Cond, Expr, Order, Query, SelectStatement};

use crate::storage::schema::Chain;
use crate::storage::SnapshotId;

/// Which rows of a collection table a read wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// The current snapshot of one entity.
    Current(String),
    /// Current snapshots of the listed entities.
    CurrentIn(Vec<String>),
    /// Every current snapshot.
    AllCurrent,
    /// Every snapshot of one entity, closed ones included.
    History(String),
    /// The snapshot of one entity valid at an instant.
    At(String, DateTime<Utc>),
}

impl RowFilter {
    /// Build the SELECT for this filter, ordered by snapshot id.
    ///
    /// `after` and `limit` turn the statement into one keyset page.
    pub fn select(
        &self,
        table: &str,
        after: Option<SnapshotId>,
        limit: Option<u64>,
    ) -> SelectStatement {
        let mut cond = Cond::all();
        cond = match self {
            RowFilter::Current(id) => cond
                .add(Expr::col(Chain::Id).eq(id.as_str()))
                .add(Expr::col(Chain::ValidTo).is_null()),
            RowFilter::CurrentIn(ids) => cond
                .add(Expr::col(Chain::Id).is_in(ids.iter().map(String::as_str)))
                .add(Expr::col(Chain::ValidTo).is_null()),
            RowFilter::AllCurrent => cond.add(Expr::col(Chain::ValidTo).is_null()),
            RowFilter::History(id) => cond.add(Expr::col(Chain::Id).eq(id.as_str())),
            RowFilter::At(id, at) => cond
                .add(Expr::col(Chain::Id).eq(id.as_str()))
                .add(Expr::col(Chain::ValidFrom).lte(*at))
                .add(
                    Cond::any()
                        .add(Expr::col(Chain::ValidTo).is_null())
                        .add(Expr::col(Chain::ValidTo).gt(*at)),
                ),
        };
        if let Some(after) = after {
            cond = cond.add(Expr::col(Chain::SnapshotId).gt(after.as_i64()));
        }

        let mut stmt = Query::select()
            .columns([
                Chain::SnapshotId,
                Chain::Id,
                Chain::Data,
                Chain::ValidFrom,
                Chain::ValidTo,
            ])
            .from(Alias::new(table))
            .cond_where(cond)
            .order_by(Chain::SnapshotId, Order::Asc)
            .to_owned();
        if let Some(limit) = limit {
            stmt.limit(limit);
        }
        stmt
    }
}
