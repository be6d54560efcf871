use std::any::type_name;
use std::fmt;

type DynError = dyn std::error::Error + Send + Sync + 'static;
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unrecoverable errors from database communication layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database query failed")]
    Query {
        #[from]
        source: sqlx::Error,
    },

    #[error(
        "Failed to serialize app value into db repr.\n\
        App type: {app_ty}\n\
        Db type: {db_ty}\n\
        App value: {app_val}"
    )]
    Serialize {
        source: Box<DynError>,
        app_ty: &'static str,
        db_ty: &'static str,
        app_val: String,
    },

    #[error(
        "Failed to deserialize db value into app repr.\n\
        App type: {app_ty}\n\
        Db type: {db_ty}\n\
        Db value: {db_val}"
    )]
    Deserialize {
        source: Box<DynError>,
        app_ty: &'static str,
        db_ty: &'static str,
        db_val: String,
    },
}

impl Error {
    /// Create an error for an app value that doesn't fit into its db repr `D`.
    pub fn serialize<A: fmt::Debug, D>(
        app_val: &A,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialize {
            source: Box::new(source),
            app_ty: type_name::<A>(),
            db_ty: type_name::<D>(),
            app_val: format!("{app_val:#?}"),
        }
    }

    /// Create an error for a db value that can't be represented as `A`.
    pub fn deserialize<A, D: fmt::Debug>(
        db_val: &D,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Deserialize {
            source: Box::new(source),
            app_ty: type_name::<A>(),
            db_ty: type_name::<D>(),
            db_val: format!("{db_val:#?}"),
        }
    }
}

/// The unix timestamp stored in the database is out of range of [`chrono`]
#[derive(Debug, thiserror::Error)]
#[error("Unix timestamp {secs} is out of the representable range")]
pub struct TimestampOutOfRange {
    pub secs: i64,
}
