//! Missing batteries for [`sqlx`] when the storage is SQLite.
//!
//! SQLite has a very narrow set of storage classes, so most of the app-level
//! types end up as `INTEGER` or `TEXT` columns. This crate defines the
//! conversion traits between the app types and their database representation,
//! and implements them for the types the bot persists.

mod conv;
mod error;
mod misc;

pub use conv::*;
pub use error::*;
pub use misc::*;

pub mod prelude {
    pub use crate::{
        DbRepresentable as _, ErrorExt as _, IntoDb as _, TryFromDb as _, TryIntoApp as _,
        TryIntoDb as _,
    };
}
