use crate::{Error, Result, TimestampOutOfRange};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use teloxide::types::{ChatId, MessageId, UserId};

/// A type that has a database representation specified in [`DbRepresentable::DbRepr`]
pub trait DbRepresentable: fmt::Debug + Sized + Send + Sync + 'static {
    type DbRepr: fmt::Debug + Sized + Send + Sync + 'static;
}

/// A type that can be losslessly converted to database repr.
pub trait IntoDb: DbRepresentable {
    fn into_db(self) -> Self::DbRepr;
}

/// A type that can't be losslessly converted to database repr.
/// Mostly convenient only for mapping the error type to crate's [`Error`].
pub trait TryIntoDb: DbRepresentable {
    fn try_into_db(self) -> Result<Self::DbRepr>;
}

/// A type, that can be fallibly converted from database repr.
pub trait TryFromDb: DbRepresentable {
    fn try_from_db(val: Self::DbRepr) -> Result<Self>;
}

/// Same as [`TryFromDb`], but represents a mirror side of the conversion.
/// It is automatically implemented for any type, that implements [`TryFromDb`].
pub trait TryIntoApp<A> {
    fn try_into_app(self) -> Result<A>;
}

impl<A: TryFromDb> TryIntoApp<A> for A::DbRepr {
    fn try_into_app(self) -> Result<A> {
        A::try_from_db(self)
    }
}

impl<T: DbRepresentable> DbRepresentable for Option<T> {
    type DbRepr = Option<T::DbRepr>;
}

impl<T: IntoDb> IntoDb for Option<T> {
    fn into_db(self) -> Self::DbRepr {
        self.map(IntoDb::into_db)
    }
}

impl<T: TryIntoDb> TryIntoDb for Option<T> {
    fn try_into_db(self) -> Result<Self::DbRepr> {
        self.map(TryIntoDb::try_into_db).transpose()
    }
}

impl<T: TryFromDb> TryFromDb for Option<T> {
    fn try_from_db(val: Self::DbRepr) -> Result<Self> {
        val.map(TryFromDb::try_from_db).transpose()
    }
}

impl<T: DbRepresentable> DbRepresentable for Vec<T> {
    type DbRepr = Vec<T::DbRepr>;
}

impl<T: TryFromDb> TryFromDb for Vec<T> {
    fn try_from_db(val: Self::DbRepr) -> Result<Self> {
        val.into_iter().map(TryFromDb::try_from_db).collect()
    }
}

// Chat ids are signed in telegram, channels and supergroups have
// negative ids starting with `-100`.
impl DbRepresentable for ChatId {
    type DbRepr = i64;
}

impl IntoDb for ChatId {
    fn into_db(self) -> i64 {
        self.0
    }
}

impl TryFromDb for ChatId {
    fn try_from_db(val: i64) -> Result<Self> {
        Ok(ChatId(val))
    }
}

// User ids are unsigned in teloxide, but SQLite has only signed integers.
// Real user ids fit into 52 bits, so the conversion never fails in practice.
impl DbRepresentable for UserId {
    type DbRepr = i64;
}

impl TryIntoDb for UserId {
    fn try_into_db(self) -> Result<i64> {
        i64::try_from(self.0).map_err(|err| Error::serialize::<_, i64>(&self, err))
    }
}

impl TryFromDb for UserId {
    fn try_from_db(val: i64) -> Result<Self> {
        u64::try_from(val)
            .map(UserId)
            .map_err(|err| Error::deserialize::<Self, _>(&val, err))
    }
}

impl DbRepresentable for MessageId {
    type DbRepr = i64;
}

impl IntoDb for MessageId {
    fn into_db(self) -> i64 {
        self.0.into()
    }
}

impl TryFromDb for MessageId {
    fn try_from_db(val: i64) -> Result<Self> {
        i32::try_from(val)
            .map(MessageId)
            .map_err(|err| Error::deserialize::<Self, _>(&val, err))
    }
}

/// Timestamps are stored as unix seconds. This keeps them comparable in
/// plain SQL and free of any timezone ambiguity.
impl DbRepresentable for DateTime<Utc> {
    type DbRepr = i64;
}

impl IntoDb for DateTime<Utc> {
    fn into_db(self) -> i64 {
        self.timestamp()
    }
}

impl TryFromDb for DateTime<Utc> {
    fn try_from_db(secs: i64) -> Result<Self> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::deserialize::<Self, _>(&secs, TimestampOutOfRange { secs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_out_of_range() {
        let err = UserId(u64::MAX).try_into_db().unwrap_err();
        assert!(matches!(err, Error::Serialize { .. }), "{err:#?}");

        let err = UserId::try_from_db(-1).unwrap_err();
        assert!(matches!(err, Error::Deserialize { .. }), "{err:#?}");
    }

    #[test]
    fn timestamps_are_unix_seconds() {
        let dt = Utc.with_ymd_and_hms(2024, 12, 25, 12, 30, 0).unwrap();
        assert_eq!(dt.into_db(), 1_735_129_800);

        let back: DateTime<Utc> = 1_735_129_800_i64.try_into_app().unwrap();
        assert_eq!(back, dt);

        assert!(DateTime::<Utc>::try_from_db(i64::MAX).is_err());
    }

    #[test]
    fn optional_values() {
        let none: Option<MessageId> = None;
        assert_eq!(none.into_db(), None);

        let some: Option<MessageId> = Some(42_i64).try_into_app().unwrap();
        assert_eq!(some, Some(MessageId(42)));
    }
}
