use easy_ext::ext;

#[ext(ErrorExt)]
pub impl sqlx::Error {
    /// SQLite doesn't report constraint names, so we can only detect
    /// the class of the violated constraint.
    fn is_foreign_key_violation(&self) -> bool {
        self.as_database_error()
            .map(|err| err.is_foreign_key_violation())
            .unwrap_or(false)
    }
}
