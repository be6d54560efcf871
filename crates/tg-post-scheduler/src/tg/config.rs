use serde::Deserialize;
use teloxide::types::UserId;

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) bot_token: String,

    /// Comma-separated ids of the users that are always admins. They are
    /// seeded into the database on startup and can't be removed via the bot.
    #[serde(default)]
    pub(crate) admin_ids: Vec<UserId>,
}

impl Config {
    pub(crate) fn is_config_admin(&self, user_id: UserId) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_ids_are_comma_separated() {
        let env = [
            ("BOT_TOKEN".to_owned(), "token".to_owned()),
            ("ADMIN_IDS".to_owned(), "1,22,333".to_owned()),
        ];

        let config: Config = envy::from_iter(env).unwrap();

        assert_eq!(config.admin_ids, [UserId(1), UserId(22), UserId(333)]);
        assert!(config.is_config_admin(UserId(22)));
        assert!(!config.is_config_admin(UserId(2)));
    }

    #[test]
    fn admin_ids_are_optional() {
        let env = [("BOT_TOKEN".to_owned(), "token".to_owned())];

        let config: Config = envy::from_iter(env).unwrap();

        assert!(config.admin_ids.is_empty());
    }
}
