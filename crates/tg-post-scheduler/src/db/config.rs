use serde::Deserialize;

#[derive(Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_database_url")]
    pub(crate) url: String,

    #[serde(default = "default_database_pool_size")]
    pub(crate) pool_size: u32,
}

fn default_database_url() -> String {
    "sqlite://scheduler.db".to_owned()
}

fn default_database_pool_size() -> u32 {
    // SQLite serializes the writers anyway, there is no point in
    // having a lot of connections.
    8
}
