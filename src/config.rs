use std::env::{self, VarError};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::{info, instrument, warn};
use url::Url;

/// # Errors
/// Will return [`Err`] if the connection to the database fails.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!("Connecting to database");
    set_db_conn(Database::connect(db_connection_options).await?);

    info!("Container initialized");
    Ok(container)
}

fn read_env_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => Some(value),
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    const ENV_VAR_NAME: &str = "DB_URL";
    read_env_var(ENV_VAR_NAME)
        .unwrap_or_else(|| panic!("{ENV_VAR_NAME} is not set"))
        .into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const ENV_VAR_NAME: &str = "ADDR";
    const DEFAULT_ADDR: &str = "127.0.0.1:3000";

    if let Some(addr) = read_env_var(ENV_VAR_NAME) {
        info!(addr, "{ENV_VAR_NAME} environment variable set");
        addr
    } else {
        warn!(
            addr = DEFAULT_ADDR,
            "{ENV_VAR_NAME} environment variable not set; defaulting to {DEFAULT_ADDR}"
        );
        DEFAULT_ADDR.to_owned()
    }
}

/// Origin that links to pastes are built from, always ending in `/`.
///
/// # Panics
/// Panics when environment variable is invalid or is not a base URL.
pub fn base_url_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "BASE_URL";

    let base_url = read_env_var(ENV_VAR_NAME).unwrap_or_else(|| {
        let fallback = format!("http://{}", get.as_ref(addr_capsule));
        warn!(
            base_url = fallback,
            "{ENV_VAR_NAME} environment variable not set; deriving it from the listen address"
        );
        fallback
    });

    let mut base_url = Url::parse(&base_url)
        .unwrap_or_else(|err| panic!("{ENV_VAR_NAME} is not a valid URL: {err}"));
    assert!(
        !base_url.cannot_be_a_base(),
        "{ENV_VAR_NAME} must be usable as a base URL"
    );
    normalize_base_url(&mut base_url);
    base_url
}

fn normalize_base_url(base_url: &mut Url) {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
}

/// Whether requests may override the current time, for deterministic tests.
///
/// # Panics
/// Panics when environment variable is invalid.
pub fn test_mode_capsule(_: CapsuleHandle) -> bool {
    const ENV_VAR_NAME: &str = "TEST_MODE";

    let test_mode = read_env_var(ENV_VAR_NAME).is_some_and(|value| value == "1");
    if test_mode {
        warn!("{ENV_VAR_NAME} is enabled; requests may override the current time");
    }
    test_mode
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_appends_slash() {
        let mut base_url = Url::parse("https://paste.example.com/app").unwrap();
        normalize_base_url(&mut base_url);
        assert_eq!(base_url.as_str(), "https://paste.example.com/app/");
        assert_eq!(
            base_url.join("p/abc").unwrap().as_str(),
            "https://paste.example.com/app/p/abc"
        );
    }

    #[test]
    fn test_normalize_base_url_keeps_root() {
        let mut base_url = Url::parse("http://127.0.0.1:3000").unwrap();
        normalize_base_url(&mut base_url);
        assert_eq!(base_url.as_str(), "http://127.0.0.1:3000/");
    }
}
