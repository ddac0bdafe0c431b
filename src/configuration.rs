use std::path::Path;

#[derive(serde::Deserialize, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub tls: TlsSettings,
}

#[derive(serde::Deserialize, Debug)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

#[derive(serde::Deserialize, Debug)]
pub struct DatabaseSettings {
    /// Single database file, relative to the working directory.
    pub path: String,
}

#[derive(serde::Deserialize, Debug)]
pub struct TlsSettings {
    pub certificate: String,
    pub private_key: String,
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = Path::new(env!("CARGO_MANIFEST_DIR"));
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT.");
    let environment_filename = format!("{}.yaml", environment.as_str());

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        // Environment variables win over the yaml layers when set
        .set_override_option("application.host", std::env::var("APPLICATION_HOST").ok())?
        .set_override_option("application.port", std::env::var("APPLICATION_PORT").ok())?
        .set_override_option("database.path", std::env::var("DATABASE_PATH").ok())?
        .build()?;
    settings.try_deserialize::<Settings>()
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}
