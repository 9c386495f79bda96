use config::{Config, ConfigError, Environment, File};
use herald_core::ProducerConfig;

/// Loads producer settings from `config/herald.*` (optional) and `HERALD_*`
/// environment variables. Nested keys use `__`; unset fields keep the
/// `ProducerConfig` defaults.
pub fn load() -> Result<ProducerConfig, ConfigError> {
    from_sources(
        Config::builder()
            .add_source(File::with_name("config/herald").required(false))
            .add_source(
                Environment::with_prefix("HERALD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}

fn from_sources(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<ProducerConfig, ConfigError> {
    builder.build()?.try_deserialize()
}
