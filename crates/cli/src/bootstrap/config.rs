use doqfwd_domain::{CliOverrides, Config};

/// Loads the file (or defaults), layers CLI flags on top and validates.
pub fn load_config(config_path: Option<&str>, cli_overrides: CliOverrides) -> anyhow::Result<Config> {
    let config = Config::load(config_path, cli_overrides)?;
    config.validate()?;
    Ok(config)
}
