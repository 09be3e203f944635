/**
 * Link configuration and its TOML loader.
 */
pub mod link_configuration;
