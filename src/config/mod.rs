/// Configuration loaded from TOML, with defaults for every section

pub mod settings;

pub use settings::*;
